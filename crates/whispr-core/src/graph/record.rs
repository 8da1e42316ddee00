use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::UserId;

/// Relationship state for one user, stored as one JSON document.
///
/// `followers` and `following` are stored on both ends of every edge; the
/// store keeps them mirrored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    #[serde(default)]
    pub followers: BTreeSet<UserId>,
    #[serde(default)]
    pub following: BTreeSet<UserId>,
    /// Users this user invited who have not answered yet.
    #[serde(default)]
    pub pending_invites: BTreeSet<UserId>,
    /// Users whose posts this user never receives.
    #[serde(default)]
    pub blocked: BTreeSet<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Global "stop messaging me".
    #[serde(default)]
    pub opted_out: bool,
    /// RFC3339 time of the first inbound message; `None` for users that have
    /// only been named as a command target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
}

impl UserRecord {
    pub fn empty(id: UserId) -> Self {
        Self {
            id,
            followers: BTreeSet::new(),
            following: BTreeSet::new(),
            pending_invites: BTreeSet::new(),
            blocked: BTreeSet::new(),
            name: None,
            opted_out: false,
            first_seen: None,
        }
    }

    /// Display label: the chosen name, else the id.
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn has_blocked(&self, other: &UserId) -> bool {
        self.blocked.contains(other)
    }
}
