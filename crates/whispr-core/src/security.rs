use std::collections::HashSet;

use crate::domain::UserId;

// ============== Admin Gate ==============

/// Fixed set of admin ids, loaded once at start.
#[derive(Clone, Debug, Default)]
pub struct AdminGate {
    admins: HashSet<UserId>,
}

impl AdminGate {
    pub fn new(admins: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            admins: admins.into_iter().collect(),
        }
    }

    pub fn is_admin(&self, user_id: &UserId) -> bool {
        self.admins.contains(user_id)
    }

    pub fn len(&self) -> usize {
        self.admins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.admins.is_empty()
    }
}
