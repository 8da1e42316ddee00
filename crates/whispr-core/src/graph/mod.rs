//! Durable follow graph.
//!
//! Every mutation locks the records it touches (two at most, taken in id
//! order) and persists them before returning. There is no store-wide lock, so
//! mutations on disjoint users run concurrently.

pub mod disk;
pub mod record;

use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    domain::UserId,
    errors::InvalidIntent,
    graph::{disk::RecordFiles, record::UserRecord},
    utils::iso_timestamp_utc,
    Result,
};

/// Whether a mutation changed anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Applied,
    Unchanged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InviteOutcome {
    Invited,
    AlreadyInvited,
    /// The invitee already follows the inviter.
    AlreadyFollowing,
}

const MAX_NAME_CHARS: usize = 32;

type Slot = Arc<Mutex<UserRecord>>;

pub struct GraphStore {
    files: RecordFiles,
    users: Mutex<HashMap<UserId, Slot>>,
    /// Lowercased display name -> owner.
    names: Mutex<HashMap<String, UserId>>,
}

impl GraphStore {
    /// Open (or create) the store under `data_dir` and load every record.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let files = RecordFiles::open(data_dir)?;
        let mut users = HashMap::new();
        let mut names = HashMap::new();

        for record in files.load_all()? {
            if let Some(name) = &record.name {
                names.insert(name.to_lowercase(), record.id.clone());
            }
            users.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        }

        tracing::info!(
            users = users.len(),
            dir = %files.dir().display(),
            "graph store loaded"
        );

        Ok(Self {
            files,
            users: Mutex::new(users),
            names: Mutex::new(names),
        })
    }

    async fn slot(&self, id: &UserId) -> Slot {
        let mut map = self.users.lock().await;
        map.entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UserRecord::empty(id.clone()))))
            .clone()
    }

    async fn existing_slot(&self, id: &UserId) -> Option<Slot> {
        self.users.lock().await.get(id).cloned()
    }

    /// Lock two distinct users in id order; guards come back as `(a, b)`.
    async fn lock_pair(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> (OwnedMutexGuard<UserRecord>, OwnedMutexGuard<UserRecord>) {
        debug_assert_ne!(a, b);
        let slot_a = self.slot(a).await;
        let slot_b = self.slot(b).await;
        if a < b {
            let ga = slot_a.lock_owned().await;
            let gb = slot_b.lock_owned().await;
            (ga, gb)
        } else {
            let gb = slot_b.lock_owned().await;
            let ga = slot_a.lock_owned().await;
            (ga, gb)
        }
    }

    /// Persist changed records, then publish them to memory.
    ///
    /// If the second write fails the first is rolled back on disk, so either
    /// both sides of an edge land or neither does.
    fn commit_pair(
        &self,
        ga: &mut UserRecord,
        next_a: UserRecord,
        gb: &mut UserRecord,
        next_b: UserRecord,
    ) -> Result<Change> {
        let a_changed = *ga != next_a;
        let b_changed = *gb != next_b;
        if !a_changed && !b_changed {
            return Ok(Change::Unchanged);
        }

        if a_changed {
            self.files.write(&next_a)?;
        }
        if b_changed {
            if let Err(e) = self.files.write(&next_b) {
                if a_changed {
                    if let Err(rollback) = self.files.write(ga) {
                        tracing::error!(
                            user = %ga.id,
                            "failed to roll back record after partial write: {rollback}"
                        );
                    }
                }
                return Err(e);
            }
        }

        *ga = next_a;
        *gb = next_b;
        Ok(Change::Applied)
    }

    fn commit_one(&self, guard: &mut UserRecord, next: UserRecord) -> Result<Change> {
        if *guard == next {
            return Ok(Change::Unchanged);
        }
        self.files.write(&next)?;
        *guard = next;
        Ok(Change::Applied)
    }

    /// Record first contact. Returns `true` if this is a new user.
    pub async fn ensure_user(&self, id: &UserId) -> Result<bool> {
        let slot = self.slot(id).await;
        let mut guard = slot.lock().await;
        if guard.first_seen.is_some() {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.first_seen = Some(iso_timestamp_utc());
        self.commit_one(&mut guard, next)?;
        Ok(true)
    }

    pub async fn get(&self, id: &UserId) -> Option<UserRecord> {
        let slot = self.existing_slot(id).await?;
        let record = slot.lock().await.clone();
        Some(record)
    }

    /// Display label for `id` (name if set, else the id).
    pub async fn label(&self, id: &UserId) -> String {
        match self.get(id).await {
            Some(r) => r.label(),
            None => id.to_string(),
        }
    }

    /// Users who have contacted the bot at least once, in id order.
    pub async fn known_users(&self) -> Vec<UserId> {
        let slots: Vec<Slot> = self.users.lock().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let record = slot.lock().await;
            if record.first_seen.is_some() {
                out.push(record.id.clone());
            }
        }
        out.sort();
        out
    }

    /// `a` starts receiving `b`'s posts.
    pub async fn follow(&self, a: &UserId, b: &UserId) -> Result<Change> {
        if a == b {
            return Err(InvalidIntent::SelfFollow.into());
        }
        let (mut ga, mut gb) = self.lock_pair(a, b).await;
        let mut next_a = ga.clone();
        let mut next_b = gb.clone();
        next_a.following.insert(b.clone());
        next_b.followers.insert(a.clone());
        next_b.pending_invites.remove(a);
        self.commit_pair(&mut ga, next_a, &mut gb, next_b)
    }

    /// `a` stops receiving `b`'s posts.
    pub async fn unfollow(&self, a: &UserId, b: &UserId) -> Result<Change> {
        if a == b {
            return Ok(Change::Unchanged);
        }
        if self.existing_slot(a).await.is_none() || self.existing_slot(b).await.is_none() {
            return Ok(Change::Unchanged);
        }
        let (mut ga, mut gb) = self.lock_pair(a, b).await;
        let mut next_a = ga.clone();
        let mut next_b = gb.clone();
        next_a.following.remove(b);
        next_b.followers.remove(a);
        self.commit_pair(&mut ga, next_a, &mut gb, next_b)
    }

    /// Drop `follower` from `a`'s followers without blocking them.
    pub async fn remove_follower(&self, a: &UserId, follower: &UserId) -> Result<Change> {
        self.unfollow(follower, a).await
    }

    /// `a` invites `b` to follow them.
    pub async fn invite(&self, a: &UserId, b: &UserId) -> Result<InviteOutcome> {
        if a == b {
            return Err(InvalidIntent::SelfInvite.into());
        }
        let slot = self.slot(a).await;
        let mut guard = slot.lock().await;
        if guard.followers.contains(b) {
            return Ok(InviteOutcome::AlreadyFollowing);
        }
        if guard.pending_invites.contains(b) {
            return Ok(InviteOutcome::AlreadyInvited);
        }
        let mut next = guard.clone();
        next.pending_invites.insert(b.clone());
        self.commit_one(&mut guard, next)?;
        Ok(InviteOutcome::Invited)
    }

    /// `b` accepts `a`'s invite: `b` follows `a` and the invite is cleared.
    pub async fn accept_invite(&self, b: &UserId, a: &UserId) -> Result<()> {
        if a == b {
            return Err(InvalidIntent::SelfFollow.into());
        }
        if self.existing_slot(a).await.is_none() {
            return Err(InvalidIntent::NoPendingInvite(a.clone()).into());
        }
        let (mut ga, mut gb) = self.lock_pair(a, b).await;
        if !ga.pending_invites.contains(b) {
            return Err(InvalidIntent::NoPendingInvite(a.clone()).into());
        }
        let mut next_a = ga.clone();
        let mut next_b = gb.clone();
        next_a.pending_invites.remove(b);
        next_a.followers.insert(b.clone());
        next_b.following.insert(a.clone());
        self.commit_pair(&mut ga, next_a, &mut gb, next_b)?;
        Ok(())
    }

    /// `b` turns down `a`'s invite.
    pub async fn decline_invite(&self, b: &UserId, a: &UserId) -> Result<()> {
        let Some(slot) = self.existing_slot(a).await else {
            return Err(InvalidIntent::NoPendingInvite(a.clone()).into());
        };
        let mut guard = slot.lock().await;
        if !guard.pending_invites.contains(b) {
            return Err(InvalidIntent::NoPendingInvite(a.clone()).into());
        }
        let mut next = guard.clone();
        next.pending_invites.remove(b);
        self.commit_one(&mut guard, next)?;
        Ok(())
    }

    /// `a` stops receiving anything from `b`. Follow edges are untouched.
    pub async fn block(&self, a: &UserId, b: &UserId) -> Result<Change> {
        if a == b {
            return Err(InvalidIntent::SelfBlock.into());
        }
        let slot = self.slot(a).await;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        next.blocked.insert(b.clone());
        self.commit_one(&mut guard, next)
    }

    pub async fn unblock(&self, a: &UserId, b: &UserId) -> Result<Change> {
        let slot = self.slot(a).await;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        next.blocked.remove(b);
        self.commit_one(&mut guard, next)
    }

    pub async fn set_opted_out(&self, a: &UserId, opted_out: bool) -> Result<Change> {
        let slot = self.slot(a).await;
        let mut guard = slot.lock().await;
        let mut next = guard.clone();
        next.opted_out = opted_out;
        self.commit_one(&mut guard, next)
    }

    /// Set a unique display name (case-insensitive uniqueness).
    pub async fn set_name(&self, a: &UserId, name: &str) -> Result<()> {
        let name = name.trim();
        if !is_valid_name(name) {
            return Err(InvalidIntent::InvalidName(name.to_string()).into());
        }
        let key = name.to_lowercase();

        let mut names = self.names.lock().await;
        if let Some(owner) = names.get(&key) {
            if owner != a {
                return Err(InvalidIntent::NameTaken(name.to_string()).into());
            }
        }

        let slot = self.slot(a).await;
        let mut guard = slot.lock().await;
        let previous = guard.name.as_ref().map(|n| n.to_lowercase());
        let mut next = guard.clone();
        next.name = Some(name.to_string());
        self.commit_one(&mut guard, next)?;

        if let Some(prev) = previous {
            names.remove(&prev);
        }
        names.insert(key, a.clone());
        Ok(())
    }
}

fn is_valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_NAME_CHARS).contains(&len)
        && !name.chars().any(char::is_whitespace)
        && !name.starts_with('+')
        && !name.starts_with('/')
}
