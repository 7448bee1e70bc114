//! Every handle belongs to exactly one user and sits on exactly one of their two lists.
//! All moves between lists go through here, and every move forgets whatever pending
//! confirmation the handle had, so an old streak can't fire under the new list.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use teloxide::types::UserId;

use crate::{
    confirmation::{ConfirmationTracker, Observation},
    Handle, ListKind, ProbeStatus, ProfileDetails,
};

/// Where a handle is tracked, and for whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntry {
    pub owner: UserId,
    pub list: ListKind,
    /// When it landed on its current list.
    pub added_at: DateTime<Utc>,
    /// Insertion counter, for listing in the order things were added.
    pub(crate) seq: u64,
}

/// A copy of one [`TrackedEntry`], detached from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSnapshot {
    pub handle: Handle,
    pub owner: UserId,
    pub list: ListKind,
}

/// Result of a successful [`ListStore::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignResult {
    /// It wasn't tracked before, now it is.
    Added,
    /// It's already on this list. Nothing was touched.
    AlreadyPresent(ListKind),
    /// It was on the other list of the same user and got moved over.
    MovedFromOtherList(ListKind),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignError {
    #[error("{0} is already tracked by another user")]
    OwnedByAnotherUser(Handle),
}

/// A system-initiated move, as returned by [`ListStore::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub owner: UserId,
    pub from: ListKind,
    pub to: ListKind,
}

#[derive(Debug, Clone, Default)]
pub struct ListStore {
    entries: HashMap<Handle, TrackedEntry>,
    confirmations: ConfirmationTracker,
    next_seq: u64,
}

impl ListStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the store from saved data. Pending confirmations for handles that aren't
    /// tracked anymore are dropped.
    #[must_use]
    pub fn from_parts(
        entries: impl IntoIterator<Item = (Handle, TrackedEntry)>,
        mut confirmations: ConfirmationTracker,
    ) -> Self {
        let entries: HashMap<Handle, TrackedEntry> = entries.into_iter().collect();
        confirmations.retain(|handle| entries.contains_key(handle));
        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);

        Self {
            entries,
            confirmations,
            next_seq,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Put `handle` on `list` of `owner`.
    ///
    /// # Errors
    ///
    /// Fails if the handle is tracked by someone else.
    pub fn assign(
        &mut self,
        owner: UserId,
        handle: &Handle,
        list: ListKind,
        now: DateTime<Utc>,
    ) -> Result<AssignResult, AssignError> {
        let result = match self.entries.get(handle) {
            Some(entry) if entry.owner != owner => {
                return Err(AssignError::OwnedByAnotherUser(handle.clone()));
            }
            // Leave the streak alone, nothing changes.
            Some(entry) if entry.list == list => return Ok(AssignResult::AlreadyPresent(list)),
            Some(entry) => AssignResult::MovedFromOtherList(entry.list),
            None => AssignResult::Added,
        };

        let seq = self.bump_seq();
        self.entries.insert(
            handle.clone(),
            TrackedEntry {
                owner,
                list,
                added_at: now,
                seq,
            },
        );
        self.confirmations.clear(handle);

        Ok(result)
    }

    /// Take `handle` off `list` of `owner`. Returns `false` if it isn't there, or if it's
    /// someone else's.
    pub fn remove(&mut self, owner: UserId, handle: &Handle, list: ListKind) -> bool {
        match self.entries.get(handle) {
            Some(entry) if entry.owner == owner && entry.list == list => {
                self.entries.remove(handle);
                self.confirmations.clear(handle);
                true
            }
            _ => false,
        }
    }

    /// Move `handle` to the list it isn't on. Only the monitor does this, after a
    /// confirmed status change. Returns [`None`] if the handle isn't tracked (anymore).
    pub fn transition(&mut self, handle: &Handle, now: DateTime<Utc>) -> Option<Transition> {
        let seq = self.bump_seq();
        let entry = self.entries.get_mut(handle)?;

        let from = entry.list;
        entry.list = from.other();
        entry.added_at = now;
        entry.seq = seq;
        let owner = entry.owner;

        self.confirmations.clear(handle);

        Some(Transition {
            owner,
            from,
            to: from.other(),
        })
    }

    /// Feed a probe result into the confirmation tracker.
    pub fn observe(
        &mut self,
        handle: &Handle,
        status: ProbeStatus,
        details: Option<ProfileDetails>,
        now: DateTime<Utc>,
    ) -> Observation {
        self.confirmations.update(handle, status, details, now)
    }

    #[must_use]
    pub fn count_for(&self, owner: UserId, list: ListKind) -> usize {
        self.entries
            .values()
            .filter(|e| e.owner == owner && e.list == list)
            .count()
    }

    /// Handles on `list` of `owner`, oldest first.
    #[must_use]
    pub fn list_for(&self, owner: UserId, list: ListKind) -> Vec<Handle> {
        let mut handles: Vec<(&Handle, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == owner && e.list == list)
            .map(|(h, e)| (h, e.seq))
            .collect();
        handles.sort_unstable_by_key(|(_, seq)| *seq);
        handles.into_iter().map(|(h, _)| h.clone()).collect()
    }

    /// A point-in-time copy of everything tracked: the watched list first, then the
    /// flagged one, each oldest first. Changes to the store don't affect it.
    pub fn all_tracked(&self) -> impl Iterator<Item = TrackedSnapshot> {
        let mut snapshot: Vec<(ListKind, u64, TrackedSnapshot)> = self
            .entries
            .iter()
            .map(|(handle, e)| {
                (
                    e.list,
                    e.seq,
                    TrackedSnapshot {
                        handle: handle.clone(),
                        owner: e.owner,
                        list: e.list,
                    },
                )
            })
            .collect();
        snapshot.sort_unstable_by_key(|(list, seq, _)| (list.code(), *seq));
        snapshot.into_iter().map(|(_, _, s)| s)
    }

    #[must_use]
    pub fn get(&self, handle: &Handle) -> Option<&TrackedEntry> {
        self.entries.get(handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Handle, &TrackedEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn confirmations(&self) -> &ConfirmationTracker {
        &self.confirmations
    }

    /// Size of `list` across all users.
    #[must_use]
    pub fn total_on(&self, list: ListKind) -> usize {
        self.entries.values().filter(|e| e.list == list).count()
    }
}
