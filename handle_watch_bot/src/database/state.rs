use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use teloxide::types::UserId;

use super::types::{
    AssignOutcome, GlobalStats, Role, Stats, SubscriptionStatus, UserInfo, UserOverview,
};
use crate::{
    list_store::{AssignError, AssignResult, ListStore},
    Handle, ListKind,
};

/// All of the bot's state. Lives in memory behind the database's lock, and gets written
/// out as a whole.
#[derive(Clone, Debug)]
pub struct BotState {
    pub lists: ListStore,
    pub users: HashMap<UserId, UserInfo>,
    /// Admins besides the owner.
    pub admins: BTreeSet<UserId>,
    pub stats: Stats,
    /// Not saved; comes from the config on every start.
    pub(super) owner: UserId,
    /// Not saved; comes from the config on every start.
    pub(super) max_watch_per_user: usize,
}

impl BotState {
    #[must_use]
    pub fn new(owner: UserId, max_watch_per_user: usize) -> Self {
        Self {
            lists: ListStore::new(),
            users: HashMap::new(),
            admins: BTreeSet::new(),
            stats: Stats::default(),
            owner,
            max_watch_per_user,
        }
    }

    #[must_use]
    pub fn role_of(&self, user: UserId) -> Role {
        if user == self.owner {
            Role::Owner
        } else if self.admins.contains(&user) {
            Role::Admin
        } else {
            Role::User
        }
    }

    #[must_use]
    pub fn is_admin(&self, user: UserId) -> bool {
        self.role_of(user) != Role::User
    }

    #[must_use]
    pub fn subscription_status(&self, user: UserId, now: DateTime<Utc>) -> SubscriptionStatus {
        if self.is_admin(user) {
            return SubscriptionStatus::Unlimited;
        }

        match self.users.get(&user).and_then(|u| u.expiry) {
            None => SubscriptionStatus::NoSubscription,
            Some(expiry) if expiry < now => SubscriptionStatus::Expired(expiry),
            Some(expiry) => SubscriptionStatus::Active(expiry),
        }
    }

    /// Watch list cap for this user, or [`None`] if they have none.
    #[must_use]
    pub fn cap_for(&self, user: UserId) -> Option<usize> {
        (!self.is_admin(user)).then_some(self.max_watch_per_user)
    }

    /// Remember this user if we haven't seen them before. Returns `true` if they're new.
    pub fn register_user(&mut self, user: UserId, now: DateTime<Utc>) -> bool {
        if self.users.contains_key(&user) {
            return false;
        }
        self.users.insert(
            user,
            UserInfo {
                joined: now,
                expiry: None,
            },
        );
        true
    }

    /// Give `user` a subscription running `days` days from `now`, replacing whatever
    /// they had. Returns the new expiry, or [`None`] without changing anything if that
    /// date can't be represented.
    pub fn approve(
        &mut self,
        user: UserId,
        days: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let expiry = Duration::try_days(i64::from(days))
            .and_then(|span| now.checked_add_signed(span))?;
        self.users
            .entry(user)
            .or_insert(UserInfo {
                joined: now,
                expiry: None,
            })
            .expiry = Some(expiry);
        Some(expiry)
    }

    /// Returns `false` if they already were an admin (or the owner).
    pub fn add_admin(&mut self, user: UserId) -> bool {
        if user == self.owner {
            return false;
        }
        self.admins.insert(user)
    }

    /// Subscription and capacity checks a user command has to pass, then the actual
    /// assignment. The cap is checked against [`ListStore::count_for`] before anything
    /// is changed.
    pub fn request_assign(
        &mut self,
        owner: UserId,
        handle: &Handle,
        list: ListKind,
        now: DateTime<Utc>,
    ) -> AssignOutcome {
        let subscription = self.subscription_status(owner, now);
        if !subscription.is_active() {
            return AssignOutcome::SubscriptionInactive(subscription);
        }

        if let Some(entry) = self.lists.get(handle) {
            if entry.owner != owner {
                return AssignOutcome::TakenByAnotherUser;
            }
            if entry.list == list {
                // Re-adding is fine even with a full list. It's a no-op anyway.
                return AssignOutcome::Assigned(AssignResult::AlreadyPresent(list));
            }
        }

        if list == ListKind::Watched {
            if let Some(cap) = self.cap_for(owner) {
                if self.lists.count_for(owner, ListKind::Watched) >= cap {
                    return AssignOutcome::CapacityExceeded { cap };
                }
            }
        }

        match self.lists.assign(owner, handle, list, now) {
            Ok(result) => AssignOutcome::Assigned(result),
            Err(AssignError::OwnedByAnotherUser(_)) => AssignOutcome::TakenByAnotherUser,
        }
    }

    #[must_use]
    pub fn overview(&self, user: UserId, now: DateTime<Utc>) -> UserOverview {
        UserOverview {
            role: self.role_of(user),
            subscription: self.subscription_status(user, now),
            cap: self.cap_for(user),
            watched: self.lists.list_for(user, ListKind::Watched),
            flagged: self.lists.list_for(user, ListKind::Flagged),
            stats: self.stats,
        }
    }

    #[must_use]
    pub fn global_stats(&self, now: DateTime<Utc>) -> GlobalStats {
        GlobalStats {
            users: self.users.len(),
            admins: self.admins.len(),
            active_subscriptions: self
                .users
                .values()
                .filter(|u| u.expiry.is_some_and(|e| e > now))
                .count(),
            watched: self.lists.total_on(ListKind::Watched),
            flagged: self.lists.total_on(ListKind::Flagged),
            stats: self.stats,
        }
    }
}
