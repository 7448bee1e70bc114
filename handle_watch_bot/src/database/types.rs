use std::fmt::Display;

use chrono::{DateTime, Utc};

use crate::{list_store::AssignResult, Handle};

/// What we know about a user who talked to the bot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserInfo {
    /// First time they showed up.
    pub joined: DateTime<Utc>,
    /// When their subscription runs out, if they ever had one.
    pub expiry: Option<DateTime<Utc>>,
}

/// Counters shown in `/status` and `/stats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Full sweeps over all tracked handles.
    pub total_sweeps: u64,
    /// Confirmed status changes that were sent off to users.
    pub alerts_sent: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Owner,
    Admin,
    User,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Owner => "Owner",
            Role::Admin => "Admin",
            Role::User => "User",
        })
    }
}

/// Whether a user may track handles right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Owner or admin. No subscription needed, no cap.
    Unlimited,
    /// Paid up until then.
    Active(DateTime<Utc>),
    /// Never had one.
    NoSubscription,
    /// Had one, ran out then.
    Expired(DateTime<Utc>),
}

impl SubscriptionStatus {
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Unlimited | Self::Active(_))
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Active(until) => write!(f, "active until {}", until.format("%Y-%m-%d")),
            Self::NoSubscription => write!(f, "no active subscription"),
            Self::Expired(at) => write!(f, "expired on {}", at.format("%Y-%m-%d")),
        }
    }
}

/// Result of [`Database::request_assign`], the gate user commands go through.
///
/// [`Database::request_assign`]: super::Database::request_assign
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOutcome {
    /// Went through to the list store.
    Assigned(AssignResult),
    /// User can't track anything at the moment.
    SubscriptionInactive(SubscriptionStatus),
    /// User's watch list is full.
    CapacityExceeded { cap: usize },
    /// Somebody else already tracks this handle.
    TakenByAnotherUser,
}

/// Everything `/status` shows about one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOverview {
    pub role: Role,
    pub subscription: SubscriptionStatus,
    /// [`None`] for unlimited users.
    pub cap: Option<usize>,
    pub watched: Vec<Handle>,
    pub flagged: Vec<Handle>,
    pub stats: Stats,
}

/// Everything `/stats` shows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalStats {
    pub users: usize,
    pub admins: usize,
    pub active_subscriptions: usize,
    pub watched: usize,
    pub flagged: usize,
    pub stats: Stats,
}
