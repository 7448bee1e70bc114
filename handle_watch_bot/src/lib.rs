//! Source code for a bot that watches social media handles for bans and
//! reactivations, and tells whoever added them when that happens.

/// Various types used throughout.
mod types;
pub use types::*;

/// The anti-flap filter: a status has to be seen several polls in a row before
/// anything is done about it.
pub mod confirmation;

/// Who watches which handle, and on which list.
pub mod list_store;

/// The database, i.e. all state plus its SQLite backing.
pub mod database;

/// Checking the status of a handle.
pub mod probe;

/// Telling users about confirmed status changes.
pub mod alerts;

/// The periodic job that checks every tracked handle.
pub mod monitor;

/// Settings loaded at startup.
pub mod config;

/// Functions that handle events from Telegram.
mod handlers;

/// Entry function that starts the bot.
mod entry;
pub use entry::*;

use std::time::Duration;

/// How many polls in a row must agree before a status change is acted upon.
pub const CONFIRMATION_THRESHOLD: u32 = 3;

/// Time between two sweeps over all tracked handles.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Time to wait after a sweep blew up before trying again.
pub const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between two probes inside one sweep, to not hammer the profile source.
pub const PROBE_SPACING: Duration = Duration::from_secs(2);

/// How many handles a user without unlimited capacity may keep on the watched list.
pub const DEFAULT_MAX_WATCH_PER_USER: usize = 20;
