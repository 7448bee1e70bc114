use std::{path::PathBuf, str::FromStr, time::Duration};

use teloxide::types::UserId;

use crate::{CHECK_INTERVAL, DEFAULT_MAX_WATCH_PER_USER, PROBE_SPACING, RECOVERY_INTERVAL};

/// Settings that can change between deployments. The bot key isn't here, it's read from
/// the `key`/`key_debug` file on startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// `OWNER_ID`. Can do everything, including making admins.
    pub owner: UserId,
    /// `ADMIN_IDS`, comma separated. More can be added at runtime with `/addadmin`.
    pub admins: Vec<UserId>,
    /// `MAX_WATCH_PER_USER`.
    pub max_watch_per_user: usize,
    /// `CHECK_INTERVAL_SECS`.
    pub check_interval: Duration,
    pub recovery_interval: Duration,
    pub probe_spacing: Duration,
    /// `DATABASE_PATH`.
    pub database_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: UserId(0),
            admins: Vec::new(),
            max_watch_per_user: DEFAULT_MAX_WATCH_PER_USER,
            check_interval: CHECK_INTERVAL,
            recovery_interval: RECOVERY_INTERVAL,
            probe_spacing: PROBE_SPACING,
            database_path: PathBuf::from("handle_watch.sqlite"),
        }
    }
}

impl Config {
    /// Read the config from environment variables. Anything missing or broken falls back
    /// to the default, with a warning if it was broken.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let owner = parse_or(&lookup, "OWNER_ID", defaults.owner.0);
        if owner == 0 {
            log::warn!("OWNER_ID is not set. Nobody will be able to add admins.");
        }

        let check_interval = match parse_or(
            &lookup,
            "CHECK_INTERVAL_SECS",
            defaults.check_interval.as_secs(),
        ) {
            0 => {
                log::warn!("Ignoring CHECK_INTERVAL_SECS: must be at least 1");
                defaults.check_interval
            }
            secs => Duration::from_secs(secs),
        };

        Self {
            owner: UserId(owner),
            admins: lookup("ADMIN_IDS")
                .map(|ids| parse_id_list(&ids))
                .unwrap_or_default(),
            max_watch_per_user: parse_or(
                &lookup,
                "MAX_WATCH_PER_USER",
                defaults.max_watch_per_user,
            ),
            check_interval,
            database_path: lookup("DATABASE_PATH")
                .filter(|path| !path.is_empty())
                .map_or(defaults.database_path, PathBuf::from),
            ..defaults
        }
    }
}

fn parse_or<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    let Some(value) = lookup(name) else {
        return default;
    };
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            log::warn!("Ignoring {name}: can't parse {value:?}");
            default
        }
    }
}

/// Parse a comma separated list of user IDs, skipping (and complaining about) junk.
#[must_use]
pub fn parse_id_list(ids: &str) -> Vec<UserId> {
    ids.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter_map(|id| match id.parse() {
            Ok(id) => Some(UserId(id)),
            Err(_) => {
                log::warn!("Ignoring invalid admin ID {id:?}");
                None
            }
        })
        .collect()
}
