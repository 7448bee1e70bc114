mod state;
mod types;

pub use state::BotState;
pub use types::*;

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Executor, Row, Sqlite,
};
use teloxide::types::UserId;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    config::Config,
    confirmation::{ConfirmationTracker, PendingConfirmation},
    list_store::{AssignError, AssignResult, ListStore, TrackedEntry},
    Handle, ListKind, ProbeStatus,
};

type Pool = sqlx::Pool<Sqlite>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Failed to (de)serialize stored profile details: {0}")]
    Json(#[from] serde_json::Error),
}

/// All state of the bot. Everything is served from memory; SQLite is only there so it
/// survives restarts, and gets rewritten as a whole by [`Database::save`].
pub struct Database {
    pool: Pool,
    state: Mutex<BotState>,
    /// Held for the duration of a save, so that two saves never interleave.
    write_lock: Mutex<()>,
}

impl Database {
    /// Open (or create) the database file from the config and load everything from it.
    pub async fn open(config: &Config) -> Result<Arc<Database>, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(&config.database_path)
                    .create_if_missing(true)
                    .pragma("cache_size", "-32768")
                    .busy_timeout(Duration::from_secs(600)),
            )
            .await?;

        // TRACKED:
        // handle (unique primary key, string)
        // owner (telegram user ID; i64 because sqlite doesn't support u64)
        // list (0 for watched, 1 for flagged)
        // added_at (date+time in UTC, when it got onto its current list)
        // seq (insertion counter, for ordering)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS tracked (
                handle TEXT PRIMARY KEY NOT NULL,
                owner INTEGER NOT NULL,
                list INTEGER NOT NULL,
                added_at TEXT NOT NULL,
                seq INTEGER NOT NULL
            ) STRICT;",
        ))
        .await?;

        // PENDING:
        // handle (unique primary key, string)
        // status (probe status code, see `ProbeStatus`)
        // streak (polls in a row that saw `status`)
        // last_checked_at (date+time in UTC)
        // details (latest profile details as JSON, may be NULL)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS pending (
                handle TEXT PRIMARY KEY NOT NULL,
                status INTEGER NOT NULL,
                streak INTEGER NOT NULL,
                last_checked_at TEXT NOT NULL,
                details TEXT NULL
            ) STRICT;",
        ))
        .await?;

        // USERS:
        // userid (key, i64)
        // joined (date+time in UTC)
        // expiry (date+time in UTC, NULL if never subscribed)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                userid INTEGER PRIMARY KEY NOT NULL,
                joined TEXT NOT NULL,
                expiry TEXT NULL
            ) STRICT;",
        ))
        .await?;

        // ADMINS:
        // userid (key, i64)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS admins (
                userid INTEGER PRIMARY KEY NOT NULL
            ) STRICT;",
        ))
        .await?;

        // STATS:
        // name (key, string)
        // value (i64)
        pool.execute(sqlx::query(
            "CREATE TABLE IF NOT EXISTS stats (
                name TEXT PRIMARY KEY NOT NULL,
                value INTEGER NOT NULL
            ) STRICT;",
        ))
        .await?;

        let mut state = load_state(&pool, config).await?;
        for admin in &config.admins {
            state.add_admin(*admin);
        }

        log::info!(
            "Loaded {} watched and {} flagged handles of {} users.",
            state.lists.total_on(ListKind::Watched),
            state.lists.total_on(ListKind::Flagged),
            state.users.len()
        );

        Ok(Arc::new(Database {
            pool,
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
        }))
    }

    /// Lock the state for a read-modify-write. Don't hold this across anything slow.
    pub async fn lock(&self) -> MutexGuard<'_, BotState> {
        self.state.lock().await
    }

    /// Write the whole state out in one transaction.
    pub async fn save(&self) -> Result<(), Error> {
        let _writing = self.write_lock.lock().await;
        let state = self.state.lock().await.clone();

        let mut tx = self.pool.begin().await?;

        for statement in [
            "DELETE FROM tracked;",
            "DELETE FROM pending;",
            "DELETE FROM users;",
            "DELETE FROM admins;",
            "DELETE FROM stats;",
        ] {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        for (handle, entry) in state.lists.entries() {
            sqlx::query(
                "INSERT INTO tracked(handle, owner, list, added_at, seq)
                VALUES (?, ?, ?, ?, ?);",
            )
            .bind(handle.as_str())
            .bind(user_to_db(entry.owner))
            .bind(entry.list.code())
            .bind(entry.added_at)
            .bind(i64::try_from(entry.seq).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
        }

        for (handle, pending) in state.lists.confirmations().iter() {
            let details = pending
                .details
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                "INSERT INTO pending(handle, status, streak, last_checked_at, details)
                VALUES (?, ?, ?, ?, ?);",
            )
            .bind(handle.as_str())
            .bind(pending.observed_status.code())
            .bind(pending.streak)
            .bind(pending.last_checked_at)
            .bind(details)
            .execute(&mut *tx)
            .await?;
        }

        for (user, info) in &state.users {
            sqlx::query("INSERT INTO users(userid, joined, expiry) VALUES (?, ?, ?);")
                .bind(user_to_db(*user))
                .bind(info.joined)
                .bind(info.expiry)
                .execute(&mut *tx)
                .await?;
        }

        for admin in &state.admins {
            sqlx::query("INSERT INTO admins(userid) VALUES (?);")
                .bind(user_to_db(*admin))
                .execute(&mut *tx)
                .await?;
        }

        for (name, value) in [
            ("total_sweeps", state.stats.total_sweeps),
            ("alerts_sent", state.stats.alerts_sent),
        ] {
            sqlx::query("INSERT INTO stats(name, value) VALUES (?, ?);")
                .bind(name)
                .bind(i64::try_from(value).unwrap_or(i64::MAX))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// [`Self::save`], but a failure only gets logged. Memory stays the source of truth
    /// and the next successful save catches the file up.
    pub async fn save_or_log(&self) {
        if let Err(e) = self.save().await {
            log::error!("Failed to save the database: {e}");
        }
    }

    /// Remember a user that talked to the bot.
    pub async fn register_user(&self, user: UserId) {
        let new = self.lock().await.register_user(user, Utc::now());
        if new {
            log::debug!("New user: {user}");
            self.save_or_log().await;
        }
    }

    pub async fn is_admin(&self, user: UserId) -> bool {
        self.lock().await.is_admin(user)
    }

    pub async fn is_owner(&self, user: UserId) -> bool {
        self.lock().await.role_of(user) == Role::Owner
    }

    /// Owners and admins track as much as they like.
    pub async fn has_unlimited_capacity(&self, user: UserId) -> bool {
        self.lock().await.is_admin(user)
    }

    pub async fn subscription_active(&self, user: UserId) -> bool {
        self.subscription_status(user).await.is_active()
    }

    pub async fn subscription_status(&self, user: UserId) -> SubscriptionStatus {
        self.lock().await.subscription_status(user, Utc::now())
    }

    /// Give `user` a subscription for `days` days starting now. Returns the expiry, or
    /// [`None`] if it would land past what a date can hold.
    pub async fn approve(&self, user: UserId, days: u32) -> Option<DateTime<Utc>> {
        let expiry = self.lock().await.approve(user, days, Utc::now())?;
        self.save_or_log().await;
        Some(expiry)
    }

    /// Returns `false` if they already were one.
    pub async fn add_admin(&self, user: UserId) -> bool {
        let added = self.lock().await.add_admin(user);
        if added {
            self.save_or_log().await;
        }
        added
    }

    /// A user asking to put `handle` on `list`: subscription and capacity checks first,
    /// then [`ListStore::assign`].
    pub async fn request_assign(
        &self,
        owner: UserId,
        handle: &Handle,
        list: ListKind,
    ) -> AssignOutcome {
        let outcome = self
            .lock()
            .await
            .request_assign(owner, handle, list, Utc::now());
        if matches!(
            outcome,
            AssignOutcome::Assigned(AssignResult::Added | AssignResult::MovedFromOtherList(_))
        ) {
            self.save_or_log().await;
        }
        outcome
    }

    /// [`ListStore::assign`] without any subscription or capacity checks.
    pub async fn assign(
        &self,
        owner: UserId,
        handle: &Handle,
        list: ListKind,
    ) -> Result<AssignResult, AssignError> {
        let result = self.lock().await.lists.assign(owner, handle, list, Utc::now());
        if matches!(
            result,
            Ok(AssignResult::Added | AssignResult::MovedFromOtherList(_))
        ) {
            self.save_or_log().await;
        }
        result
    }

    /// [`ListStore::remove`].
    pub async fn remove(&self, owner: UserId, handle: &Handle, list: ListKind) -> bool {
        let removed = self.lock().await.lists.remove(owner, handle, list);
        if removed {
            self.save_or_log().await;
        }
        removed
    }

    pub async fn count_for(&self, owner: UserId, list: ListKind) -> usize {
        self.lock().await.lists.count_for(owner, list)
    }

    pub async fn list_for(&self, owner: UserId, list: ListKind) -> Vec<Handle> {
        self.lock().await.lists.list_for(owner, list)
    }

    pub async fn overview(&self, user: UserId) -> UserOverview {
        self.lock().await.overview(user, Utc::now())
    }

    pub async fn global_stats(&self) -> GlobalStats {
        self.lock().await.global_stats(Utc::now())
    }

    /// Everyone who ever talked to the bot.
    pub async fn registered_users(&self) -> Vec<UserId> {
        self.lock().await.users.keys().copied().collect()
    }
}

#[allow(clippy::cast_possible_wrap)]
fn user_to_db(user: UserId) -> i64 {
    user.0 as i64
}

#[allow(clippy::cast_sign_loss)]
fn user_from_db(id: i64) -> UserId {
    UserId(id as u64)
}

async fn load_state(pool: &Pool, config: &Config) -> Result<BotState, Error> {
    let mut state = BotState::new(config.owner, config.max_watch_per_user);

    let entries = sqlx::query("SELECT handle, owner, list, added_at, seq FROM tracked;")
        .fetch_all(pool)
        .await?
        .into_iter()
        .filter_map(|row: SqliteRow| {
            let handle = Handle::new_unchecked(row.get("handle"));
            let Some(list) = ListKind::from_code(row.get("list")) else {
                log::warn!("Skipping {handle} with unknown list in the database");
                return None;
            };
            let entry = TrackedEntry {
                owner: user_from_db(row.get("owner")),
                list,
                added_at: row.get("added_at"),
                seq: u64::try_from(row.get::<i64, _>("seq")).unwrap_or(0),
            };
            Some((handle, entry))
        })
        .collect::<Vec<_>>();

    let mut records = Vec::new();
    for row in sqlx::query("SELECT handle, status, streak, last_checked_at, details FROM pending;")
        .fetch_all(pool)
        .await?
    {
        let handle = Handle::new_unchecked(row.get("handle"));
        let Some(observed_status) = ProbeStatus::from_code(row.get("status")) else {
            log::warn!("Skipping pending record of {handle} with unknown status");
            continue;
        };
        let details = row
            .get::<Option<String>, _>("details")
            .map(|json| serde_json::from_str(&json))
            .transpose()?;

        records.push((
            handle,
            PendingConfirmation {
                observed_status,
                streak: row.get("streak"),
                last_checked_at: row.get("last_checked_at"),
                details,
            },
        ));
    }

    state.lists = ListStore::from_parts(entries, ConfirmationTracker::from_records(records));

    for row in sqlx::query("SELECT userid, joined, expiry FROM users;")
        .fetch_all(pool)
        .await?
    {
        state.users.insert(
            user_from_db(row.get("userid")),
            UserInfo {
                joined: row.get("joined"),
                expiry: row.get("expiry"),
            },
        );
    }

    for row in sqlx::query("SELECT userid FROM admins;")
        .fetch_all(pool)
        .await?
    {
        state.admins.insert(user_from_db(row.get("userid")));
    }

    for row in sqlx::query("SELECT name, value FROM stats;")
        .fetch_all(pool)
        .await?
    {
        let value = u64::try_from(row.get::<i64, _>("value")).unwrap_or(0);
        match row.get::<&str, _>("name") {
            "total_sweeps" => state.stats.total_sweeps = value,
            "alerts_sent" => state.stats.alerts_sent = value,
            other => log::warn!("Unknown stat in the database: {other}"),
        }
    }

    Ok(state)
}
