//! Boilerplate every bot here needs: starting up with logging, retrying rate-limited
//! requests, and sending long HTML messages.

use std::future::Future;

pub mod useful_methods;

/// Set up logging and run `main` to completion on a multi-threaded tokio runtime.
///
/// The log filter comes from `RUST_LOG`, or `default_filter` if that isn't set. See
/// [pretty_env_logger][] for the syntax. When running under systemd, timestamps are
/// left out since journald adds its own.
///
/// # Panics
///
/// Panics if the tokio runtime can't be built.
///
/// [pretty_env_logger]: https://docs.rs/pretty_env_logger
pub fn start_everything(default_filter: &str, main: impl Future<Output = ()>) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    let mut logger = if std::env::var_os("JOURNAL_STREAM").is_some() {
        pretty_env_logger::formatted_builder()
    } else {
        pretty_env_logger::formatted_timed_builder()
    };
    logger.parse_filters(&filter);
    if logger.try_init().is_err() {
        log::error!("A logger was already set up, keeping that one.");
    }

    log::info!("Starting up with log filter {filter:?}");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build the tokio runtime!")
        .block_on(main);
}

/// Run a Telegram request expression, and run it again if Telegram tells us
/// to slow down. Gives up after 3 retries and returns whatever came last.
///
/// The expression is evaluated anew on every attempt, so it should include
/// the `.await`:
///
/// ```ignore
/// teloxide_retry!(bot.send_message(chat_id, "hi").await)?;
/// ```
#[macro_export]
macro_rules! teloxide_retry {
    ($request:expr) => {{
        let mut retries: u8 = 0;
        loop {
            match $request {
                Err(::teloxide::RequestError::RetryAfter(wait)) if retries < 3 => {
                    retries += 1;
                    ::log::warn!("Rate limited, retrying in {:?}", wait.duration());
                    ::tokio::time::sleep(wait.duration()).await;
                }
                other => break other,
            }
        }
    }};
}
