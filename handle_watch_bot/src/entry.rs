use std::{fs, sync::Arc};
use teloxide::{dptree::deps, prelude::*};
use tokio::sync::watch;

use crate::{
    alerts::{deliver_alerts_spinloop, AlertQueue},
    config::Config,
    database::Database,
    handlers::{commands::Command, handle_message},
    monitor::Monitor,
    probe::SimulatedProbe,
};

/// # Panics
///
/// Panics if there's no key file or the database can't be opened.
pub async fn entry() {
    let key = fs::read_to_string(match cfg!(debug_assertions) {
        true => "key_debug",
        false => "key",
    })
    .expect("Could not load bot key file!");

    let config = Config::from_env();
    log::info!(
        "Owner is {}, {} admins from the environment, watch cap {}, checking every {:?}",
        config.owner,
        config.admins.len(),
        config.max_watch_per_user,
        config.check_interval
    );

    let bot = Bot::new(key.trim());

    bot.set_my_commands(Command::generate_bot_commands())
        .await
        .expect("Failed to set bot commands!");

    let database: Arc<Database> = Database::open(&config)
        .await
        .expect("Failed to open the database!");

    let (alerts, alert_receiver) = AlertQueue::new();
    tokio::spawn(deliver_alerts_spinloop(bot.clone(), alert_receiver));

    let (stop_sender, stop_receiver) = watch::channel(false);
    let monitor = Monitor::new(
        database.clone(),
        SimulatedProbe::default(),
        alerts,
        &config,
    );
    let monitor = tokio::spawn(monitor.run(stop_receiver));

    log::info!("Creating the handler...");

    let handler = dptree::entry()
        .branch(Update::filter_message().branch(dptree::endpoint(handle_message)));

    log::info!("Dispatching the dispatcher!");

    Dispatcher::builder(bot, handler)
        .default_handler(|_| async {})
        .dependencies(deps![database])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    log::info!("it appears we have been bonked.");

    // Ignoring the error, the monitor is gone already if nobody listens.
    let _ = stop_sender.send(true);
    if let Err(e) = monitor.await {
        log::error!("Monitor task died: {e}");
    }
}
