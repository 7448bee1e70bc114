//! The periodic sweep over all tracked handles.
//!
//! Each sweep probes every handle from a snapshot of the lists, feeds the results to the
//! confirmation tracker, and moves handles whose new status got confirmed. Alerts go out
//! only after the move is done. One sweep at a time, never overlapping.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::{
    alerts::{AlertEvent, AlertSink},
    config::Config,
    database::Database,
    list_store::TrackedSnapshot,
    probe::{ProbeReport, StatusProbe},
    ProbeStatus,
};

/// How one sweep went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Handles probed.
    pub checked: usize,
    /// Probes that failed and counted as [`ProbeStatus::Error`].
    pub probe_failures: usize,
    /// Handles moved to the other list (and alerted about).
    pub transitions: usize,
    /// Handles that changed under our feet between the snapshot and their turn.
    pub conflicts: usize,
    /// A stop was requested before every handle got its turn.
    pub stopped_early: bool,
    /// Whether the end-of-sweep save worked.
    pub saved: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("a sweep is already running")]
    AlreadyRunning,
    #[error("sweep panicked: {0}")]
    Panicked(String),
}

/// What happened to a single handle.
enum Step {
    Checked,
    Moved,
    Conflict,
}

pub struct Monitor<P, A> {
    database: Arc<Database>,
    probe: P,
    alerts: A,
    check_interval: Duration,
    recovery_interval: Duration,
    probe_spacing: Duration,
    /// Held for the whole sweep.
    sweeping: Mutex<()>,
}

/// True once a stop was requested, or once nobody can request one anymore.
fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

impl<P, A> Monitor<P, A>
where
    P: StatusProbe + 'static,
    A: AlertSink + 'static,
{
    pub fn new(database: Arc<Database>, probe: P, alerts: A, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            database,
            probe,
            alerts,
            check_interval: config.check_interval,
            recovery_interval: config.recovery_interval,
            probe_spacing: config.probe_spacing,
            sweeping: Mutex::new(()),
        })
    }

    /// Sweep, wait, repeat, until `stop` says `true` or its sender is dropped. A sweep
    /// that blows up is logged and retried after the shorter recovery interval.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        log::info!("Monitor started.");

        while !stop_requested(&stop) {
            let wait = match self.sweep_guarded(stop.clone()).await {
                Ok(report) => {
                    log::debug!("Sweep done: {report:?}");
                    self.check_interval
                }
                Err(SweepError::AlreadyRunning) => {
                    log::debug!("Skipping a tick, a sweep is still running.");
                    self.check_interval
                }
                Err(e) => {
                    log::error!("Sweep failed, retrying in {:?}: {e}", self.recovery_interval);
                    self.recovery_interval
                }
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        log::info!("Monitor stopped.");
    }

    /// [`Self::run_sweep`] in its own task, so that a panic anywhere in it comes back as
    /// [`SweepError::Panicked`] instead of taking the loop down.
    async fn sweep_guarded(
        self: &Arc<Self>,
        stop: watch::Receiver<bool>,
    ) -> Result<SweepReport, SweepError> {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.run_sweep(&stop).await }).await {
            Ok(result) => result,
            Err(e) => Err(SweepError::Panicked(e.to_string())),
        }
    }

    /// One full pass over a snapshot of everything tracked, then one save.
    ///
    /// # Errors
    ///
    /// Returns [`SweepError::AlreadyRunning`] without doing anything if another sweep is
    /// in progress.
    pub async fn run_sweep(
        self: &Arc<Self>,
        stop: &watch::Receiver<bool>,
    ) -> Result<SweepReport, SweepError> {
        let Ok(_sweeping) = self.sweeping.try_lock() else {
            return Err(SweepError::AlreadyRunning);
        };

        let snapshot: Vec<TrackedSnapshot> =
            self.database.lock().await.lists.all_tracked().collect();
        log::debug!("Sweeping over {} handles...", snapshot.len());

        let mut report = SweepReport::default();

        for (i, target) in snapshot.iter().enumerate() {
            if i > 0 && !self.probe_spacing.is_zero() {
                let mut stop = stop.clone();
                tokio::select! {
                    () = tokio::time::sleep(self.probe_spacing) => {}
                    _ = stop.changed() => {}
                }
            }

            if stop_requested(stop) {
                report.stopped_early = true;
                break;
            }

            let probe_report = self.probe_one(target).await.unwrap_or_else(|| {
                report.probe_failures += 1;
                ProbeReport::status_only(ProbeStatus::Error)
            });
            report.checked += 1;

            match self.apply(target, probe_report).await {
                Step::Checked => {}
                Step::Moved => report.transitions += 1,
                Step::Conflict => report.conflicts += 1,
            }
        }

        self.database.lock().await.stats.total_sweeps += 1;

        match self.database.save().await {
            Ok(()) => report.saved = true,
            Err(e) => log::error!("Failed to save after sweep: {e}"),
        }

        Ok(report)
    }

    /// Probe one handle in its own task. [`None`] if the probe failed or panicked.
    async fn probe_one(self: &Arc<Self>, target: &TrackedSnapshot) -> Option<ProbeReport> {
        let this = Arc::clone(self);
        let handle = target.handle.clone();

        match tokio::spawn(async move { this.probe.check(&handle).await }).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                log::warn!("Failed to check {}: {e}", target.handle);
                None
            }
            Err(e) => {
                log::error!("Checking {} panicked: {e}", target.handle);
                None
            }
        }
    }

    /// Record the observation and, if it confirms the handle should leave its list, move
    /// it and send an alert. All under one lock, so nobody sees half of it.
    async fn apply(&self, target: &TrackedSnapshot, probe_report: ProbeReport) -> Step {
        let now = Utc::now();
        let handle = &target.handle;

        let event = {
            let mut state = self.database.lock().await;

            // The user may have moved or removed it while we were probing.
            let still_there = state
                .lists
                .get(handle)
                .is_some_and(|e| e.owner == target.owner && e.list == target.list);
            if !still_there {
                log::debug!("{handle} changed during the sweep, skipping.");
                return Step::Conflict;
            }

            let observation =
                state.lists.observe(handle, probe_report.status, probe_report.details, now);

            if !observation.confirmed {
                return Step::Checked;
            }

            if probe_report.status != target.list.leaving_status() {
                // Confirmed, but either it's where it belongs already or the status
                // doesn't mean anything. Nothing to do.
                log::debug!("{handle} confirmed as {}", probe_report.status);
                return Step::Checked;
            }

            let Some(transition) = state.lists.transition(handle, now) else {
                return Step::Conflict;
            };
            state.stats.alerts_sent += 1;

            log::info!(
                "{handle} confirmed {}, moved from the {} to the {}",
                probe_report.status,
                transition.from,
                transition.to
            );

            AlertEvent {
                owner: transition.owner,
                handle: handle.clone(),
                from: transition.from,
                to: transition.to,
                details: observation.details,
                at: now,
            }
        };

        self.alerts.notify(event);
        Step::Moved
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::{
        collections::{HashMap, VecDeque},
        sync::atomic::{AtomicBool, Ordering},
    };

    use teloxide::types::UserId;

    use super::*;
    use crate::{list_store::AssignResult, probe::ProbeError, Handle, ListKind};
    use ProbeStatus::*;

    const OWNER: UserId = UserId(1);

    fn h(name: &str) -> Handle {
        Handle::parse(name).unwrap()
    }

    /// Answers from a script per handle, then "active" forever. `boom` panics.
    #[derive(Default)]
    struct ScriptedProbe {
        script: std::sync::Mutex<HashMap<Handle, VecDeque<Result<ProbeStatus, ProbeError>>>>,
        delay: Duration,
        /// Removes this handle from the lists while "probing" it.
        remove_while_probing: Option<(Arc<Database>, Handle)>,
    }

    impl ScriptedProbe {
        fn with(script: &[(&str, &[Result<ProbeStatus, ProbeError>])]) -> Self {
            let script = script
                .iter()
                .map(|(name, answers)| (h(name), answers.iter().cloned().collect()))
                .collect();
            Self {
                script: std::sync::Mutex::new(script),
                ..Default::default()
            }
        }
    }

    impl StatusProbe for ScriptedProbe {
        async fn check(&self, handle: &Handle) -> Result<ProbeReport, ProbeError> {
            if handle.as_str() == "boom" {
                panic!("kaboom");
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some((database, victim)) = &self.remove_while_probing {
                if victim == handle {
                    database.remove(OWNER, handle, ListKind::Watched).await;
                }
            }

            let answer = self
                .script
                .lock()
                .unwrap()
                .get_mut(handle)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(Active));
            answer.map(ProbeReport::status_only)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<AlertEvent>>,
        /// Panic on the next alert instead of recording it.
        explode_once: AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<AlertEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AlertSink for Arc<RecordingSink> {
        fn notify(&self, event: AlertEvent) {
            if self.explode_once.swap(false, Ordering::SeqCst) {
                panic!("alert for {} went up in flames", event.handle);
            }
            self.events.lock().unwrap().push(event);
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        config: Config,
        database: Arc<Database>,
        sink: Arc<RecordingSink>,
        // Kept so the stop channel doesn't count as dropped.
        _stop_sender: watch::Sender<bool>,
        stop: watch::Receiver<bool>,
    }

    async fn setup(tracked: &[(&str, ListKind)]) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            owner: OWNER,
            database_path: dir.path().join("monitor.sqlite"),
            check_interval: Duration::from_millis(10),
            recovery_interval: Duration::from_millis(10),
            probe_spacing: Duration::ZERO,
            ..Config::default()
        };
        let database = Database::open(&config).await.unwrap();
        for (name, list) in tracked {
            assert_eq!(
                database.assign(OWNER, &h(name), *list).await,
                Ok(AssignResult::Added)
            );
        }
        let (stop_sender, stop) = watch::channel(false);

        Setup {
            _dir: dir,
            config,
            database,
            sink: Arc::new(RecordingSink::default()),
            _stop_sender: stop_sender,
            stop,
        }
    }

    impl Setup {
        fn monitor(
            &self,
            probe: ScriptedProbe,
        ) -> Arc<Monitor<ScriptedProbe, Arc<RecordingSink>>> {
            self.monitor_with(probe, self.config.clone())
        }

        fn monitor_with(
            &self,
            probe: ScriptedProbe,
            config: Config,
        ) -> Arc<Monitor<ScriptedProbe, Arc<RecordingSink>>> {
            Monitor::new(self.database.clone(), probe, self.sink.clone(), &config)
        }

        async fn streak_of(&self, name: &str) -> Option<u32> {
            self.database
                .lock()
                .await
                .lists
                .confirmations()
                .get(&h(name))
                .map(|p| p.streak)
        }
    }

    #[tokio::test]
    async fn ban_is_confirmed_after_three_sweeps() {
        let s = setup(&[("alice", ListKind::Watched)]).await;
        let monitor = s.monitor(ScriptedProbe::with(&[(
            "alice",
            &[Ok(Active), Ok(Active), Ok(Banned), Ok(Banned), Ok(Banned)],
        )]));

        let mut streaks = Vec::new();
        for _ in 0..4 {
            let report = monitor.run_sweep(&s.stop).await.unwrap();
            assert_eq!(report.transitions, 0);
            streaks.push(s.streak_of("alice").await);
        }
        assert_eq!(streaks, vec![Some(1), Some(2), Some(1), Some(2)]);
        assert!(s.sink.events().is_empty());

        let report = monitor.run_sweep(&s.stop).await.unwrap();
        assert_eq!(report.transitions, 1);
        assert!(report.saved);
        assert_eq!(s.streak_of("alice").await, None);
        assert_eq!(s.database.list_for(OWNER, ListKind::Flagged).await, vec![h("alice")]);
        assert!(s.database.list_for(OWNER, ListKind::Watched).await.is_empty());

        let events = s.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].owner, OWNER);
        assert_eq!(events[0].handle, h("alice"));
        assert_eq!((events[0].from, events[0].to), (ListKind::Watched, ListKind::Flagged));

        let state = s.database.lock().await;
        assert_eq!(state.stats.total_sweeps, 5);
        assert_eq!(state.stats.alerts_sent, 1);
    }

    #[tokio::test]
    async fn reactivation_moves_back() {
        let s = setup(&[("bob", ListKind::Flagged)]).await;
        let monitor = s.monitor(ScriptedProbe::with(&[]));

        for _ in 0..3 {
            monitor.run_sweep(&s.stop).await.unwrap();
        }

        assert_eq!(s.database.list_for(OWNER, ListKind::Watched).await, vec![h("bob")]);
        let events = s.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!((events[0].from, events[0].to), (ListKind::Flagged, ListKind::Watched));

        // It's on the watch list now and still active, so nothing more happens.
        for _ in 0..3 {
            monitor.run_sweep(&s.stop).await.unwrap();
        }
        assert_eq!(s.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn inactionable_confirmations_are_absorbed() {
        let s = setup(&[("carol", ListKind::Watched), ("dave", ListKind::Flagged)]).await;
        let failure = Err(ProbeError::Timeout);
        let monitor = s.monitor(ScriptedProbe::with(&[
            ("carol", &[failure.clone(), failure.clone(), failure]),
            ("dave", &[Ok(Private), Ok(Private), Ok(Private)]),
        ]));

        let mut failures = 0;
        for _ in 0..3 {
            failures += monitor.run_sweep(&s.stop).await.unwrap().probe_failures;
        }

        assert_eq!(failures, 3);
        assert_eq!(s.streak_of("carol").await, None);
        assert_eq!(s.streak_of("dave").await, None);
        assert_eq!(s.database.list_for(OWNER, ListKind::Watched).await, vec![h("carol")]);
        assert_eq!(s.database.list_for(OWNER, ListKind::Flagged).await, vec![h("dave")]);
        assert!(s.sink.events().is_empty());
    }

    #[tokio::test]
    async fn removal_during_sweep_is_a_no_op() {
        let s = setup(&[("erin", ListKind::Watched)]).await;
        let monitor = s.monitor(ScriptedProbe::with(&[(
            "erin",
            &[Ok(Banned), Ok(Banned), Ok(Banned)],
        )]));
        monitor.run_sweep(&s.stop).await.unwrap();
        monitor.run_sweep(&s.stop).await.unwrap();
        assert_eq!(s.streak_of("erin").await, Some(2));

        // Third sweep would confirm, but the user removes it mid-probe.
        let probe = ScriptedProbe {
            remove_while_probing: Some((s.database.clone(), h("erin"))),
            ..ScriptedProbe::with(&[("erin", &[Ok(Banned)])])
        };
        let report = s.monitor(probe).run_sweep(&s.stop).await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.transitions, 0);
        assert_eq!(s.streak_of("erin").await, None);
        assert_eq!(s.database.count_for(OWNER, ListKind::Flagged).await, 0);
        assert!(s.sink.events().is_empty());
    }

    #[tokio::test]
    async fn one_bad_handle_does_not_spoil_the_sweep() {
        let s = setup(&[("boom", ListKind::Watched), ("frank", ListKind::Watched)]).await;
        let monitor = s.monitor(ScriptedProbe::with(&[(
            "frank",
            &[Ok(Banned), Ok(Banned), Ok(Banned)],
        )]));

        for _ in 0..3 {
            let report = monitor.run_sweep(&s.stop).await.unwrap();
            assert_eq!(report.checked, 2);
            assert_eq!(report.probe_failures, 1);
        }

        assert_eq!(s.database.list_for(OWNER, ListKind::Flagged).await, vec![h("frank")]);
        assert_eq!(s.sink.events().len(), 1);
        // The panicking one only ever saw errors, which confirmed and got absorbed.
        assert_eq!(s.database.list_for(OWNER, ListKind::Watched).await, vec![h("boom")]);
    }

    #[tokio::test]
    async fn sweeps_never_overlap() {
        let s = setup(&[("gina", ListKind::Watched)]).await;
        let monitor = s.monitor(ScriptedProbe {
            delay: Duration::from_millis(50),
            ..ScriptedProbe::default()
        });

        let (first, second) =
            tokio::join!(monitor.run_sweep(&s.stop), monitor.run_sweep(&s.stop));
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SweepError::AlreadyRunning))));
        assert_eq!(s.streak_of("gina").await, Some(1));
    }

    #[tokio::test]
    async fn stop_is_honored_between_probes() {
        let s = setup(&[("hank", ListKind::Watched), ("ivy", ListKind::Watched)]).await;
        let (stop_sender, stop) = watch::channel(true);
        let monitor = s.monitor(ScriptedProbe::default());

        let report = monitor.run_sweep(&stop).await.unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.checked, 0);
        drop(stop_sender);
    }

    #[tokio::test]
    async fn loop_runs_until_stopped() {
        let s = setup(&[("jack", ListKind::Flagged)]).await;
        let (stop_sender, stop) = watch::channel(false);
        let monitor = s.monitor(ScriptedProbe::default());

        let task = tokio::spawn(monitor.run(stop));

        // Reactivation needs three sweeps; wait for the alert.
        tokio::time::timeout(Duration::from_secs(10), async {
            while s.sink.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_sender.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();

        assert!(s.database.lock().await.stats.total_sweeps >= 3);
        assert_eq!(s.database.list_for(OWNER, ListKind::Watched).await, vec![h("jack")]);
    }

    #[tokio::test]
    async fn stop_cuts_the_pause_between_checks_short() {
        let s = setup(&[("kate", ListKind::Watched), ("liam", ListKind::Watched)]).await;
        let monitor = s.monitor_with(
            ScriptedProbe::default(),
            Config {
                probe_spacing: Duration::from_secs(600),
                ..s.config.clone()
            },
        );
        let (stop_sender, stop) = watch::channel(false);

        let sweep = tokio::spawn(async move { monitor.run_sweep(&stop).await });

        // Wait until the first handle got its turn, then stop during the pause.
        tokio::time::timeout(Duration::from_secs(10), async {
            while s.streak_of("kate").await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        stop_sender.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), sweep)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.checked, 1);
        assert!(report.saved);
        assert_eq!(s.streak_of("liam").await, None);
    }

    #[tokio::test]
    async fn stop_cuts_the_wait_between_sweeps_short() {
        let s = setup(&[]).await;
        let monitor = s.monitor_with(
            ScriptedProbe::default(),
            Config {
                check_interval: Duration::from_secs(600),
                ..s.config.clone()
            },
        );
        let (stop_sender, stop) = watch::channel(false);

        let task = tokio::spawn(monitor.run(stop));

        tokio::time::timeout(Duration::from_secs(10), async {
            while s.database.lock().await.stats.total_sweeps == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        stop_sender.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.database.lock().await.stats.total_sweeps, 1);
    }

    #[tokio::test]
    async fn loop_survives_a_sweep_that_blows_up() {
        let s = setup(&[("kim", ListKind::Watched), ("jack", ListKind::Flagged)]).await;
        s.sink.explode_once.store(true, Ordering::SeqCst);

        // Three sweeps in, jack's reactivation alert panics. After that kim gets banned.
        let kim: Vec<Result<ProbeStatus, ProbeError>> = [Ok(Active), Ok(Active), Ok(Active)]
            .into_iter()
            .chain(std::iter::repeat(Ok(Banned)).take(50))
            .collect();
        let monitor = s.monitor(ScriptedProbe::with(&[("kim", &kim)]));
        let (stop_sender, stop) = watch::channel(false);

        let task = tokio::spawn(monitor.run(stop));

        tokio::time::timeout(Duration::from_secs(10), async {
            while s.sink.events().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        stop_sender.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();

        assert!(!s.sink.explode_once.load(Ordering::SeqCst));
        // The move behind the lost alert went through before the panic.
        assert_eq!(s.database.list_for(OWNER, ListKind::Watched).await, vec![h("jack")]);
        assert_eq!(s.database.list_for(OWNER, ListKind::Flagged).await, vec![h("kim")]);

        let events = s.sink.events();
        assert_eq!(events[0].handle, h("kim"));
        assert_eq!((events[0].from, events[0].to), (ListKind::Watched, ListKind::Flagged));
        assert!(s.database.lock().await.stats.alerts_sent >= 2);
    }
}
