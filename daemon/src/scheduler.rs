use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::checker::{CheckHandle, UpdateChecker};
use crate::config::{self, SettingsStore};
use crate::event::DaemonEvent;

/// Decides when the next automatic check is due and starts checks.
///
/// The cadence is measured from the end of the previous check, so a slow check
/// delays the next one instead of piling up behind it. While a check is
/// outstanding no deadline exists.
///
/// Results of checks started here are delivered to the control loop as
/// [`DaemonEvent::CheckFinished`], exactly once per check. A check stays
/// outstanding until its result has been handed back through
/// [`Scheduler::on_check_finished`], even if the checker itself is already
/// idle, and triggers in that window join it.
pub struct Scheduler {
    checker: Arc<UpdateChecker>,
    events: mpsc::Sender<DaemonEvent>,
    interval: Duration,
    running: bool,
    /// The check whose result has not been delivered yet.
    outstanding: Option<CheckHandle>,
    /// Start of the current cadence window: the last completed check, or the
    /// moment the scheduler started when no check has completed yet.
    anchor: Option<Instant>,
    last_completed: Option<Instant>,
}

impl Scheduler {
    pub fn new(checker: Arc<UpdateChecker>, events: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            checker,
            events,
            interval: Duration::from_secs(config::DEFAULT_CHECK_INTERVAL_SECS),
            running: false,
            outstanding: None,
            anchor: None,
            last_completed: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arms the scheduler. The first check is due immediately.
    pub fn start(&mut self, interval_secs: u64, now: Instant) {
        self.interval = Duration::from_secs(interval_secs);
        self.running = true;
        self.anchor = Some(now);
        self.last_completed = None;
        info!(
            "Scheduler started; checking every {}",
            config::interval_label(interval_secs)
        );
    }

    /// When the next automatic check should fire, if any.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.running || self.outstanding.is_some() {
            return None;
        }
        match self.last_completed {
            Some(last) => Some(last + self.interval),
            None => self.anchor,
        }
    }

    /// Starts a check now, or joins the outstanding one.
    pub fn trigger_now(&mut self) -> CheckHandle {
        if let Some(outstanding) = &self.outstanding {
            debug!("Check {} still outstanding; joining it", outstanding.id());
            return outstanding.joined();
        }

        let handle = self.checker.check();
        self.begin_check(handle.clone());
        let waiter = handle.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let id = waiter.id();
            let result = waiter.wait().await;
            let _ = events.send(DaemonEvent::CheckFinished { id, result }).await;
        });
        handle
    }

    /// Changes the cadence, effective for the next scheduled fire, and persists it.
    /// Returns the interval actually applied after snapping to a supported one.
    ///
    /// If the new interval has already elapsed since the last check, the next
    /// check is due immediately.
    pub fn reconfigure(&mut self, interval_secs: u64, store: &mut SettingsStore) -> u64 {
        let secs = config::clamp_interval(i64::try_from(interval_secs).unwrap_or(i64::MAX));
        self.interval = Duration::from_secs(secs);
        store.update(|s| s.check_interval_secs = secs);
        info!("Check interval set to {}", config::interval_label(secs));
        secs
    }

    /// Records that check `id` finished at `now`. Returns false when the
    /// result should be dropped: the check is not the outstanding one, or the
    /// scheduler was stopped.
    pub fn on_check_finished(&mut self, id: u64, now: Instant) -> bool {
        if self.outstanding.as_ref().map(CheckHandle::id) != Some(id) {
            debug!("Dropping result of check {id}; it is not outstanding");
            return false;
        }
        self.outstanding = None;
        if !self.running {
            debug!("Dropping check result; scheduler stopped");
            return false;
        }
        self.last_completed = Some(now);
        true
    }

    /// Cancels the pending timer. An in-flight check may finish, but its
    /// result is dropped.
    pub fn stop(&mut self) {
        if self.running {
            info!("Scheduler stopped");
        }
        self.running = false;
    }

    fn begin_check(&mut self, handle: CheckHandle) {
        self.outstanding = Some(handle);
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckerConfig, CommandSpec};
    use crate::config::Settings;

    const HALF_HOUR: Duration = Duration::from_secs(1_800);

    fn scheduler_with(query: &str) -> (Scheduler, mpsc::Receiver<DaemonEvent>) {
        let checker = Arc::new(UpdateChecker::new(CheckerConfig {
            sync: None,
            query: CommandSpec::new("sh", &["-c", query]),
            sync_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
        }));
        let (tx, rx) = mpsc::channel(8);
        (Scheduler::new(checker, tx), rx)
    }

    fn idle_scheduler() -> Scheduler {
        scheduler_with("true").0
    }

    // ── cadence ───────────────────────────────────────────────────────────────

    #[test]
    fn first_check_is_due_at_start() {
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        assert_eq!(s.deadline(), None);
        s.start(1_800, t0);
        assert_eq!(s.deadline(), Some(t0));
    }

    #[test]
    fn next_check_is_interval_after_completion() {
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(1_800, t0);

        s.begin_check(CheckHandle::detached(0));
        assert_eq!(s.deadline(), None);
        assert!(s.on_check_finished(0, t0));
        assert_eq!(s.deadline(), Some(t0 + HALF_HOUR));
    }

    #[test]
    fn consecutive_checks_are_spaced_by_interval() {
        for secs in config::SUPPORTED_INTERVALS_SECS {
            let mut s = idle_scheduler();
            let interval = Duration::from_secs(secs);
            let mut now = Instant::now();
            s.start(secs, now);

            let mut starts = Vec::new();
            for _ in 0..4 {
                now = s.deadline().unwrap();
                starts.push(now);
                s.begin_check(CheckHandle::detached(0));
                s.on_check_finished(0, now);
            }
            for pair in starts.windows(2) {
                assert_eq!(pair[1] - pair[0], interval);
            }
        }
    }

    #[test]
    fn slow_check_pushes_next_deadline() {
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(1_800, t0);
        s.begin_check(CheckHandle::detached(0));
        let finished = t0 + Duration::from_secs(90);
        s.on_check_finished(0, finished);
        assert_eq!(s.deadline(), Some(finished + HALF_HOUR));
    }

    // ── reconfigure ───────────────────────────────────────────────────────────

    #[test]
    fn reconfigure_persists_and_applies_to_next_fire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = SettingsStore::load(&path);
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(1_800, t0);
        s.begin_check(CheckHandle::detached(0));
        s.on_check_finished(0, t0);

        assert_eq!(s.reconfigure(21_600, &mut store), 21_600);

        assert_eq!(s.deadline(), Some(t0 + Duration::from_secs(21_600)));
        assert_eq!(SettingsStore::load(&path).settings().check_interval_secs, 21_600);
    }

    #[test]
    fn reconfigure_snaps_unsupported_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::load(&dir.path().join("settings.toml"));
        let mut s = idle_scheduler();
        assert_eq!(s.reconfigure(100, &mut store), 1_800);
        assert_eq!(store.settings(), &Settings {
            check_interval_secs: 1_800,
            last_check: None,
        });
    }

    #[test]
    fn shorter_interval_than_elapsed_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::load(&dir.path().join("settings.toml"));
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(86_400, t0);
        s.begin_check(CheckHandle::detached(0));
        s.on_check_finished(0, t0);

        let now = t0 + Duration::from_secs(7_200);
        s.reconfigure(1_800, &mut store);

        assert!(s.deadline().unwrap() <= now);
    }

    #[test]
    fn reconfigure_does_not_disturb_in_flight_check() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SettingsStore::load(&dir.path().join("settings.toml"));
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(3_600, t0);
        s.begin_check(CheckHandle::detached(0));

        s.reconfigure(1_800, &mut store);
        assert_eq!(s.deadline(), None);

        let done = t0 + Duration::from_secs(5);
        assert!(s.on_check_finished(0, done));
        assert_eq!(s.deadline(), Some(done + HALF_HOUR));
    }

    // ── stop ──────────────────────────────────────────────────────────────────

    #[test]
    fn stop_cancels_deadline_and_drops_in_flight_result() {
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(1_800, t0);
        s.begin_check(CheckHandle::detached(0));
        s.stop();

        assert!(!s.on_check_finished(0, t0));
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn result_of_other_check_is_ignored() {
        let mut s = idle_scheduler();
        let t0 = Instant::now();
        s.start(1_800, t0);
        s.begin_check(CheckHandle::detached(3));

        assert!(!s.on_check_finished(2, t0));
        assert_eq!(s.deadline(), None);
        assert!(s.on_check_finished(3, t0));
        assert_eq!(s.deadline(), Some(t0 + HALF_HOUR));
    }

    // ── trigger_now ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn trigger_delivers_one_result_event() {
        let (mut s, mut rx) = scheduler_with("echo 'pkg 1 -> 2'");
        s.start(1_800, Instant::now());

        let handle = s.trigger_now();
        assert!(handle.started());
        assert_eq!(s.deadline(), None);

        match rx.recv().await {
            Some(DaemonEvent::CheckFinished { id, result }) => {
                assert_eq!(id, handle.id());
                assert_eq!(result.update_count(), Some(1));
            }
            _ => panic!("expected CheckFinished"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_triggers_coalesce_into_one_event() {
        let (mut s, mut rx) = scheduler_with("sleep 0.3; echo 'pkg 1 -> 2'");
        s.start(1_800, Instant::now());

        let handles: Vec<_> = (0..4).map(|_| s.trigger_now()).collect();
        assert_eq!(handles.iter().filter(|h| h.started()).count(), 1);

        assert!(matches!(rx.recv().await, Some(DaemonEvent::CheckFinished { .. })));
        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "only one result event per check");
    }

    #[tokio::test]
    async fn trigger_joins_check_until_its_result_is_delivered() {
        let (mut s, mut rx) = scheduler_with("echo 'pkg 1 -> 2'");
        let t0 = Instant::now();
        s.start(1_800, t0);

        let first = s.trigger_now();
        let event = rx.recv().await;
        // The checker is idle now, but the result has not been handed back.
        let second = s.trigger_now();
        assert!(!second.started());
        assert_eq!(second.id(), first.id());

        let Some(DaemonEvent::CheckFinished { id, .. }) = event else {
            panic!("expected CheckFinished");
        };
        assert!(s.on_check_finished(id, t0));
        assert!(s.trigger_now().started());
    }
}
