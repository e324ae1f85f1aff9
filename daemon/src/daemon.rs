use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, trace, warn};

use crate::alert::{self, AlertEvent, AlertStateMachine, Indicator};
use crate::checker::{CheckHandle, CheckStatus, CheckerConfig, PendingUpdate, UpdateChecker};
use crate::config::{self, SettingsStore};
use crate::control::{self, ControlReply, Request, Response};
use crate::event::DaemonEvent;
use crate::lock::{self, Acquire, InstanceLock};
use crate::paths::Paths;
use crate::runner::{RunOutcome, RunnerConfig, UpdateRunner};
use crate::scheduler::{self, Scheduler};
use crate::status::{self, DaemonStatus};

pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_ALREADY_RUNNING: i32 = 2;

pub struct Options {
    pub paths: Paths,
    pub checker: CheckerConfig,
    pub runner: RunnerConfig,
}

/// Owns every piece of mutable state. Only the control loop touches it, so
/// transitions are applied one at a time in arrival order.
pub struct Daemon {
    paths: Paths,
    store: SettingsStore,
    checker: Arc<UpdateChecker>,
    scheduler: Scheduler,
    alerts: AlertStateMachine,
    runner: UpdateRunner,
    /// Packages from the last successful check, until cleared.
    pending: Vec<PendingUpdate>,
    /// Last upgrade launch failure, until a launch succeeds.
    launch_error: Option<String>,
    /// Indicator as of the last flash tick.
    indicator: Indicator,
    events_tx: mpsc::Sender<DaemonEvent>,
    events_rx: mpsc::Receiver<DaemonEvent>,
}

impl Daemon {
    pub fn new(options: Options) -> Self {
        let (events_tx, events_rx) = mpsc::channel(32);
        let now = Instant::now();
        let store = SettingsStore::load(&options.paths.settings_file());
        info!("Using settings at {}", store.path().display());
        let checker = Arc::new(UpdateChecker::new(options.checker));
        let scheduler = Scheduler::new(Arc::clone(&checker), events_tx.clone());
        let runner = UpdateRunner::new(options.runner, events_tx.clone());
        let alerts = AlertStateMachine::new(now);
        let indicator = alerts.indicator(now);
        Self {
            paths: options.paths,
            store,
            checker,
            scheduler,
            alerts,
            runner,
            pending: Vec::new(),
            launch_error: None,
            indicator,
            events_tx,
            events_rx,
        }
    }

    /// Sender for feeding events into the control loop.
    pub fn events(&self) -> mpsc::Sender<DaemonEvent> {
        self.events_tx.clone()
    }

    /// Runs the control loop until a shutdown event, then releases `lock`.
    pub async fn run(mut self, mut lock: InstanceLock) {
        self.begin(Instant::now());

        let mut tick = tokio::time::interval(alert::FLASH_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.scheduler.deadline();
            let flashing = alert::flash_cycle(self.alerts.state()).is_some();
            tokio::select! {
                _ = scheduler::sleep_until(deadline) => {
                    self.trigger_check(Instant::now());
                }
                _ = tick.tick(), if flashing => {
                    self.sample_indicator(Instant::now());
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event, Instant::now()) {
                        break;
                    }
                }
            }
        }

        self.shutdown(&mut lock);
    }

    fn begin(&mut self, now: Instant) {
        self.scheduler
            .start(self.store.settings().check_interval_secs, now);
        self.publish_status(now);
    }

    /// Starts a check (or joins the running one) and enters `Checking`.
    fn trigger_check(&mut self, now: Instant) -> CheckHandle {
        let handle = self.scheduler.trigger_now();
        if handle.started() && self.alerts.apply(AlertEvent::CheckStarted, now) {
            self.sample_indicator(now);
            self.publish_status(now);
        }
        handle
    }

    /// Applies one event. Returns false when the loop should stop.
    fn handle_event(&mut self, event: DaemonEvent, now: Instant) -> bool {
        match event {
            DaemonEvent::CheckFinished { id, result } => {
                if !self.scheduler.on_check_finished(id, now) {
                    return true;
                }
                match result.status {
                    CheckStatus::Success(updates) => {
                        self.alerts
                            .apply(AlertEvent::CheckSucceeded(updates.len()), now);
                        self.pending = updates;
                        let observed_at = result.observed_at;
                        self.store.update(|s| s.last_check = Some(observed_at));
                    }
                    CheckStatus::Failure(reason) => {
                        self.alerts
                            .apply(AlertEvent::CheckFailed(reason.to_string()), now);
                    }
                }
                self.sample_indicator(now);
                self.publish_status(now);
            }

            DaemonEvent::UpgradeFinished { exit_code } => {
                match exit_code {
                    Some(0) => info!("Upgrade finished"),
                    Some(code) => warn!("Upgrade exited with code {code}"),
                    None => warn!("Upgrade ended without an exit code"),
                }
                self.trigger_check(now);
            }

            DaemonEvent::Control(request, reply) => {
                let answer = self.handle_request(request, now);
                let _ = reply.send(answer);
            }

            DaemonEvent::Shutdown => return false,
        }
        true
    }

    fn handle_request(&mut self, request: Request, now: Instant) -> ControlReply {
        let response = match request {
            Request::Check => return ControlReply::Checking(self.trigger_check(now)),

            Request::Upgrade => {
                let response = match self.runner.run() {
                    Ok(RunOutcome::Started { terminal }) => {
                        self.launch_error = None;
                        Response::ok(format!("Upgrade started in {terminal}"))
                    }
                    Ok(RunOutcome::AlreadyRunning) => {
                        Response::ok("An upgrade is already running")
                    }
                    Err(e) => {
                        error!("{e}");
                        self.launch_error = Some(e.to_string());
                        Response::error(e.to_string())
                    }
                };
                self.publish_status(now);
                response
            }

            Request::Clear => {
                self.alerts.apply(AlertEvent::UserCleared, now);
                self.pending.clear();
                self.sample_indicator(now);
                self.publish_status(now);
                Response::ok("Alert cleared")
            }

            Request::SetInterval { secs } => {
                let applied = self.scheduler.reconfigure(secs, &mut self.store);
                self.publish_status(now);
                Response::ok(format!(
                    "Checking every {}",
                    config::interval_label(applied)
                ))
            }

            Request::Status => Response::Status {
                status: self.snapshot(),
            },
        };
        ControlReply::Ready(response)
    }

    fn sample_indicator(&mut self, now: Instant) {
        self.indicator = self.alerts.indicator(now);
        trace!("Indicator brightness {:.2}", self.indicator.brightness);
    }

    fn snapshot(&self) -> DaemonStatus {
        let state = self.alerts.state();
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: state.into(),
            update_count: self.pending.len(),
            pending: self.pending.iter().map(ToString::to_string).collect(),
            state_since: self.alerts.state_since().to_rfc3339(),
            flash_cycle_secs: alert::flash_cycle(state).map(|cycle| cycle.as_secs_f64()),
            brightness: self.indicator.brightness,
            tooltip: self.indicator.tooltip.clone(),
            check_interval_secs: self.scheduler.interval().as_secs(),
            last_check: self.store.settings().last_check.map(|t| t.to_rfc3339()),
            error: self
                .launch_error
                .clone()
                .or_else(|| self.alerts.last_error().map(str::to_string)),
            upgrade_running: self.runner.is_running(),
        }
    }

    fn publish_status(&mut self, now: Instant) {
        if self.indicator.state != self.alerts.state() {
            self.sample_indicator(now);
        }
        status::write_status(&self.paths.status_file(), &self.snapshot());
    }

    fn shutdown(&mut self, lock: &mut InstanceLock) {
        info!("Shutting down");
        self.scheduler.stop();
        self.checker.cancel();
        self.store.flush();
        status::remove_status(&self.paths.status_file());
        control::remove_socket(&self.paths.socket_file());
        lock.release();
        info!("traynote-daemon stopped");
    }

    #[cfg(test)]
    fn state(&self) -> alert::AlertState {
        self.alerts.state()
    }
}

/// Acquires the instance lock, binds the control socket and runs the daemon.
/// Returns the process exit code.
pub async fn start(options: Options) -> i32 {
    let lock = match lock::acquire(&options.paths.lock_file()) {
        Ok(Acquire::Acquired(lock)) => lock,
        Ok(Acquire::AlreadyRunning { pid }) => {
            match pid {
                Some(pid) => error!("Another instance is already running (PID {pid})"),
                None => error!("Another instance is already running"),
            }
            return EXIT_ALREADY_RUNNING;
        }
        Err(e) => {
            error!("Failed to acquire instance lock: {e:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let daemon = Daemon::new(options);
    let listener = match control::bind(&daemon.paths.socket_file()) {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let server = tokio::spawn(control::serve(listener, daemon.events()));
    {
        let tx = daemon.events();
        tokio::spawn(async move {
            wait_for_shutdown().await;
            let _ = tx.send(DaemonEvent::Shutdown).await;
        });
    }

    info!(
        "traynote-daemon v{} started (lock {})",
        env!("CARGO_PKG_VERSION"),
        lock.path().display()
    );
    daemon.run(lock).await;
    server.abort();
    EXIT_OK
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("Failed to register signal handlers ({e}); falling back to Ctrl+C");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C");
        }
    }
}
