//! Update checks against the package manager.
//!
//! A check optionally refreshes the package database with the privileged sync
//! command, then runs the read-only query command and parses its
//! `name old -> new` lines. Both commands run as child processes on a tokio
//! task, bounded by their own timeouts. Each command gets its own process
//! group, and a timed-out or cancelled command is terminated as a whole group
//! so helpers it started (sudo's child, for one) go with it.
//!
//! At most one check runs at a time. Requests that arrive while one is in
//! flight join it and observe the same [`CheckResult`].

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a timed-out or cancelled command gets to exit after SIGTERM
/// before its process group is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Longest stderr excerpt carried in a failure reason.
const MAX_REASON_LEN: usize = 200;

/// An external command line: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Splits a command line on whitespace. Returns `None` for a blank line.
    /// Splits `line` on whitespace. Quotes and escapes are not interpreted, so
    /// a command that needs shell syntax belongs in a script.
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Refreshes package metadata before querying. `None` skips the sync step.
    pub sync: Option<CommandSpec>,
    pub query: CommandSpec,
    pub sync_timeout: Duration,
    pub query_timeout: Duration,
}

/// `sudo -n yay -Sy`: refreshes the sync databases without prompting.
pub fn default_sync_command() -> CommandSpec {
    CommandSpec::new("sudo", &["-n", "yay", "-Sy"])
}

/// `yay -Qu`: lists upgradable packages without touching the system.
pub fn default_query_command() -> CommandSpec {
    CommandSpec::new("yay", &["-Qu"])
}

#[cfg(test)]
impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            sync: Some(default_sync_command()),
            query: default_query_command(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// One pending package upgrade as reported by the query command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub name: String,
    pub current: String,
    pub available: String,
}

impl fmt::Display for PendingUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.name, self.current, self.available)
    }
}

/// Why a check produced no update count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckFailure {
    #[error("command not found: {0}")]
    CommandNotFound(String),
    /// The privileged sync step failed, typically because authorization was denied.
    #[error("package database sync failed: {0}")]
    SyncFailed(String),
    #[error("`{command}` exited with {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unrecognised query output: {0}")]
    Unparsable(String),
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    #[error("failed to run `{command}`: {message}")]
    Io { command: String, message: String },
    #[error("check was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    /// Zero updates means the system is up to date.
    Success(Vec<PendingUpdate>),
    Failure(CheckFailure),
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub observed_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn failure(reason: CheckFailure) -> Self {
        Self {
            status: CheckStatus::Failure(reason),
            observed_at: Utc::now(),
        }
    }

    /// Number of pending updates, or `None` when the check failed.
    pub fn update_count(&self) -> Option<usize> {
        match &self.status {
            CheckStatus::Success(updates) => Some(updates.len()),
            CheckStatus::Failure(_) => None,
        }
    }
}

/// Parses query output of the form `name current -> available`, one per line.
///
/// Blank lines and `::`-prefixed informational lines are skipped, as are
/// packages pacman marks `[ignored]`. Any other line is an error.
pub fn parse_updates(stdout: &str) -> Result<Vec<PendingUpdate>, CheckFailure> {
    let mut updates = Vec::new();
    for line in stdout.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("::") {
            continue;
        }
        let update = parse_update_line(line)
            .ok_or_else(|| CheckFailure::Unparsable(truncate(line)))?;
        if let Some(update) = update {
            updates.push(update);
        }
    }
    Ok(updates)
}

/// `None` for a malformed line, `Some(None)` for an ignored package.
fn parse_update_line(line: &str) -> Option<Option<PendingUpdate>> {
    let (package, available) = line.split_once(" -> ")?;
    let mut package = package.split_whitespace();
    let name = package.next()?;
    let current = package.next()?;
    let mut available = available.split_whitespace();
    let version = available.next()?;
    if available.next() == Some("[ignored]") {
        return Some(None);
    }
    Some(Some(PendingUpdate {
        name: name.to_string(),
        current: current.to_string(),
        available: version.to_string(),
    }))
}

/// Interprets the query command's exit status and output.
///
/// pacman and yay exit 1 with no output when nothing is pending, so a
/// non-zero exit that printed nothing at all counts as "up to date".
fn classify_query(query: &CommandSpec, output: &Output) -> Result<Vec<PendingUpdate>, CheckFailure> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        return parse_updates(&stdout);
    }
    if stdout.trim().is_empty() && output.stderr.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    Err(non_zero_exit(query, output))
}

fn non_zero_exit(cmd: &CommandSpec, output: &Output) -> CheckFailure {
    CheckFailure::NonZeroExit {
        command: cmd.to_string(),
        status: output.status.to_string(),
        stderr: truncate(String::from_utf8_lossy(&output.stderr).trim()),
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_REASON_LEN) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Runs `cmd` to completion, terminating its process group if it outlives
/// `timeout` or the caller stops waiting.
async fn run_command(cmd: &CommandSpec, timeout: Duration) -> Result<Output, CheckFailure> {
    let child = cmd
        .command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => CheckFailure::CommandNotFound(cmd.program.clone()),
            _ => CheckFailure::Io {
                command: cmd.to_string(),
                message: e.to_string(),
            },
        })?;
    let mut group = ProcessGroup::of(child.id());

    let result = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(CheckFailure::Io {
            command: cmd.to_string(),
            message: e.to_string(),
        }),
        Err(_) => {
            warn!("`{cmd}` timed out after {}s; terminating it", timeout.as_secs());
            return Err(CheckFailure::Timeout {
                command: cmd.to_string(),
                timeout,
            });
        }
    };
    group.disarm();
    result
}

/// The process group of a running command. Dropping it while armed sends
/// SIGTERM to the whole group, then SIGKILL after [`KILL_GRACE`].
///
/// SIGTERM first because sudo relays it to the command it runs, while a
/// SIGKILL on sudo would orphan a root-owned child.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn of(leader: Option<u32>) -> Self {
        Self {
            pgid: leader
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw),
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            // ESRCH: every member already exited.
            debug!("SIGTERM to process group {pgid}: {e}");
            return;
        }
        let escalate = async move {
            tokio::time::sleep(KILL_GRACE).await;
            if killpg(pgid, Signal::SIGKILL).is_ok() {
                debug!("Killed process group {pgid} after grace period");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(escalate);
            }
            Err(_) => {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
    }
}

/// A pending or completed check. Every clone observes the same result.
#[derive(Debug, Clone)]
pub struct CheckHandle {
    id: u64,
    rx: watch::Receiver<Option<CheckResult>>,
    started: bool,
}

impl CheckHandle {
    /// Identifies the check execution; joined handles share the id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// A handle on the same check that did not start it.
    pub fn joined(&self) -> Self {
        Self {
            started: false,
            ..self.clone()
        }
    }

    /// A handle whose check never reports; waiting on it yields `Cancelled`.
    #[cfg(test)]
    pub fn detached(id: u64) -> Self {
        let (_, rx) = watch::channel(None);
        Self {
            id,
            rx,
            started: true,
        }
    }

    /// True for the request that spawned the check, false for requests that
    /// joined one already in flight.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Waits for the result. Yields [`CheckFailure::Cancelled`] if the check was
    /// aborted before finishing.
    pub async fn wait(mut self) -> CheckResult {
        let result = match self.rx.wait_for(Option::is_some).await {
            Ok(result) => Option::clone(&result),
            Err(_) => None,
        };
        result.unwrap_or_else(|| CheckResult::failure(CheckFailure::Cancelled))
    }
}

struct InFlight {
    id: u64,
    rx: watch::Receiver<Option<CheckResult>>,
    abort: AbortHandle,
}

/// Runs checks off the control loop, one at a time.
pub struct UpdateChecker {
    config: CheckerConfig,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl UpdateChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self {
            config,
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Starts a check, or joins the one already running. Never blocks.
    pub fn check(self: &Arc<Self>) -> CheckHandle {
        let mut slot = lock(&self.in_flight);
        if let Some(in_flight) = slot.as_ref() {
            debug!("Check already in flight; joining it");
            return CheckHandle {
                id: in_flight.id,
                rx: in_flight.rx.clone(),
                started: false,
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let checker = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = checker.execute().await;
            // Clear the slot and publish under the same lock, so a request either
            // joins this check and sees its result or starts a fresh one.
            let mut slot = lock(&checker.in_flight);
            if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                *slot = None;
            }
            tx.send_replace(Some(result));
        });

        *slot = Some(InFlight {
            id,
            rx: rx.clone(),
            abort: task.abort_handle(),
        });
        info!("Checking for updates");
        CheckHandle {
            id,
            rx,
            started: true,
        }
    }

    #[cfg(test)]
    pub fn is_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }

    /// Abandons the in-flight check, killing its child process. Waiters get
    /// [`CheckFailure::Cancelled`].
    pub fn cancel(&self) {
        if let Some(in_flight) = lock(&self.in_flight).take() {
            in_flight.abort.abort();
            info!("Cancelled in-flight update check");
        }
    }

    async fn execute(&self) -> CheckResult {
        let status = match self.run_commands().await {
            Ok(updates) => {
                info!("Check finished: {} update(s) pending", updates.len());
                CheckStatus::Success(updates)
            }
            Err(reason) => {
                warn!("Check failed: {reason}");
                CheckStatus::Failure(reason)
            }
        };
        CheckResult {
            status,
            observed_at: Utc::now(),
        }
    }

    async fn run_commands(&self) -> Result<Vec<PendingUpdate>, CheckFailure> {
        if let Some(sync) = &self.config.sync {
            debug!("Syncing package database: {sync}");
            let output = run_command(sync, self.config.sync_timeout).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = match stderr.trim() {
                    "" => output.status.to_string(),
                    msg => truncate(msg),
                };
                return Err(CheckFailure::SyncFailed(reason));
            }
        }

        let query = &self.config.query;
        debug!("Querying pending updates: {query}");
        let output = run_command(query, self.config.query_timeout).await?;
        classify_query(query, &output)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
