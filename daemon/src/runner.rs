//! Interactive upgrades in a terminal window.
//!
//! The upgrade command runs inside a terminal emulator so the user can answer
//! prompts and enter a password. The daemon does not wait for it on the control
//! loop: a watcher task waits for the terminal to exit and reports
//! [`DaemonEvent::UpgradeFinished`], whatever the exit status, so the next
//! check shows the post-upgrade state.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::checker::CommandSpec;
use crate::event::DaemonEvent;

/// Pause between the terminal closing and the follow-up check.
pub const POST_UPGRADE_DELAY: Duration = Duration::from_secs(1);

/// Known terminal emulators in preference order, with the arguments that make
/// them run a command.
const KNOWN_TERMINALS: &[(&str, &[&str])] = &[
    // --wait keeps the client process alive until the window closes.
    ("gnome-terminal", &["--wait", "--"]),
    ("konsole", &["-e"]),
    ("xterm", &["-e"]),
    ("kitty", &["--"]),
    ("alacritty", &["-e"]),
];

/// A terminal emulator able to run a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    pub name: String,
    pub program: PathBuf,
    /// Arguments placed between the program and the command to run.
    pub exec_args: Vec<String>,
}

impl Terminal {
    fn known(name: &str, program: PathBuf) -> Self {
        let exec_args = KNOWN_TERMINALS
            .iter()
            .find(|(known, _)| *known == name)
            .map_or(&["-e"][..], |(_, args)| *args);
        Self {
            name: name.to_string(),
            program,
            exec_args: exec_args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Finds a terminal on `PATH`. A `preferred` terminal is used exclusively:
/// if it is missing, no other terminal is tried.
pub fn detect_terminal(preferred: Option<&str>) -> Option<Terminal> {
    if let Some(name) = preferred {
        return which::which(name).ok().map(|path| Terminal::known(name, path));
    }
    KNOWN_TERMINALS.iter().find_map(|(name, _)| {
        which::which(name)
            .ok()
            .map(|path| Terminal::known(name, path))
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The terminal opened; completion arrives as [`DaemonEvent::UpgradeFinished`].
    Started { terminal: String },
    /// An upgrade terminal from an earlier run is still open.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchFailure {
    #[error(
        "Could not find a suitable terminal emulator. Please install gnome-terminal, konsole, or xterm."
    )]
    NoTerminal,
    #[error("Failed to launch {terminal}: {message}")]
    Spawn { terminal: String, message: String },
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub upgrade: CommandSpec,
    /// Terminal to use instead of auto-detection.
    pub terminal: Option<String>,
    pub completion_delay: Duration,
}

/// `yay` with no arguments: a full interactive upgrade.
pub fn default_upgrade_command() -> CommandSpec {
    CommandSpec::new("yay", &[])
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            upgrade: default_upgrade_command(),
            terminal: None,
            completion_delay: POST_UPGRADE_DELAY,
        }
    }
}

pub struct UpdateRunner {
    config: RunnerConfig,
    /// Resolved terminal; detected on each run when `None`.
    terminal: Option<Terminal>,
    running: Arc<AtomicBool>,
    events: mpsc::Sender<DaemonEvent>,
}

impl UpdateRunner {
    pub fn new(config: RunnerConfig, events: mpsc::Sender<DaemonEvent>) -> Self {
        Self {
            config,
            terminal: None,
            running: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    /// Uses `terminal` for every run instead of looking one up.
    pub fn with_terminal(mut self, terminal: Terminal) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// True while an upgrade terminal is open.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Opens the upgrade terminal. Returns as soon as it is spawned.
    pub fn run(&self) -> Result<RunOutcome, LaunchFailure> {
        if self.is_running() {
            return Ok(RunOutcome::AlreadyRunning);
        }

        let terminal = match &self.terminal {
            Some(terminal) => terminal.clone(),
            None => detect_terminal(self.config.terminal.as_deref())
                .ok_or(LaunchFailure::NoTerminal)?,
        };

        let mut child = Command::new(&terminal.program)
            .args(&terminal.exec_args)
            .arg("bash")
            .arg("-c")
            .arg(self.script())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LaunchFailure::Spawn {
                terminal: terminal.name.clone(),
                message: e.to_string(),
            })?;

        self.running.store(true, Ordering::SeqCst);
        info!("Launched upgrade in {}", terminal.name);

        let running = Arc::clone(&self.running);
        let events = self.events.clone();
        let delay = self.config.completion_delay;
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Lost track of the upgrade terminal: {e}");
                    None
                }
            };
            running.store(false, Ordering::SeqCst);
            info!("Upgrade terminal closed (exit code {exit_code:?})");
            tokio::time::sleep(delay).await;
            let _ = events.send(DaemonEvent::UpgradeFinished { exit_code }).await;
        });

        Ok(RunOutcome::Started {
            terminal: terminal.name,
        })
    }

    /// Shell script run inside the terminal; it keeps the window open until Enter.
    fn script(&self) -> String {
        format!(
            "echo 'Running {upgrade}...'; {upgrade}; echo 'Press Enter to close...'; read _",
            upgrade = self.config.upgrade
        )
    }
}
