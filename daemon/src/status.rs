use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::alert::AlertState;
use crate::config::atomic_write;

/// Indicator state as seen by renderers.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorState {
    /// Nothing pending and no check running; the icon is solid.
    Idle,
    /// A check is in flight; the icon flashes fast.
    Checking,
    /// The last check found updates; the icon flashes slowly until cleared.
    UpdatesAvailable,
}

impl From<AlertState> for IndicatorState {
    fn from(state: AlertState) -> Self {
        match state {
            AlertState::Idle => Self::Idle,
            AlertState::Checking => Self::Checking,
            AlertState::UpdatesAvailable(_) => Self::UpdatesAvailable,
        }
    }
}

/// Runtime status written by the daemon to `$XDG_RUNTIME_DIR/yay-traynote/status.toml`
/// and returned by the `status` control request. Renderers treat it as read-only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: IndicatorState,
    /// Pending updates known from the last successful check that has not been cleared.
    pub update_count: usize,
    /// `name old -> new` lines from the last successful check.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<String>,
    /// RFC 3339 timestamp of when `state` was entered; flash phase starts here.
    pub state_since: String,
    /// Flash period in seconds; absent while the icon is solid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_cycle_secs: Option<f64>,
    /// Icon brightness sampled at the last indicator tick.
    pub brightness: f32,
    pub tooltip: String,
    pub check_interval_secs: u64,
    /// RFC 3339 timestamp of the last successful check, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<String>,
    /// Human-readable error from the last failed check or upgrade launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True while an upgrade terminal is open.
    pub upgrade_running: bool,
}

/// Serializes `status` to TOML and writes it atomically to `path`.
/// Logs errors rather than failing; a status write never stops the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = atomic_write(path, &content) {
                warn!("Failed to write status file: {e:#}");
            }
        }
        Err(e) => warn!("Failed to serialize status: {e}"),
    }
}

/// Removes the status file on shutdown so renderers see the daemon is gone.
pub fn remove_status(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove status file {}: {e}", path.display());
        }
    }
}
