//! Canonical file locations for the notifier.
//!
//! Durable settings live under the user's config directory; everything tied to
//! a running daemon lives under the per-session runtime directory:
//!   - ~/.config/yay-traynote/settings.toml          Written by the daemon only.
//!   - $XDG_RUNTIME_DIR/yay-traynote/daemon.lock     Single-instance lock (holds the PID).
//!   - $XDG_RUNTIME_DIR/yay-traynote/control.sock    Control socket for menus and the CLI.
//!   - $XDG_RUNTIME_DIR/yay-traynote/status.toml     Written by the daemon, read by renderers.

use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "yay-traynote";
pub const SETTINGS_FILE_NAME: &str = "settings.toml";
/// Settings file written by earlier releases, read once if no TOML file exists yet.
pub const LEGACY_SETTINGS_FILE_NAME: &str = "settings.json";
pub const LOCK_FILE_NAME: &str = "daemon.lock";
pub const SOCKET_FILE_NAME: &str = "control.sock";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Resolved directories for one daemon instance.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl Paths {
    /// Uses the given overrides, falling back to the per-user defaults.
    pub fn resolve(config_dir: Option<PathBuf>, runtime_dir: Option<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.unwrap_or_else(default_config_dir),
            runtime_dir: runtime_dir.unwrap_or_else(default_runtime_dir),
        }
    }

    /// Places both directories under `root`. Used by tests.
    #[cfg(test)]
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            runtime_dir: root.join("run"),
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.runtime_dir.join(LOCK_FILE_NAME)
    }

    pub fn socket_file(&self) -> PathBuf {
        self.runtime_dir.join(SOCKET_FILE_NAME)
    }

    pub fn status_file(&self) -> PathBuf {
        self.runtime_dir.join(STATUS_FILE_NAME)
    }
}

/// Returns `~/.config/yay-traynote`, or a relative fallback when no home is known.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(APP_DIR_NAME)
}

/// Returns `$XDG_RUNTIME_DIR/yay-traynote`.
///
/// Without a runtime dir the temp dir is used, suffixed with the user name so
/// two users on one machine never share a lock.
pub fn default_runtime_dir() -> PathBuf {
    match dirs::runtime_dir() {
        Some(dir) => dir.join(APP_DIR_NAME),
        None => {
            let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
            std::env::temp_dir().join(format!("{APP_DIR_NAME}-{user}"))
        }
    }
}

/// The legacy JSON settings file that sits next to `settings_file`.
pub fn legacy_settings_file(settings_file: &Path) -> PathBuf {
    settings_file.with_file_name(LEGACY_SETTINGS_FILE_NAME)
}
