use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::paths;

/// Check cadences offered to the user, in seconds: 30 min, 1 h, 2 h, 3 h, 6 h, 12 h, daily.
pub const SUPPORTED_INTERVALS_SECS: [u64; 7] = [1_800, 3_600, 7_200, 10_800, 21_600, 43_200, 86_400];
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3_600;

const KEY_CHECK_INTERVAL: &str = "check_interval_secs";
const KEY_LAST_CHECK: &str = "last_check";
const LEGACY_KEY_CHECK_INTERVAL: &str = "check_interval";

/// Durable notifier settings. Serialized to `~/.config/yay-traynote/settings.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Seconds between automatic checks. Always one of [`SUPPORTED_INTERVALS_SECS`].
    pub check_interval_secs: u64,
    /// When the last successful check completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            last_check: None,
        }
    }
}

/// Snaps `secs` to the nearest supported cadence. Ties go to the shorter one.
pub fn clamp_interval(secs: i64) -> u64 {
    SUPPORTED_INTERVALS_SECS
        .iter()
        .copied()
        .min_by_key(|supported| (*supported as i64).abs_diff(secs))
        .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
}

/// Human-readable label for a cadence, as shown in menus.
pub fn interval_label(secs: u64) -> String {
    match secs {
        86_400 => "daily".to_string(),
        s if s % 3_600 == 0 => match s / 3_600 {
            1 => "1 hour".to_string(),
            h => format!("{h} hours"),
        },
        s => format!("{} minutes", s / 60),
    }
}

/// Parses settings leniently: unknown keys are ignored and every missing or
/// invalid key falls back to its default on its own.
/// Fails only when `content` is not a TOML document at all.
pub fn parse_settings(content: &str) -> Result<Settings> {
    let table: toml::Table = content.parse().context("Settings file is not valid TOML")?;
    let mut settings = Settings::default();

    match table.get(KEY_CHECK_INTERVAL) {
        Some(toml::Value::Integer(secs)) => settings.check_interval_secs = clamp_interval(*secs),
        Some(other) => warn!("Ignoring invalid {KEY_CHECK_INTERVAL} value: {other}"),
        None => {}
    }

    settings.last_check = match table.get(KEY_LAST_CHECK) {
        Some(toml::Value::String(s)) => parse_instant(s),
        Some(toml::Value::Datetime(dt)) => parse_instant(&dt.to_string()),
        Some(toml::Value::Integer(epoch)) => Utc.timestamp_opt(*epoch, 0).single(),
        _ => None,
    };

    Ok(settings)
}

/// Reads the JSON settings written by earlier releases
/// (`check_interval` seconds, `last_check` as a naive local ISO timestamp).
fn parse_legacy_settings(content: &str) -> Result<Settings> {
    let value: serde_json::Value =
        serde_json::from_str(content).context("Legacy settings file is not valid JSON")?;
    let mut settings = Settings::default();
    if let Some(secs) = value.get(LEGACY_KEY_CHECK_INTERVAL).and_then(|v| v.as_i64()) {
        settings.check_interval_secs = clamp_interval(secs);
    }
    settings.last_check = value
        .get(KEY_LAST_CHECK)
        .and_then(|v| v.as_str())
        .and_then(parse_instant);
    Ok(settings)
}

/// Accepts RFC 3339, or an ISO timestamp without offset interpreted as local time.
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Writes `contents` to a temp file in the same directory and renames it over
/// `path`, so readers never observe a half-written file.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    drop(file);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Owns the durable [`Settings`].
///
/// The in-memory copy is authoritative for the running process; every change
/// is written through to disk immediately. A failing disk is reported once and
/// then stays quiet until a write succeeds again.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
    /// True while the most recent write attempt failed.
    write_failing: bool,
}

impl SettingsStore {
    /// Loads settings from `path`. Never fails: a missing, unreadable or
    /// corrupt file yields the defaults.
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            settings: load_or_default(path),
            write_failing: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the settings and writes them to disk. The in-memory value is
    /// updated even when the write fails.
    pub fn save(&mut self, settings: Settings) -> Result<()> {
        self.settings = settings;
        let result = self.write();
        self.record_write(&result);
        result
    }

    /// Applies `change` and saves. Write failures are logged, not returned.
    pub fn update(&mut self, change: impl FnOnce(&mut Settings)) {
        let mut next = self.settings.clone();
        change(&mut next);
        if next == self.settings && !self.write_failing {
            return;
        }
        let _ = self.save(next);
    }

    /// Retries a write that failed earlier. No-op when the disk is in sync.
    pub fn flush(&mut self) {
        if self.write_failing {
            let result = self.write();
            self.record_write(&result);
        }
    }

    fn write(&self) -> Result<()> {
        let content =
            toml::to_string_pretty(&self.settings).context("Failed to serialize settings")?;
        atomic_write(&self.path, &content)
    }

    fn record_write(&mut self, result: &Result<()>) {
        match (result, self.write_failing) {
            (Ok(()), true) => {
                info!("Settings saved again to {}", self.path.display());
                self.write_failing = false;
            }
            (Ok(()), false) => debug!("Settings saved to {}", self.path.display()),
            (Err(e), false) => {
                warn!("Failed to save settings (keeping them in memory): {e:#}");
                self.write_failing = true;
            }
            (Err(e), true) => debug!("Settings still not writable: {e:#}"),
        }
    }
}

/// Loads the settings at `path`, migrating from the legacy JSON file when only
/// that one exists. Any failure falls back to defaults.
fn load_or_default(path: &Path) -> Settings {
    let (source, parse): (PathBuf, fn(&str) -> Result<Settings>) = if path.exists() {
        (path.to_path_buf(), parse_settings)
    } else {
        let legacy = paths::legacy_settings_file(path);
        if !legacy.exists() {
            debug!("No settings file at {}; using defaults", path.display());
            return Settings::default();
        }
        info!("Migrating settings from {}", legacy.display());
        (legacy, parse_legacy_settings)
    };

    let loaded = fs::read_to_string(&source)
        .with_context(|| format!("Failed to read settings file: {}", source.display()))
        .and_then(|content| parse(&content));

    match loaded {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Using default settings: {e:#}");
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    // ── clamp_interval ────────────────────────────────────────────────────────

    #[test]
    fn supported_intervals_are_kept() {
        for secs in SUPPORTED_INTERVALS_SECS {
            assert_eq!(clamp_interval(secs as i64), secs);
        }
    }

    #[test]
    fn out_of_range_values_snap_to_nearest() {
        assert_eq!(clamp_interval(0), 1_800);
        assert_eq!(clamp_interval(-50), 1_800);
        assert_eq!(clamp_interval(4_000), 3_600);
        assert_eq!(clamp_interval(10_000_000), 86_400);
    }

    #[test]
    fn ties_snap_to_shorter_interval() {
        // Exactly between 1 h and 2 h.
        assert_eq!(clamp_interval(5_400), 3_600);
    }

    #[test]
    fn interval_labels() {
        assert_eq!(interval_label(1_800), "30 minutes");
        assert_eq!(interval_label(3_600), "1 hour");
        assert_eq!(interval_label(21_600), "6 hours");
        assert_eq!(interval_label(86_400), "daily");
    }

    // ── parse_settings ────────────────────────────────────────────────────────

    #[test]
    fn parse_full_settings() {
        let s = parse_settings(
            "check_interval_secs = 7200\nlast_check = \"2026-01-02T03:04:05Z\"\n",
        )
        .unwrap();
        assert_eq!(s.check_interval_secs, 7_200);
        assert_eq!(s.last_check, Some(at("2026-01-02T03:04:05Z")));
    }

    #[test]
    fn parse_accepts_epoch_and_native_datetime() {
        let epoch = parse_settings("last_check = 1700000000\n").unwrap();
        assert_eq!(epoch.last_check.unwrap().timestamp(), 1_700_000_000);

        let native = parse_settings("last_check = 2026-01-02T03:04:05Z\n").unwrap();
        assert_eq!(native.last_check, Some(at("2026-01-02T03:04:05Z")));
    }

    #[test]
    fn invalid_fields_fall_back_individually() {
        let s = parse_settings(
            "check_interval_secs = \"often\"\nlast_check = \"2026-01-02T03:04:05Z\"\n",
        )
        .unwrap();
        assert_eq!(s.check_interval_secs, DEFAULT_CHECK_INTERVAL_SECS);
        assert!(s.last_check.is_some());

        let s = parse_settings("check_interval_secs = 1800\nlast_check = \"yesterday\"\n").unwrap();
        assert_eq!(s.check_interval_secs, 1_800);
        assert!(s.last_check.is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let s = parse_settings("check_interval_secs = 43200\ntheme = \"dark\"\n[extra]\na = 1\n")
            .unwrap();
        assert_eq!(s.check_interval_secs, 43_200);
    }

    #[test]
    fn stored_out_of_range_interval_is_clamped() {
        let s = parse_settings("check_interval_secs = 60\n").unwrap();
        assert_eq!(s.check_interval_secs, 1_800);
    }

    #[test]
    fn parse_rejects_non_toml() {
        assert!(parse_settings("this is not valid toml ][[[").is_err());
    }

    // ── SettingsStore ─────────────────────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(&dir.path().join("settings.toml"));
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn load_corrupt_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "check_interval_secs = = =").unwrap();
        let store = SettingsStore::load(&path);
        assert_eq!(store.settings(), &Settings::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let saved = Settings {
            check_interval_secs: 21_600,
            last_check: Some(at("2026-10-19T08:30:00Z")),
        };

        let mut store = SettingsStore::load(&path);
        store.save(saved.clone()).unwrap();

        assert_eq!(SettingsStore::load(&path).settings(), &saved);
    }

    #[test]
    fn save_without_last_check_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let saved = Settings {
            check_interval_secs: 1_800,
            last_check: None,
        };
        SettingsStore::load(&path).save(saved.clone()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains(KEY_LAST_CHECK));
        assert_eq!(SettingsStore::load(&path).settings(), &saved);
    }

    #[test]
    fn save_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut store = SettingsStore::load(&path);
        store.update(|s| s.check_interval_secs = 7_200);
        store.update(|s| s.check_interval_secs = 10_800);

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("settings.toml")]);
    }

    #[test]
    fn failed_save_keeps_settings_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the config directory should be.
        let blocker = dir.path().join("config");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("settings.toml");

        let mut store = SettingsStore::load(&path);
        let result = store.save(Settings {
            check_interval_secs: 43_200,
            last_check: None,
        });

        assert!(result.is_err());
        assert!(store.write_failing);
        assert_eq!(store.settings().check_interval_secs, 43_200);
    }

    #[test]
    fn flush_retries_failed_write() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("config");
        fs::write(&blocker, "").unwrap();
        let path = blocker.join("settings.toml");

        let mut store = SettingsStore::load(&path);
        store.update(|s| s.check_interval_secs = 86_400);
        assert!(store.write_failing);

        fs::remove_file(&blocker).unwrap();
        store.flush();

        assert!(!store.write_failing);
        assert_eq!(SettingsStore::load(&path).settings().check_interval_secs, 86_400);
    }

    #[test]
    fn legacy_json_settings_are_migrated() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(paths::LEGACY_SETTINGS_FILE_NAME),
            r#"{"check_interval": 21600, "last_check": "2025-05-01T10:00:00.123456"}"#,
        )
        .unwrap();

        let store = SettingsStore::load(&dir.path().join(paths::SETTINGS_FILE_NAME));
        assert_eq!(store.settings().check_interval_secs, 21_600);
        assert!(store.settings().last_check.is_some());
    }

    #[test]
    fn toml_file_wins_over_legacy_json() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(paths::LEGACY_SETTINGS_FILE_NAME),
            r#"{"check_interval": 21600}"#,
        )
        .unwrap();
        let path = dir.path().join(paths::SETTINGS_FILE_NAME);
        fs::write(&path, "check_interval_secs = 1800\n").unwrap();

        assert_eq!(SettingsStore::load(&path).settings().check_interval_secs, 1_800);
    }
}
