//! Single-instance enforcement.
//!
//! The lock is a PID file under the runtime dir held with an exclusive
//! advisory lock (`flock`). A second daemon fails to take the lock and reports
//! the holder's PID. A file left behind by a process that died without cleaning
//! up carries no flock any more and is reclaimed.
//!
//! Release unlinks the file before unlocking it, so whoever wins the flock
//! afterwards checks that the inode it locked is still the one at the path and
//! starts over if not.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Outcome of [`acquire`].
#[derive(Debug)]
pub enum Acquire {
    Acquired(InstanceLock),
    /// Another live daemon holds the lock. Carries its PID when readable.
    AlreadyRunning { pid: Option<u32> },
}

/// An exclusively held instance lock. Released on [`InstanceLock::release`] or drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file and drops the flock. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink while still holding the flock so no successor's file is removed.
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove lock file {}: {e}", self.path.display());
            }
        }
        let _ = FileExt::unlock(&file);
        info!("Released instance lock {}", self.path.display());
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Attempts before giving up on a lock file that keeps being replaced.
const MAX_ATTEMPTS: usize = 5;

/// Tries to become the only running daemon for this session.
///
/// Errors only when the lock file cannot be created or locked at all.
pub fn acquire(path: &Path) -> Result<Acquire> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
    }

    for _ in 0..MAX_ATTEMPTS {
        let previous = read_pid(path);
        let file = open_lock_file(path)?;

        if !try_lock(&file, path)? {
            // A dead PID under a live flock means the holder has not written
            // its own PID yet.
            let pid = previous.filter(|pid| is_process_alive(*pid));
            return Ok(Acquire::AlreadyRunning { pid });
        }
        if !still_linked(&file, path)? {
            debug!("Lock file {} was replaced while locking; retrying", path.display());
            continue;
        }

        if let Some(pid) = previous.filter(|pid| *pid != std::process::id()) {
            info!("Reclaimed stale lock left by pid {pid}");
        }
        return claim(path, file);
    }
    bail!(
        "Lock file {} kept changing after {MAX_ATTEMPTS} attempts",
        path.display()
    )
}

/// True when `file` is still the inode `path` names.
fn still_linked(file: &File, path: &Path) -> Result<bool> {
    let held = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == held.dev() && current.ino() == held.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file {}", path.display()))
}

/// Returns `Ok(false)` when another descriptor holds the lock.
fn try_lock(file: &File, path: &Path) -> Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to lock {}", path.display())),
    }
}

/// Writes our PID into the freshly locked file.
fn claim(path: &Path, mut file: File) -> Result<Acquire> {
    let write_pid = |file: &mut File| -> std::io::Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()
    };
    write_pid(&mut file).with_context(|| format!("Failed to write pid to {}", path.display()))?;

    debug!("Acquired instance lock {}", path.display());
    Ok(Acquire::Acquired(InstanceLock {
        path: path.to_path_buf(),
        file: Some(file),
    }))
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// True when `pid` names a running (non-zombie) process.
pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}
