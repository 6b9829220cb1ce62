//! Lock files guarding registry snapshots.
//!
//! A snapshot at `path` is guarded by `path.lock`, holding the owner's pid.
//! Locks older than [`LOCK_TIMEOUT_MS`] are treated as abandoned.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Lock timeout in milliseconds.
const LOCK_TIMEOUT_MS: u64 = 5000;

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

fn is_stale(lock_path: &Path) -> Result<bool> {
    let age = lock_path
        .metadata()?
        .modified()?
        .elapsed()
        .unwrap_or(Duration::ZERO);
    Ok(age >= Duration::from_millis(LOCK_TIMEOUT_MS))
}

fn create_exclusive(lock_path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(lock_path)
}

/// Acquire an exclusive lock for `path`.
pub fn acquire_lock(path: &Path) -> Result<LockHandle> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut lock_file = match create_exclusive(&lock_path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            if !is_stale(&lock_path)? {
                return Err(Error::Snapshot(format!(
                    "Lock file is held: {}",
                    lock_path.display()
                )));
            }
            tracing::warn!("Removing stale lock: {}", lock_path.display());
            std::fs::remove_file(&lock_path).ok();
            create_exclusive(&lock_path)?
        }
        Err(e) => return Err(e.into()),
    };
    lock_file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    lock_file.sync_all()?;

    tracing::debug!("Acquired lock: {}", lock_path.display());
    Ok(LockHandle { lock_path })
}

/// Lock handle - releases lock when dropped.
pub struct LockHandle {
    lock_path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            tracing::warn!("Failed to release lock {}: {}", self.lock_path.display(), e);
        } else {
            tracing::debug!("Released lock: {}", self.lock_path.display());
        }
    }
}

/// Acquire lock, execute function, release lock.
pub fn with_lock<T, F>(path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let _lock = acquire_lock(path)?;
    f()
}
