//! Process-level run locking.
//!
//! Archive runs are triggered by device plug events, which can overlap. Only
//! one run may hold the lock at a time; a second run fails fast instead of
//! queueing behind the first.
//!
//! The lock is an `flock(2)` on `roadvault.lock` taken through `fs2`; the
//! kernel drops it if the process is killed, so a leftover file never blocks
//! the next run.

use chrono::Local;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Program identity used to derive the lock file name.
pub const LOCK_NAME: &str = "roadvault";

/// A released holder may unlink the file between our open and our flock.
const MAX_ACQUIRE_ATTEMPTS: usize = 5;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another archive run is in progress (lock held: {})", .0.display())]
    Contended(PathBuf),

    #[error("Failed to create lock file {}: {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Default lock path: `/run/lock/roadvault.lock`, falling back to the
/// temp directory when `/run/lock` is absent.
pub fn default_lock_path() -> PathBuf {
    let file_name = format!("{LOCK_NAME}.lock");
    let run_lock = Path::new("/run/lock");
    if run_lock.is_dir() {
        run_lock.join(file_name)
    } else {
        std::env::temp_dir().join(file_name)
    }
}

/// A guard that holds the exclusive run lock.
///
/// Dropping the guard releases the lock and removes the lock file.
pub struct RunLock {
    file: Option<File>,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl RunLock {
    /// Try to acquire the run lock at `lock_path` without blocking.
    pub fn acquire(lock_path: &Path) -> Result<RunLock, LockError> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LockError::CreateFailed {
                    path: lock_path.to_path_buf(),
                    source,
                })?;
            }
        }

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            debug!(
                "Attempting to acquire run lock {} (attempt {})",
                lock_path.display(),
                attempt
            );

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_path)
                .map_err(|source| LockError::CreateFailed {
                    path: lock_path.to_path_buf(),
                    source,
                })?;

            // Fully qualified: std's File::try_lock_exclusive (1.89+) has a
            // different error type.
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(LockError::Contended(lock_path.to_path_buf()));
                }
                Err(e) => return Err(LockError::AcquireFailed(e)),
            }

            if !same_inode(&file, lock_path) {
                debug!("Lock file was replaced while locking, retrying");
                continue;
            }

            info!("Acquired run lock: {}", lock_path.display());
            let sidecar_path = write_lock_sidecar(lock_path);
            return Ok(RunLock {
                file: Some(file),
                lock_path: lock_path.to_path_buf(),
                sidecar_path,
            });
        }

        Err(LockError::Contended(lock_path.to_path_buf()))
    }

    /// Get the path to the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };

        debug!("Releasing run lock: {}", self.lock_path.display());
        // Unlink while still holding the flock so no other run can lock the
        // old inode after we let go.
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove lock file {}: {}", self.lock_path.display(), e);
            }
        }
        if let Some(path) = self.sidecar_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
        if let Err(e) = FileExt::unlock(&file) {
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
        info!("Released run lock: {}", self.lock_path.display());
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .field("held", &self.is_held())
            .finish()
    }
}

fn same_inode(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
}

/// `<lock>.json`, holder details written next to the lock file.
pub fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let ext = lock_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("lock");
    lock_path.with_extension(format!("{ext}.json"))
}

fn write_lock_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Local::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!(
                "Failed to write lock sidecar {}: {}",
                sidecar_path.display(),
                e
            );
            None
        }
    }
}
