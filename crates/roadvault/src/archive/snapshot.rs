use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Timelike};
use tracing::{debug, warn};

/// Directory name format of a snapshot.
pub const SNAPSHOT_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Run-local log file inside every snapshot.
pub const RUN_LOG_NAME: &str = "archive.log";

const MAX_CREATE_ATTEMPTS: usize = 3;

/// One timestamped archive directory under the mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    dir: PathBuf,
    started_at: DateTime<Local>,
}

impl Snapshot {
    /// Create a fresh snapshot directory named after the current second.
    ///
    /// The directory is created exclusively. If a snapshot for this second
    /// already exists, wait for the next second instead of reusing it.
    pub fn create(mount_point: &Path) -> io::Result<Snapshot> {
        let mut last_err = None;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let started_at = Local::now();
            let dir = mount_point.join(snapshot_name(&started_at));
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!("Created snapshot directory {}", dir.display());
                    return Ok(Snapshot { dir, started_at });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("Snapshot {} already exists, waiting for next second", dir.display());
                    std::thread::sleep(until_next_second(&started_at));
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AlreadyExists, "snapshot exists")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(RUN_LOG_NAME)
    }
}

pub fn snapshot_name(at: &DateTime<Local>) -> String {
    at.format(SNAPSHOT_FORMAT).to_string()
}

fn until_next_second(at: &DateTime<Local>) -> Duration {
    let nanos = u64::from(at.nanosecond() % 1_000_000_000);
    Duration::from_nanos(1_000_000_000 - nanos) + Duration::from_millis(5)
}

/// Flush the filesystem holding `path` to stable storage.
///
/// Uses `syncfs(2)` on Linux so only the archive volume is flushed; falls back
/// to a global `sync(2)` if that fails.
pub fn flush_filesystem(path: &Path) -> io::Result<()> {
    let dir = File::open(path)?;
    sync_fs(&dir).or_else(|e| {
        warn!("syncfs on {} failed ({}), falling back to sync", path.display(), e);
        // SAFETY: sync(2) takes no arguments and cannot fail.
        unsafe { libc::sync() };
        Ok(())
    })
}

#[cfg(target_os = "linux")]
fn sync_fs(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::syncfs(file.as_raw_fd()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn sync_fs(file: &File) -> io::Result<()> {
    file.sync_all()
}
