//! Mount control for the archive volume.
//!
//! The device is addressed by a stable identifier (a link under
//! `/dev/disk/by-uuid`) so kernel renumbering of `/dev/sdX` does not matter.
//! A run only ever unmounts a volume it mounted itself; the returned
//! [`MountGuard`] carries that ownership.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::process::{self, CommandError};

pub const PROC_MOUNTS: &str = "/proc/self/mounts";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("Device '{id}' not found at {}", .path.display())]
    DeviceNotFound { id: String, path: PathBuf },

    #[error("{} is not a block device", .path.display())]
    NotBlockDevice { path: PathBuf },

    #[error("Failed to mount {} on {}: {source}", .device.display(), .mount_point.display())]
    MountFailed {
        device: PathBuf,
        mount_point: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("Failed to unmount {}: {source}", .mount_point.display())]
    UnmountFailed {
        mount_point: PathBuf,
        #[source]
        source: CommandError,
    },

    #[error("Failed to read mount table {}: {source}", .path.display())]
    MountTable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Mount operations, split out so the run sequence can be exercised without
/// root privileges.
pub trait MountBackend {
    /// Source device of whatever is mounted at `mount_point`, if anything.
    fn mounted_device(&self, mount_point: &Path) -> Result<Option<String>, MountError>;

    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError>;

    fn unmount(&self, mount_point: &Path) -> Result<(), MountError>;
}

impl<B: MountBackend + ?Sized> MountBackend for &B {
    fn mounted_device(&self, mount_point: &Path) -> Result<Option<String>, MountError> {
        (**self).mounted_device(mount_point)
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError> {
        (**self).mount(device, mount_point)
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        (**self).unmount(mount_point)
    }
}

/// `mount(8)`/`umount(8)` with bounded runtime, mount state from `/proc`.
#[derive(Debug, Clone)]
pub struct SystemMount {
    mount_table: PathBuf,
    fstype: Option<String>,
    options: Option<String>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SystemMount {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTS),
            fstype: None,
            options: None,
            timeout,
            cancel,
        }
    }

    pub fn with_fstype(mut self, fstype: Option<String>) -> Self {
        self.fstype = fstype;
        self
    }

    pub fn with_options(mut self, options: Option<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }
}

impl MountBackend for SystemMount {
    fn mounted_device(&self, mount_point: &Path) -> Result<Option<String>, MountError> {
        let table = fs::read_to_string(&self.mount_table).map_err(|source| {
            MountError::MountTable {
                path: self.mount_table.clone(),
                source,
            }
        })?;
        let target = fs::canonicalize(mount_point).unwrap_or_else(|_| mount_point.to_path_buf());
        Ok(find_mount(&table, &target).map(|entry| entry.source))
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError> {
        let meta = fs::metadata(device).map_err(|_| MountError::DeviceNotFound {
            id: device.display().to_string(),
            path: device.to_path_buf(),
        })?;
        if !meta.file_type().is_block_device() {
            return Err(MountError::NotBlockDevice {
                path: device.to_path_buf(),
            });
        }

        let mut cmd = Command::new("mount");
        if let Some(fstype) = &self.fstype {
            cmd.arg("-t").arg(fstype);
        }
        if let Some(options) = &self.options {
            cmd.arg("-o").arg(options);
        }
        cmd.arg(device).arg(mount_point);

        process::run_with_timeout(&mut cmd, self.timeout, &self.cancel).map_err(|source| {
            MountError::MountFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                source,
            }
        })?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        // Cleanup must still run after a cancellation request.
        let mut cmd = Command::new("umount");
        cmd.arg(mount_point);
        process::run_with_timeout(&mut cmd, self.timeout, &CancellationToken::new()).map_err(
            |source| MountError::UnmountFailed {
                mount_point: mount_point.to_path_buf(),
                source,
            },
        )?;
        Ok(())
    }
}

/// One line of `/proc/self/mounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
}

/// Parse a mount table in `/proc/mounts` format.
pub fn parse_mount_table(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                target: PathBuf::from(unescape_mount_field(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Most recent mount on `target` (later lines shadow earlier ones).
pub fn find_mount(table: &str, target: &Path) -> Option<MountEntry> {
    parse_mount_table(table)
        .into_iter()
        .rev()
        .find(|entry| entry.target == target)
}

/// Decode the kernel's octal escapes (`\040` for space and friends).
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Resolves device identifiers and hands out [`MountGuard`]s.
pub struct MountController<B> {
    backend: B,
    device_dir: PathBuf,
}

impl<B: MountBackend> MountController<B> {
    pub fn new(backend: B, device_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            device_dir: device_dir.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Resolve `device_id` through the stable-link directory.
    pub fn resolve_device(&self, device_id: &str) -> Result<PathBuf, MountError> {
        let link = self.device_dir.join(device_id);
        if !link.exists() {
            return Err(MountError::DeviceNotFound {
                id: device_id.to_string(),
                path: link,
            });
        }
        Ok(fs::canonicalize(&link).unwrap_or(link))
    }

    /// Make sure the device is mounted on `mount_point`.
    ///
    /// An existing mount is left alone and the guard does not own it.
    pub fn ensure_mounted(
        &self,
        device_id: &str,
        mount_point: &Path,
    ) -> Result<MountGuard<'_, B>, MountError> {
        let device = self.resolve_device(device_id)?;
        debug!("Device {} resolved to {}", device_id, device.display());

        if let Some(existing) = self.backend.mounted_device(mount_point)? {
            if Path::new(&existing) != device {
                warn!(
                    "{} is already mounted from {}, expected {}; leaving it in place",
                    mount_point.display(),
                    existing,
                    device.display()
                );
            } else {
                info!("{} already mounted, not taking ownership", mount_point.display());
            }
            return Ok(MountGuard {
                backend: &self.backend,
                mount_point: mount_point.to_path_buf(),
                owned: false,
            });
        }

        info!("Mounting {} on {}", device.display(), mount_point.display());
        self.backend.mount(&device, mount_point)?;
        info!("Mounted {} on {}", device.display(), mount_point.display());

        Ok(MountGuard {
            backend: &self.backend,
            mount_point: mount_point.to_path_buf(),
            owned: true,
        })
    }
}

/// Scoped mount ownership.
///
/// Call [`MountGuard::release_if_owned`] at the end of the run; a guard that
/// is dropped without it (early return) releases on drop.
pub struct MountGuard<'a, B: MountBackend> {
    backend: &'a B,
    mount_point: PathBuf,
    owned: bool,
}

impl<'a, B: MountBackend> MountGuard<'a, B> {
    pub fn owned(&self) -> bool {
        self.owned
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount if this run mounted the volume.
    ///
    /// Returns `Ok(true)` when an unmount happened, `Ok(false)` when the mount
    /// belonged to someone else.
    pub fn release_if_owned(mut self) -> Result<bool, MountError> {
        if !self.owned {
            debug!("Mount on {} not owned by this run, leaving it", self.mount_point.display());
            return Ok(false);
        }
        self.owned = false;
        info!("Unmounting {}", self.mount_point.display());
        self.backend.unmount(&self.mount_point)?;
        info!("Unmounted {}", self.mount_point.display());
        Ok(true)
    }
}

impl<'a, B: MountBackend> Drop for MountGuard<'a, B> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        self.owned = false;
        warn!(
            "Run ended early, unmounting {}",
            self.mount_point.display()
        );
        if let Err(e) = self.backend.unmount(&self.mount_point) {
            warn!("Unmount during cleanup failed: {}", e);
        }
    }
}
