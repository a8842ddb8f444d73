//! One archive run, start to finish.
//!
//! lock -> mount point -> mount -> archive -> notify -> unmount -> unlock.
//! Fatal steps short-circuit; the lock and an owned mount are still released
//! because both are guards.

use std::fs;
use std::io;
use std::path::PathBuf;

use roadvault_logging::RunLogHandle;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::archive::{ArchiveEngine, ArchiveError, ArchiveReport};
use crate::cancel::CancellationToken;
use crate::config::{ConfigError, RunContext, Settings};
use crate::lock::{LockError, RunLock};
use crate::mount::{MountBackend, MountController, MountError};
use crate::notify::{Notifier, RunNotice};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_LOCKED: u8 = 3;
pub const EXIT_DEVICE: u8 = 4;
pub const EXIT_MOUNT: u8 = 5;
pub const EXIT_DESTINATION: u8 = 6;
pub const EXIT_INTERRUPTED: u8 = 130;

/// Conditions that end a run before a verdict exists.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Failed to create mount point {}: {source}", .path.display())]
    MountPoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Run interrupted before archiving")]
    Interrupted,
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) => EXIT_CONFIG,
            RunError::Lock(_) => EXIT_LOCKED,
            RunError::MountPoint { .. } => EXIT_DESTINATION,
            RunError::Mount(MountError::DeviceNotFound { .. })
            | RunError::Mount(MountError::NotBlockDevice { .. }) => EXIT_DEVICE,
            RunError::Mount(_) => EXIT_MOUNT,
            RunError::Archive(_) => EXIT_DESTINATION,
            RunError::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// A run that reached a verdict.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: ArchiveReport,
    pub notified: bool,
    pub unmounted: bool,
    pub interrupted: bool,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        if self.interrupted {
            EXIT_INTERRUPTED
        } else if self.report.verdict.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILED
        }
    }
}

pub struct Orchestrator<M, N> {
    settings: Settings,
    mounts: MountController<M>,
    notifier: N,
    cancel: CancellationToken,
    run_log: Option<RunLogHandle>,
}

impl<M: MountBackend, N: Notifier> Orchestrator<M, N> {
    pub fn new(settings: Settings, backend: M, notifier: N, cancel: CancellationToken) -> Self {
        let mounts = MountController::new(backend, settings.device_dir.clone());
        Self {
            settings,
            mounts,
            notifier,
            cancel,
            run_log: None,
        }
    }

    pub fn with_run_log(mut self, run_log: RunLogHandle) -> Self {
        self.run_log = Some(run_log);
        self
    }

    pub fn mounts(&self) -> &MountController<M> {
        &self.mounts
    }

    pub fn run(&self, context: &RunContext) -> Result<RunOutcome, RunError> {
        let _lock = RunLock::acquire(&self.settings.lock_path)?;
        self.check_cancelled()?;

        let mount_point = context.mount_point();
        fs::create_dir_all(&mount_point).map_err(|source| RunError::MountPoint {
            path: mount_point.clone(),
            source,
        })?;

        let guard = self.mounts.ensure_mounted(context.device_id(), &mount_point)?;
        self.check_cancelled()?;

        let mut engine = ArchiveEngine::new(self.settings.sync_timeout(), self.cancel.clone())
            .with_empty_policy(self.settings.empty_archive);
        if let Some(run_log) = &self.run_log {
            engine = engine.with_run_log(run_log.clone());
        }
        let report = engine.run(context)?;

        let notified = match self.notifier.notify(&RunNotice::from_report(&report)) {
            Ok(()) => {
                info!("Run notification sent ({})", report.verdict.status);
                true
            }
            Err(e) => {
                warn!("Run notification failed: {}", e);
                false
            }
        };

        let unmounted = match guard.release_if_owned() {
            Ok(unmounted) => unmounted,
            Err(e) => {
                error!("Failed to unmount {}: {}", mount_point.display(), e);
                false
            }
        };

        let interrupted = self.cancel.is_cancelled();
        if interrupted {
            warn!("Run interrupted by signal {:?}", self.cancel.signal());
        }

        Ok(RunOutcome {
            report,
            notified,
            unmounted,
            interrupted,
        })
    }

    fn check_cancelled(&self) -> Result<(), RunError> {
        if self.cancel.is_cancelled() {
            return Err(RunError::Interrupted);
        }
        Ok(())
    }
}
