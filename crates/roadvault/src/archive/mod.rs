//! Archive engine.
//!
//! One call to [`ArchiveEngine::run`] produces one snapshot:
//! `<mount point>/<YYYY-MM-DD_HH-MM-SS>/{log,bag,core}` plus `archive.log`.
//! Categories are mirrored independently; a failed category never stops the
//! others, and the verdict is the reduction of all category outcomes.

pub mod category;
pub mod mirror;
pub mod snapshot;
pub mod verdict;

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use roadvault_logging::RunLogHandle;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{EmptyArchivePolicy, RunContext};

pub use category::Category;
pub use mirror::{mirror_dir, MirrorError, MirrorOptions, MirrorStats};
pub use snapshot::Snapshot;
pub use verdict::{CategoryOutcome, CategoryResults, RunStatus, Verdict};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to create snapshot directory under {}: {source}", .mount_point.display())]
    Snapshot {
        mount_point: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create run log {}: {source}", .path.display())]
    RunLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything one archive run produced.
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub snapshot: Snapshot,
    pub categories: CategoryResults,
    pub verdict: Verdict,
    pub finished_at: DateTime<Local>,
}

impl ArchiveReport {
    pub fn started_at(&self) -> DateTime<Local> {
        self.snapshot.started_at()
    }

    pub fn outcome(&self, category: Category) -> Option<&CategoryOutcome> {
        self.categories
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, outcome)| outcome)
    }
}

pub struct ArchiveEngine {
    sync_timeout: Duration,
    cancel: CancellationToken,
    empty_policy: EmptyArchivePolicy,
    run_log: Option<RunLogHandle>,
}

impl ArchiveEngine {
    pub fn new(sync_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            sync_timeout,
            cancel,
            empty_policy: EmptyArchivePolicy::default(),
            run_log: None,
        }
    }

    pub fn with_empty_policy(mut self, policy: EmptyArchivePolicy) -> Self {
        self.empty_policy = policy;
        self
    }

    /// Mirror process log lines into the snapshot's `archive.log`.
    pub fn with_run_log(mut self, run_log: RunLogHandle) -> Self {
        self.run_log = Some(run_log);
        self
    }

    /// Create a snapshot under the context's mount point and archive every
    /// category into it.
    ///
    /// Only snapshot/log creation is fatal; category problems end up in the
    /// verdict.
    pub fn run(&self, context: &RunContext) -> Result<ArchiveReport, ArchiveError> {
        let mount_point = context.mount_point();
        let snapshot = Snapshot::create(&mount_point).map_err(|source| ArchiveError::Snapshot {
            mount_point: mount_point.clone(),
            source,
        })?;
        self.open_run_log(&snapshot.log_path())?;

        info!(
            "Archive started at {}: {} -> {}",
            snapshot.started_at().format("%Y-%m-%d %H:%M:%S"),
            context.data_dir().display(),
            snapshot.dir().display()
        );

        let data_dir = context.data_dir();
        let categories: CategoryResults = Category::ALL
            .iter()
            .map(|&category| (category, self.archive_category(category, &data_dir, snapshot.dir())))
            .collect();

        let mut verdict =
            Verdict::from_outcomes(categories.iter().map(|(_, outcome)| outcome), self.empty_policy);

        if verdict.is_empty_archive() {
            warn!(
                "No category sources found under {}; snapshot {} is empty (empty archive policy: {})",
                data_dir.display(),
                snapshot.dir().display(),
                self.empty_policy
            );
        }

        if let Err(e) = snapshot::flush_filesystem(snapshot.dir()) {
            error!("Failed to flush {} to stable storage: {}", snapshot.dir().display(), e);
            verdict.status = RunStatus::Fail;
        }

        info!(
            "Archive finished: status={} synced={} skipped={} failed={}",
            verdict.status, verdict.synced, verdict.skipped, verdict.failed
        );
        self.close_run_log();

        Ok(ArchiveReport {
            snapshot,
            categories,
            verdict,
            finished_at: Local::now(),
        })
    }

    fn archive_category(&self, category: Category, data_dir: &Path, snapshot_dir: &Path) -> CategoryOutcome {
        let src = category.source_in(data_dir);
        if !src.exists() {
            info!("Skipping {}: source {} does not exist", category, src.display());
            return CategoryOutcome::SkippedSourceMissing;
        }

        let dst = category.destination_in(snapshot_dir);
        info!("Syncing {}: {} -> {}", category, src.display(), dst.display());

        let options = MirrorOptions {
            timeout: Some(self.sync_timeout),
            cancel: self.cancel.clone(),
        };
        match mirror_dir(&src, &dst, &options) {
            Ok(stats) => {
                info!(
                    "Synced {}: {} copied ({} bytes), {} unchanged, {} deleted",
                    category,
                    stats.files_copied,
                    stats.bytes_copied,
                    stats.files_unchanged,
                    stats.entries_deleted
                );
                CategoryOutcome::Synced { stats }
            }
            Err(e) => {
                error!("Sync of {} failed: {}", category, e);
                CategoryOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn open_run_log(&self, path: &Path) -> Result<(), ArchiveError> {
        let to_err = |source| ArchiveError::RunLog {
            path: path.to_path_buf(),
            source,
        };
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(to_err)?;
        if let Some(run_log) = &self.run_log {
            run_log.attach(path).map_err(to_err)?;
        }
        Ok(())
    }

    fn close_run_log(&self) {
        if let Some(run_log) = &self.run_log {
            if let Err(e) = run_log.detach() {
                warn!("Failed to flush run log: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        context: RunContext,
    }

    fn fixture(categories: &[&str]) -> Fixture {
        let temp = TempDir::new().unwrap();
        let workspace = temp.path().join("ws");
        for name in categories {
            let dir = workspace.join("data").join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{name}.dat")), name.as_bytes()).unwrap();
        }
        let context = RunContext::new(
            Some(workspace),
            Some("uuid".to_string()),
            Some("https://hooks.example.com/x".to_string()),
            Some(temp.path().join("archive")),
        )
        .unwrap();
        fs::create_dir_all(context.mount_point()).unwrap();
        Fixture {
            _temp: temp,
            context,
        }
    }

    fn engine() -> ArchiveEngine {
        ArchiveEngine::new(Duration::from_secs(60), CancellationToken::new())
    }

    #[test]
    fn test_archives_all_categories() {
        let fx = fixture(&["log", "bag", "core"]);
        let report = engine().run(&fx.context).unwrap();

        assert!(report.verdict.is_success());
        assert_eq!(report.verdict.synced, 3);
        let dir = report.snapshot.dir();
        assert!(dir.starts_with(fx.context.mount_point()));
        assert!(dir.join("archive.log").is_file());
        for name in ["log", "bag", "core"] {
            let copied = fs::read_to_string(dir.join(name).join(format!("{name}.dat"))).unwrap();
            assert_eq!(copied, name);
        }
        let order: Vec<_> = report.categories.iter().map(|(c, _)| *c).collect();
        assert_eq!(order, Category::ALL.to_vec());
    }

    #[test]
    fn test_missing_category_is_skipped() {
        let fx = fixture(&["log", "core"]);
        let report = engine().run(&fx.context).unwrap();

        assert!(report.verdict.is_success());
        assert_eq!(
            report.outcome(Category::Bag),
            Some(&CategoryOutcome::SkippedSourceMissing)
        );
        assert!(!report.snapshot.dir().join("bag").exists());
    }

    #[test]
    fn test_failed_category_does_not_stop_others() {
        let fx = fixture(&["log", "bag", "core"]);
        let bag = fx.context.data_dir().join("bag");
        symlink(bag.join("nowhere"), bag.join("broken.bag")).unwrap();

        let report = engine().run(&fx.context).unwrap();

        assert_eq!(report.verdict.status, RunStatus::Fail);
        assert!(report.outcome(Category::Bag).unwrap().is_failure());
        let dir = report.snapshot.dir();
        assert_eq!(fs::read_to_string(dir.join("log/log.dat")).unwrap(), "log");
        assert_eq!(fs::read_to_string(dir.join("core/core.dat")).unwrap(), "core");
        assert_eq!(fs::read_to_string(dir.join("bag/bag.dat")).unwrap(), "bag");
    }

    #[test]
    fn test_empty_archive_policy() {
        let fx = fixture(&[]);
        let report = engine().run(&fx.context).unwrap();
        assert!(report.verdict.is_success());
        assert!(report.verdict.is_empty_archive());

        let strict = engine().with_empty_policy(EmptyArchivePolicy::Fail);
        let report = strict.run(&fx.context).unwrap();
        assert_eq!(report.verdict.status, RunStatus::Fail);
    }

    #[test]
    fn test_unmounted_destination_is_fatal() {
        let fx = fixture(&["log"]);
        fs::remove_dir(fx.context.mount_point()).unwrap();
        let err = engine().run(&fx.context).unwrap_err();
        assert!(matches!(err, ArchiveError::Snapshot { .. }));
    }

    #[test]
    fn test_cancelled_run_fails_present_categories() {
        let fx = fixture(&["log", "core"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = ArchiveEngine::new(Duration::from_secs(60), cancel)
            .run(&fx.context)
            .unwrap();
        assert_eq!(report.verdict.status, RunStatus::Fail);
        assert_eq!(report.verdict.failed, 2);
        assert_eq!(report.verdict.skipped, 1);
    }

    #[test]
    fn test_run_log_captures_archive_window() {
        use std::io::Write;
        use tracing_subscriber::fmt::MakeWriter;

        let fx = fixture(&["log"]);
        let handle = RunLogHandle::new();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(handle.clone())
            .with_ansi(false)
            .finish();
        let report = tracing::subscriber::with_default(subscriber, || {
            engine().with_run_log(handle.clone()).run(&fx.context)
        })
        .unwrap();

        let content = fs::read_to_string(report.snapshot.log_path()).unwrap();
        assert!(content.contains("Syncing log"), "{content}");
        assert!(content.contains("Archive finished"), "{content}");

        // Detached after the run: further writes are dropped.
        assert!(handle.attached_path().is_none());
        handle.make_writer().write_all(b"late line\n").unwrap();
        let content = fs::read_to_string(report.snapshot.log_path()).unwrap();
        assert!(!content.contains("late line"));
    }
}
