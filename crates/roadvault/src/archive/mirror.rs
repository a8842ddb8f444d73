//! Directory mirroring.
//!
//! After a successful [`mirror_dir`] the destination holds exactly the
//! source tree: new and changed files are copied, extraneous entries are
//! deleted. Symlinks are followed and stored as real files. Permission bits
//! and timestamps are carried over, directories last so copying into them
//! does not disturb their mtime.
//!
//! Per-entry failures do not stop the walk. They are collected and returned
//! as [`MirrorError::Incomplete`]; deletion is skipped in that case so a
//! source read error never removes data already on the destination.

use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use filetime::FileTime;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancellationToken;

const TMP_PREFIX: &str = ".roadvault-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub files_copied: u64,
    pub files_unchanged: u64,
    pub bytes_copied: u64,
    pub dirs_created: u64,
    pub entries_deleted: u64,
    pub entries_skipped: u64,
}

/// A single entry that could not be mirrored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorIssue {
    pub path: PathBuf,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Source is not a directory: {}", .0.display())]
    SourceNotDirectory(PathBuf),

    #[error("Failed to prepare {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Mirror interrupted")]
    Interrupted,

    #[error("Mirror exceeded its {}s time limit", .0.as_secs())]
    TimedOut(Duration),

    #[error(
        "{} entries failed to mirror (first: {})",
        .issues.len(),
        .issues.first().map(MirrorIssue::to_string).unwrap_or_default()
    )]
    Incomplete {
        issues: Vec<MirrorIssue>,
        stats: MirrorStats,
    },
}

impl fmt::Display for MirrorIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Bounds on a single mirror call.
#[derive(Debug, Clone, Default)]
pub struct MirrorOptions {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

struct Mirror<'a> {
    src: &'a Path,
    dst: &'a Path,
    deadline: Option<(Instant, Duration)>,
    cancel: &'a CancellationToken,
    stats: MirrorStats,
    issues: Vec<MirrorIssue>,
    seen: HashSet<PathBuf>,
    dirs: Vec<(PathBuf, Metadata)>,
}

/// Mirror `src` into `dst`, creating `dst` if needed.
pub fn mirror_dir(src: &Path, dst: &Path, options: &MirrorOptions) -> Result<MirrorStats, MirrorError> {
    let src_meta = fs::metadata(src).map_err(|_| MirrorError::SourceNotDirectory(src.to_path_buf()))?;
    if !src_meta.is_dir() {
        return Err(MirrorError::SourceNotDirectory(src.to_path_buf()));
    }

    let mut mirror = Mirror {
        src,
        dst,
        deadline: options.timeout.map(|t| (Instant::now() + t, t)),
        cancel: &options.cancel,
        stats: MirrorStats::default(),
        issues: Vec::new(),
        seen: HashSet::new(),
        dirs: Vec::new(),
    };

    if mirror.ensure_dir(dst).map_err(|source| MirrorError::Destination {
        path: dst.to_path_buf(),
        source,
    })? {
        mirror.stats.dirs_created += 1;
    }
    mirror.dirs.push((dst.to_path_buf(), src_meta));

    mirror.copy_tree()?;

    if mirror.issues.is_empty() {
        mirror.delete_extraneous()?;
    } else {
        warn!(
            "Skipping deletion in {} after {} read errors",
            dst.display(),
            mirror.issues.len()
        );
    }

    mirror.apply_dir_metadata();

    if mirror.issues.is_empty() {
        Ok(mirror.stats)
    } else {
        Err(MirrorError::Incomplete {
            issues: mirror.issues,
            stats: mirror.stats,
        })
    }
}

impl<'a> Mirror<'a> {
    fn check_bounds(&self) -> Result<(), MirrorError> {
        if self.cancel.is_cancelled() {
            return Err(MirrorError::Interrupted);
        }
        if let Some((deadline, limit)) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MirrorError::TimedOut(limit));
            }
        }
        Ok(())
    }

    fn record(&mut self, path: &Path, err: impl std::fmt::Display) {
        warn!("Failed to mirror {}: {}", path.display(), err);
        self.issues.push(MirrorIssue {
            path: path.to_path_buf(),
            message: err.to_string(),
        });
    }

    fn copy_tree(&mut self) -> Result<(), MirrorError> {
        let walker = WalkDir::new(self.src)
            .follow_links(true)
            .min_depth(1)
            .sort_by_file_name();

        for entry in walker {
            self.check_bounds()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(self.src).to_path_buf();
                    self.record(&path, e);
                    continue;
                }
            };

            let rel = match entry.path().strip_prefix(self.src) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => continue,
            };
            let target = self.dst.join(&rel);
            self.seen.insert(rel);

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    self.record(entry.path(), e);
                    continue;
                }
            };

            if meta.is_dir() {
                match self.ensure_dir(&target) {
                    Ok(created) => {
                        if created {
                            self.stats.dirs_created += 1;
                        }
                        self.dirs.push((target, meta));
                    }
                    Err(e) => self.record(&target, e),
                }
            } else if meta.is_file() {
                if let Err(e) = self.sync_file(entry.path(), &target, &meta) {
                    self.record(entry.path(), e);
                }
            } else {
                debug!("Skipping non-regular file {}", entry.path().display());
                self.stats.entries_skipped += 1;
            }
        }
        Ok(())
    }

    /// Returns true when the directory had to be created.
    fn ensure_dir(&self, path: &Path) -> io::Result<bool> {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => Ok(false),
            Ok(_) => {
                fs::remove_file(path)?;
                fs::create_dir(path)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(path)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    fn sync_file(&mut self, src: &Path, dst: &Path, src_meta: &Metadata) -> io::Result<()> {
        match fs::symlink_metadata(dst) {
            Ok(dst_meta) if dst_meta.is_dir() => {
                fs::remove_dir_all(dst)?;
            }
            Ok(dst_meta) if dst_meta.is_file() && unchanged(src_meta, &dst_meta) => {
                self.stats.files_unchanged += 1;
                return Ok(());
            }
            Ok(_) | Err(_) => {}
        }

        let bytes = copy_via_temp(src, dst, src_meta)?;
        self.stats.files_copied += 1;
        self.stats.bytes_copied += bytes;
        Ok(())
    }

    fn delete_extraneous(&mut self) -> Result<(), MirrorError> {
        let extraneous: Vec<(PathBuf, bool)> = WalkDir::new(self.dst)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(self.dst).ok()?;
                if self.seen.contains(rel) {
                    None
                } else {
                    Some((entry.path().to_path_buf(), entry.file_type().is_dir()))
                }
            })
            .collect();

        for (path, is_dir) in extraneous {
            self.check_bounds()?;
            let removed = if is_dir {
                fs::remove_dir(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    self.stats.entries_deleted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => self.record(&path, e),
            }
        }
        Ok(())
    }

    fn apply_dir_metadata(&mut self) {
        let dirs = std::mem::take(&mut self.dirs);
        for (path, meta) in dirs.iter().rev() {
            if let Err(e) = fs::set_permissions(path, meta.permissions()) {
                self.record(path, e);
                continue;
            }
            if let Err(e) = filetime::set_file_times(
                path,
                FileTime::from_last_access_time(meta),
                FileTime::from_last_modification_time(meta),
            ) {
                self.record(path, e);
            }
        }
    }
}

/// Quick check: same size and modification time.
fn unchanged(src: &Metadata, dst: &Metadata) -> bool {
    src.len() == dst.len()
        && FileTime::from_last_modification_time(src) == FileTime::from_last_modification_time(dst)
}

/// Copy into a uniquely named temp file next to `dst`, then rename over it.
///
/// The temp file is created with `O_EXCL`, so it never clobbers an entry
/// that is already there; it is removed on drop if the copy fails.
fn copy_via_temp(src: &Path, dst: &Path, src_meta: &Metadata) -> io::Result<u64> {
    let dir = dst.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new().prefix(TMP_PREFIX).tempfile_in(dir)?;
    let mut reader = File::open(src)?;
    let bytes = io::copy(&mut reader, tmp.as_file_mut())?;
    fs::set_permissions(tmp.path(), src_meta.permissions())?;
    filetime::set_file_times(
        tmp.path(),
        FileTime::from_last_access_time(src_meta),
        FileTime::from_last_modification_time(src_meta),
    )?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(bytes)
}
