//! Per-category outcomes and their reduction into a run verdict.

use std::fmt;

use super::category::Category;
use super::mirror::MirrorStats;
use crate::config::EmptyArchivePolicy;

/// Result of archiving one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryOutcome {
    Synced { stats: MirrorStats },
    /// Source directory absent; not a failure.
    SkippedSourceMissing,
    Failed { reason: String },
}

impl CategoryOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CategoryOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Fail,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate of all category outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: RunStatus,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Verdict {
    /// Reduce outcomes into a verdict.
    ///
    /// Success iff no attempted category failed. When nothing was attempted
    /// at all, `empty_policy` decides.
    pub fn from_outcomes<'a, I>(outcomes: I, empty_policy: EmptyArchivePolicy) -> Verdict
    where
        I: IntoIterator<Item = &'a CategoryOutcome>,
    {
        let (synced, skipped, failed) =
            outcomes
                .into_iter()
                .fold((0, 0, 0), |(synced, skipped, failed), outcome| match outcome {
                    CategoryOutcome::Synced { .. } => (synced + 1, skipped, failed),
                    CategoryOutcome::SkippedSourceMissing => (synced, skipped + 1, failed),
                    CategoryOutcome::Failed { .. } => (synced, skipped, failed + 1),
                });

        let status = if failed > 0 {
            RunStatus::Fail
        } else if synced == 0 {
            match empty_policy {
                EmptyArchivePolicy::Success => RunStatus::Success,
                EmptyArchivePolicy::Fail => RunStatus::Fail,
            }
        } else {
            RunStatus::Success
        };

        Verdict {
            status,
            synced,
            skipped,
            failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// No category source existed, so the snapshot holds only its log.
    pub fn is_empty_archive(&self) -> bool {
        self.synced == 0 && self.failed == 0
    }
}

/// Outcome for every category, in archive order.
pub type CategoryResults = Vec<(Category, CategoryOutcome)>;
