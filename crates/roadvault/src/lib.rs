//! roadvault: archive road-test data onto a removable device.
//!
//! A run is triggered when the archive device appears. It takes the run lock,
//! mounts the device under `<archive base>/road_test`, mirrors the `log`,
//! `bag` and `core` data categories into a fresh timestamped snapshot, posts a
//! status notification and unmounts again.

pub mod archive;
pub mod cancel;
pub mod config;
pub mod lock;
pub mod mount;
pub mod notify;
pub mod orchestrator;
pub mod process;

pub use archive::{ArchiveEngine, ArchiveReport, Category, RunStatus, Verdict};
pub use cancel::CancellationToken;
pub use config::{EmptyArchivePolicy, RunContext, Settings};
pub use orchestrator::{Orchestrator, RunError, RunOutcome};
