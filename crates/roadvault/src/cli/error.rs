//! Helpful error types for CLI commands
//!
//! Every error includes:
//! - What went wrong
//! - Context about the situation
//! - Suggestions for how to fix it

use std::fmt;
use std::path::Path;

use roadvault::config::{ConfigError, Settings};
use roadvault::lock::{self, LockError};
use roadvault::mount::MountError;
use roadvault::RunError;

/// An error with helpful context and suggestions
#[derive(Debug)]
pub struct HelpfulError {
    /// The main error message
    pub message: String,
    /// Additional context about what was happening
    pub context: Option<String>,
    /// Suggestions for how to fix the error
    pub suggestions: Vec<String>,
}

impl HelpfulError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions(mut self, suggestions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.suggestions.extend(suggestions.into_iter().map(|s| s.into()));
        self
    }

    // === Common error constructors ===

    /// Environment or settings file rejected
    pub fn config(err: &ConfigError) -> Self {
        let base = Self::new(err.to_string());
        match err {
            ConfigError::Missing { env, .. } => base
                .with_context("The archive trigger must pass the run environment")
                .with_suggestions([
                    format!("TRY: Export the variable: export {}=...", env),
                    "TRY: Pass it as a flag instead: roadvault --help".to_string(),
                ]),
            ConfigError::Invalid { .. } => base
                .with_context("A run environment value failed validation")
                .with_suggestion("TRY: Check the values with: roadvault --help"),
            ConfigError::Read { path, .. } => base
                .with_context("The settings file could not be read")
                .with_suggestions([
                    format!("TRY: Check that the file exists: ls -la {}", path.display()),
                    "TRY: Unset ROADVAULT_CONFIG to run with defaults".to_string(),
                ]),
            ConfigError::Parse { .. } => base
                .with_context("The settings file is not valid TOML or has unknown keys")
                .with_suggestion("TRY: Compare against the defaults: roadvault config"),
        }
    }

    /// Another run holds the lock
    pub fn lock_contended(lock_path: &Path) -> Self {
        Self::new("Another archive run is already in progress")
            .with_context(format!("Lock file: {}", lock_path.display()))
            .with_suggestions([
                format!(
                    "TRY: See which process holds it: cat {}",
                    lock::sidecar_path_for(lock_path).display()
                ),
                "TRY: Wait for the running archive to finish and re-plug the device".to_string(),
            ])
    }

    /// Device link missing under the device directory
    pub fn device_not_found(id: &str, path: &Path) -> Self {
        let dir = path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| Settings::default().device_dir.display().to_string());
        Self::new(format!("Archive device not found: {}", id))
            .with_context(format!("Expected a device link at {}", path.display()))
            .with_suggestions([
                format!("TRY: List known devices: ls -la {}", dir),
                "TRY: Check the filesystem UUID: lsblk -f".to_string(),
                "TRY: Verify ROADVAULT_DEVICE_UUID matches the device".to_string(),
            ])
    }

    /// mount(8) failed or timed out
    pub fn mount_failed(err: &MountError) -> Self {
        Self::new(err.to_string())
            .with_context("The archive device could not be mounted")
            .with_suggestions([
                "TRY: Check the kernel log: dmesg | tail".to_string(),
                "TRY: Set mount_fstype in the settings file if detection fails".to_string(),
                "TRY: Run as a user allowed to mount (usually root)".to_string(),
            ])
    }

    /// Mount point or snapshot directory could not be created
    pub fn destination(message: String, path: Option<&Path>) -> Self {
        let err = Self::new(message).with_context("The archive destination is not writable");
        match path {
            Some(path) => err.with_suggestion(format!(
                "TRY: Check permissions: ls -ld {}",
                path.display()
            )),
            None => err.with_suggestion("TRY: Check the mounted volume is writable and not full"),
        }
    }

    pub fn interrupted() -> Self {
        Self::new("Archive run interrupted")
            .with_context("A termination signal arrived before archiving started")
            .with_suggestion("TRY: Re-plug the device to start a new run")
    }
}

impl From<&RunError> for HelpfulError {
    fn from(err: &RunError) -> Self {
        match err {
            RunError::Config(e) => HelpfulError::config(e),
            RunError::Lock(LockError::Contended(path)) => HelpfulError::lock_contended(path),
            RunError::Lock(e) => HelpfulError::new(e.to_string())
                .with_context("The run lock could not be taken")
                .with_suggestion("TRY: Set lock_path in the settings file to a writable location"),
            RunError::MountPoint { path, .. } => {
                HelpfulError::destination(err.to_string(), Some(path))
            }
            RunError::Mount(MountError::DeviceNotFound { id, path }) => {
                HelpfulError::device_not_found(id, path)
            }
            RunError::Mount(e) => HelpfulError::mount_failed(e),
            RunError::Archive(_) => HelpfulError::destination(err.to_string(), None),
            RunError::Interrupted => HelpfulError::interrupted(),
        }
    }
}

impl fmt::Display for HelpfulError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: {}", self.message)?;
        if let Some(ctx) = &self.context {
            writeln!(f, "CONTEXT: {}", ctx)?;
        }
        if !self.suggestions.is_empty() {
            writeln!(f)?;
            for suggestion in &self.suggestions {
                writeln!(f, "  {}", suggestion)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HelpfulError {}
