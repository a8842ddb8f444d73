//! Run context and settings.
//!
//! The run context is the environment contract handed over by the trigger
//! (workspace, device, webhook, archive base). Settings are the optional
//! tuning knobs read from a TOML file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{lock, mount};

/// Directory under the archive base that the device is mounted on.
pub const ARCHIVE_SUBDIR: &str = "road_test";

/// Archive base used when none is given, relative to the workspace.
pub const DEFAULT_ARCHIVE_DIR: &str = "archive";

pub const ENV_WORKSPACE: &str = "ROADVAULT_WORKSPACE";
pub const ENV_DEVICE_UUID: &str = "ROADVAULT_DEVICE_UUID";
pub const ENV_WEBHOOK_URL: &str = "ROADVAULT_WEBHOOK_URL";
pub const ENV_ARCHIVE_BASE: &str = "ROADVAULT_ARCHIVE_BASE";
pub const ENV_CONFIG: &str = "ROADVAULT_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {name} (set {env})")]
    Missing {
        name: &'static str,
        env: &'static str,
    },

    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Validated, immutable inputs of one archive run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    workspace: PathBuf,
    device_id: String,
    webhook_url: String,
    archive_base: PathBuf,
}

impl RunContext {
    /// Validate raw inputs. Missing or blank required fields are fatal.
    ///
    /// `archive_base` falls back to `<workspace>/archive`.
    pub fn new(
        workspace: Option<PathBuf>,
        device_id: Option<String>,
        webhook_url: Option<String>,
        archive_base: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let workspace = non_empty_path(workspace).ok_or(ConfigError::Missing {
            name: "workspace path",
            env: ENV_WORKSPACE,
        })?;
        let device_id = non_empty(device_id).ok_or(ConfigError::Missing {
            name: "device identifier",
            env: ENV_DEVICE_UUID,
        })?;
        if device_id.contains('/') {
            return Err(ConfigError::Invalid {
                name: "device identifier",
                reason: format!("'{device_id}' must be a bare identifier, not a path"),
            });
        }
        let webhook_url = non_empty(webhook_url).ok_or(ConfigError::Missing {
            name: "webhook URL",
            env: ENV_WEBHOOK_URL,
        })?;
        validate_webhook_url(&webhook_url)?;

        let archive_base =
            non_empty_path(archive_base).unwrap_or_else(|| workspace.join(DEFAULT_ARCHIVE_DIR));

        Ok(Self {
            workspace,
            device_id,
            webhook_url,
            archive_base,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn archive_base(&self) -> &Path {
        &self.archive_base
    }

    /// `<workspace>/data`, parent of every category source.
    pub fn data_dir(&self) -> PathBuf {
        self.workspace.join("data")
    }

    /// `<archive base>/road_test`, where the device gets mounted.
    pub fn mount_point(&self) -> PathBuf {
        self.archive_base.join(ARCHIVE_SUBDIR)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty() && !p.to_string_lossy().trim().is_empty())
}

fn validate_webhook_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::Invalid {
        name: "webhook URL",
        reason: format!("'{url}': {e}"),
    })?;
    match parsed.scheme() {
        "https" | "http" => Ok(()),
        other => Err(ConfigError::Invalid {
            name: "webhook URL",
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// What to report when no category source exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyArchivePolicy {
    /// An empty snapshot still counts as a successful run.
    #[default]
    Success,
    /// An empty snapshot fails the run.
    Fail,
}

impl EmptyArchivePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmptyArchivePolicy::Success => "success",
            EmptyArchivePolicy::Fail => "fail",
        }
    }
}

impl fmt::Display for EmptyArchivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables read from the optional TOML settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub lock_path: PathBuf,
    /// Directory of stable device links, e.g. `/dev/disk/by-uuid`.
    pub device_dir: PathBuf,
    /// Mount table consulted to detect an existing mount.
    pub mount_table: PathBuf,
    pub mount_fstype: Option<String>,
    pub mount_options: Option<String>,
    pub mount_timeout_secs: u64,
    /// Per category.
    pub sync_timeout_secs: u64,
    pub notify_timeout_secs: u64,
    pub empty_archive: EmptyArchivePolicy,
    pub syslog: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_path: lock::default_lock_path(),
            device_dir: PathBuf::from("/dev/disk/by-uuid"),
            mount_table: PathBuf::from(mount::PROC_MOUNTS),
            mount_fstype: None,
            mount_options: None,
            mount_timeout_secs: 60,
            sync_timeout_secs: 3600,
            notify_timeout_secs: 15,
            empty_archive: EmptyArchivePolicy::Success,
            syslog: true,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs.max(1))
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs.max(1))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(
        workspace: Option<&str>,
        device: Option<&str>,
        webhook: Option<&str>,
        base: Option<&str>,
    ) -> Result<RunContext, ConfigError> {
        RunContext::new(
            workspace.map(PathBuf::from),
            device.map(String::from),
            webhook.map(String::from),
            base.map(PathBuf::from),
        )
    }

    #[test]
    fn test_valid_context_derives_paths() {
        let context = ctx(
            Some("/home/robot/ws"),
            Some("1234-ABCD"),
            Some("https://hooks.example.com/abc"),
            None,
        )
        .unwrap();
        assert_eq!(context.archive_base(), Path::new("/home/robot/ws/archive"));
        assert_eq!(
            context.mount_point(),
            PathBuf::from("/home/robot/ws/archive/road_test")
        );
        assert_eq!(context.data_dir(), PathBuf::from("/home/robot/ws/data"));
    }

    #[test]
    fn test_explicit_archive_base() {
        let context = ctx(
            Some("/ws"),
            Some("1234-ABCD"),
            Some("https://hooks.example.com/abc"),
            Some("/media/archive"),
        )
        .unwrap();
        assert_eq!(context.mount_point(), PathBuf::from("/media/archive/road_test"));
    }

    #[test]
    fn test_missing_fields_are_reported_by_env_name() {
        let err = ctx(None, Some("id"), Some("https://x.example"), None).unwrap_err();
        assert!(err.to_string().contains(ENV_WORKSPACE));

        let err = ctx(Some("/ws"), Some("   "), Some("https://x.example"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { env: ENV_DEVICE_UUID, .. }));

        let err = ctx(Some("/ws"), Some("id"), Some(""), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { env: ENV_WEBHOOK_URL, .. }));

        let err = ctx(Some(""), Some("id"), Some("https://x.example"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { env: ENV_WORKSPACE, .. }));
    }

    #[test]
    fn test_invalid_webhook_and_device() {
        let err = ctx(Some("/ws"), Some("id"), Some("not a url"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = ctx(Some("/ws"), Some("id"), Some("ftp://example.com"), None).unwrap_err();
        assert!(err.to_string().contains("ftp"));

        let err = ctx(Some("/ws"), Some("../sda1"), Some("https://x.example"), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "device identifier", .. }));
    }

    #[test]
    fn test_settings_defaults_and_partial_toml() {
        let settings = Settings::from_toml(
            r#"
mount_fstype = "exfat"
sync_timeout_secs = 120
empty_archive = "fail"
"#,
        )
        .unwrap();
        assert_eq!(settings.mount_fstype.as_deref(), Some("exfat"));
        assert_eq!(settings.sync_timeout(), Duration::from_secs(120));
        assert_eq!(settings.empty_archive, EmptyArchivePolicy::Fail);
        assert_eq!(settings.device_dir, PathBuf::from("/dev/disk/by-uuid"));
        assert_eq!(settings.notify_timeout_secs, 15);
        assert_eq!(settings.mount_table, PathBuf::from("/proc/self/mounts"));
    }

    #[test]
    fn test_settings_rejects_unknown_keys() {
        assert!(Settings::from_toml("retry = true").is_err());
    }

    #[test]
    fn test_settings_load_missing_file() {
        let err = Settings::load(Some(Path::new("/nonexistent/roadvault.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(Settings::load(None).unwrap(), Settings::default());
    }
}
