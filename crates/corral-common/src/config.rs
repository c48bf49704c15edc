//! Host-level configuration model for the driver.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CorralError, Result};

/// Root configuration for the driver.
///
/// Every field has a default so a partial JSON document is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Base directory for container state and data.
    pub data_dir: PathBuf,
    /// Base directory for per-container logs.
    pub log_dir: PathBuf,
    /// Watchdog window of a lifecycle operation, in milliseconds.
    pub operation_timeout_ms: u64,
    /// Upper bound on a runtime state probe, in milliseconds.
    pub state_probe_timeout_ms: u64,
    /// Upper bound on the freeze attempted before a forced stop, in milliseconds.
    pub freeze_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL for helper processes, in milliseconds.
    pub helper_kill_timeout_ms: u64,
    /// The host can mount filesystems with a remapped view, so no shifting is needed.
    pub shiftfs: bool,
    /// The pids cgroup controller is available.
    pub cgroup_pids: bool,
    /// The freezer cgroup controller is available.
    pub cgroup_freezer: bool,
    /// Swap accounting is available.
    pub cgroup_swap: bool,
    /// Root of the sysfs tree used for device inventory.
    pub sysfs_root: PathBuf,
    /// Helper binary spawned for proxy devices.
    pub proxy_helper: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            log_dir: PathBuf::from(constants::DEFAULT_LOG_DIR),
            operation_timeout_ms: constants::DEFAULT_OPERATION_TIMEOUT_MS,
            state_probe_timeout_ms: constants::DEFAULT_STATE_PROBE_TIMEOUT_MS,
            freeze_timeout_ms: constants::DEFAULT_FREEZE_TIMEOUT_MS,
            helper_kill_timeout_ms: constants::DEFAULT_HELPER_KILL_TIMEOUT_MS,
            shiftfs: false,
            cgroup_pids: true,
            cgroup_freezer: true,
            cgroup_swap: true,
            sysfs_root: PathBuf::from(constants::DEFAULT_SYSFS_ROOT),
            proxy_helper: constants::DEFAULT_PROXY_HELPER.to_string(),
        }
    }
}

impl DriverConfig {
    /// Loads the configuration from a JSON file, then applies environment overrides.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| CorralError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            serde_json::from_str(&content)?
        } else {
            tracing::debug!(path = %path.display(), "no driver config file, using defaults");
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Applies `CORRAL_DATA_DIR` and `CORRAL_LOG_DIR` when set.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(constants::ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(constants::ENV_LOG_DIR) {
            self.log_dir = PathBuf::from(dir);
        }
    }

    /// Returns a configuration rooted in `dir`, for tests and sandboxes.
    #[must_use]
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            data_dir: dir.join("data"),
            log_dir: dir.join("logs"),
            sysfs_root: dir.join("sys"),
            ..Self::default()
        }
    }

    /// Watchdog window of a lifecycle operation.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Upper bound on a runtime state probe.
    #[must_use]
    pub const fn state_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.state_probe_timeout_ms)
    }

    /// Upper bound on the freeze attempted before a forced stop.
    #[must_use]
    pub const fn freeze_timeout(&self) -> Duration {
        Duration::from_millis(self.freeze_timeout_ms)
    }

    /// Grace period between SIGTERM and SIGKILL for helper processes.
    #[must_use]
    pub const fn helper_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_kill_timeout_ms)
    }

    /// Path of the store document.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(constants::STORE_FILE_NAME)
    }

    /// Directory holding per-container state (devices, checkpoints).
    #[must_use]
    pub fn containers_dir(&self) -> PathBuf {
        self.data_dir.join("containers")
    }

    /// Directory holding container backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = DriverConfig::default();
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
        assert_eq!(config.state_probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/corral"));
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"operation_timeout_ms": 250, "shiftfs": true}"#)
            .expect("write config");

        let config = DriverConfig::load(&path).expect("load");
        assert_eq!(config.operation_timeout(), Duration::from_millis(250));
        assert!(config.shiftfs);
        assert_eq!(config.state_probe_timeout_ms, 5_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DriverConfig::load(&dir.path().join("absent.json")).expect("load");
        assert_eq!(config.operation_timeout_ms, 30_000);
    }

    #[test]
    fn bad_document_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(DriverConfig::load(&path).is_err());
    }
}
