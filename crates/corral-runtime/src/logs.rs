//! Per-container log directory: the generated runtime configuration and
//! the runtime library's log file.

use std::path::{Path, PathBuf};

use corral_common::constants::{RUNTIME_CONFIG_FILE, RUNTIME_LOG_FILE};
use corral_common::error::{CorralError, Result};

/// Log directory of a container.
#[must_use]
pub fn log_dir(log_root: &Path, container: &str) -> PathBuf {
    log_root.join(container)
}

/// Path of the generated runtime configuration file.
#[must_use]
pub fn config_path(log_root: &Path, container: &str) -> PathBuf {
    log_dir(log_root, container).join(RUNTIME_CONFIG_FILE)
}

/// Path of the runtime library log file.
#[must_use]
pub fn log_file_path(log_root: &Path, container: &str) -> PathBuf {
    log_dir(log_root, container).join(RUNTIME_LOG_FILE)
}

/// Moves `path` to `<path>.old`, replacing an earlier rotation.
///
/// A missing log is not an error.
///
/// # Errors
///
/// Returns an error if the rename fails.
pub fn rotate(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut old = path.as_os_str().to_owned();
    old.push(".old");
    let old = PathBuf::from(old);
    let _ = std::fs::remove_file(&old);
    std::fs::rename(path, &old).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// `ERROR` lines of a runtime library log, one per line with a two-space
/// indent, preceded by a line break. Empty when there are none.
#[must_use]
pub fn error_lines(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let mut out = String::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "ERROR" {
            continue;
        }
        if out.is_empty() {
            out.push('\n');
        }
        out.push_str("  ");
        out.push_str(&fields.join(" "));
        out.push('\n');
    }
    out
}

/// Reads a log file, empty when it does not exist yet.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_log(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    std::fs::read_to_string(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Moves a container's log directory on rename.
///
/// # Errors
///
/// Returns an error if the directory exists and cannot be moved.
pub fn rename_dir(log_root: &Path, old: &str, new: &str) -> Result<()> {
    let from = log_dir(log_root, old);
    if !from.exists() {
        return Ok(());
    }
    let to = log_dir(log_root, new);
    let _ = std::fs::remove_dir_all(&to);
    std::fs::rename(&from, &to).map_err(|e| CorralError::Io { path: from, source: e })
}
