//! Kernel module loading.

use std::path::Path;

use corral_common::error::{CorralError, Result};

use crate::command::run;

/// Whether `name` is already loaded according to `<sysfs>/module`.
#[must_use]
pub fn is_loaded(sysfs_root: &Path, name: &str) -> bool {
    sysfs_root.join("module").join(name.replace('-', "_")).exists()
}

/// Loads a kernel module unless it is already present.
///
/// # Errors
///
/// Returns an error if `modprobe` is not installed or fails.
pub fn load_module(sysfs_root: &Path, name: &str) -> Result<()> {
    if is_loaded(sysfs_root, name) {
        return Ok(());
    }
    let modprobe = which::which("modprobe")
        .map_err(|e| CorralError::external("modprobe not found", e))?;
    let _ = run(&modprobe.to_string_lossy(), &["-b", name])?;
    tracing::info!(module = name, "kernel module loaded");
    Ok(())
}

/// Loads every module of a comma separated list.
///
/// # Errors
///
/// Returns an error naming the first module that failed to load.
pub fn load_modules(sysfs_root: &Path, list: &str) -> Result<()> {
    for module in list.split(',').map(str::trim).filter(|m| !m.is_empty()) {
        load_module(sysfs_root, module).map_err(|e| {
            CorralError::external(format!("failed to load kernel module {module}"), e)
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_modules_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("module/br_netfilter")).expect("mkdir");
        assert!(is_loaded(dir.path(), "br-netfilter"));
        load_modules(dir.path(), " br_netfilter , ").expect("already loaded");
    }
}
