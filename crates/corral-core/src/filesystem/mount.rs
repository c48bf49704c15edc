//! Bind mounts for disk and unix devices.
//!
//! Mount points live in the container's private devices directory on the
//! host and are then exposed inside the container by the runtime library.

use std::path::Path;
use std::str::FromStr;

use corral_common::error::{CorralError, Result};

/// Mount propagation mode requested by a disk device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// `private`
    Private,
    /// `shared`
    Shared,
    /// `slave`
    Slave,
    /// `unbindable`
    Unbindable,
    /// `rprivate`
    RPrivate,
    /// `rshared`
    RShared,
    /// `rslave`
    RSlave,
    /// `runbindable`
    RUnbindable,
}

impl FromStr for Propagation {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "shared" => Ok(Self::Shared),
            "slave" => Ok(Self::Slave),
            "unbindable" => Ok(Self::Unbindable),
            "rprivate" => Ok(Self::RPrivate),
            "rshared" => Ok(Self::RShared),
            "rslave" => Ok(Self::RSlave),
            "runbindable" => Ok(Self::RUnbindable),
            other => Err(CorralError::validation(format!(
                "invalid propagation mode: {other:?}"
            ))),
        }
    }
}

/// Options of a bind mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    /// Remount read-only after binding.
    pub readonly: bool,
    /// Use `MS_REC` so submounts follow.
    pub recursive: bool,
    /// Propagation applied after binding.
    pub propagation: Option<Propagation>,
}

/// Creates the file or directory a mount will cover, with its parents.
///
/// # Errors
///
/// Returns an error if the target cannot be created.
pub fn ensure_mount_target(target: &Path, directory: bool) -> Result<()> {
    let io = |path: &Path, e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    };
    if directory {
        return std::fs::create_dir_all(target).map_err(|e| io(target, e));
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io(parent, e))?;
    }
    if !target.exists() {
        let _ = std::fs::File::create(target).map_err(|e| io(target, e))?;
    }
    Ok(())
}

/// Creates a bind mount from `source` onto `target`.
///
/// # Errors
///
/// Returns an error if any `mount(2)` call fails.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path, options: BindOptions) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let map = |what: &str, e: nix::Error| CorralError::PermissionDenied {
        message: format!(
            "{what} {} -> {} failed: {e}",
            source.display(),
            target.display()
        ),
    };

    let mut flags = MsFlags::MS_BIND;
    if options.recursive {
        flags |= MsFlags::MS_REC;
    }
    mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| map("bind mount", e))?;

    if options.readonly {
        let remount = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
        mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
            .map_err(|e| map("read-only remount", e))?;
    }

    if let Some(propagation) = options.propagation {
        let flag = match propagation {
            Propagation::Private => MsFlags::MS_PRIVATE,
            Propagation::Shared => MsFlags::MS_SHARED,
            Propagation::Slave => MsFlags::MS_SLAVE,
            Propagation::Unbindable => MsFlags::MS_UNBINDABLE,
            Propagation::RPrivate => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            Propagation::RShared => MsFlags::MS_SHARED | MsFlags::MS_REC,
            Propagation::RSlave => MsFlags::MS_SLAVE | MsFlags::MS_REC,
            Propagation::RUnbindable => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        };
        mount(None::<&str>, target, None::<&str>, flag, None::<&str>)
            .map_err(|e| map("propagation change", e))?;
    }

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        readonly = options.readonly,
        recursive = options.recursive,
        "bind mount created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path, _options: BindOptions) -> Result<()> {
    Err(CorralError::PermissionDenied {
        message: "Linux required for mounts".into(),
    })
}

/// Lazily detaches whatever is mounted on `target`. Not-mounted targets are ignored.
///
/// # Errors
///
/// Returns an error if `umount2(2)` fails for another reason.
#[cfg(target_os = "linux")]
pub fn unmount_detach(target: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};

    match umount2(target, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::Error::EINVAL | nix::Error::ENOENT) => Ok(()),
        Err(e) => Err(CorralError::PermissionDenied {
            message: format!("unmount {} failed: {e}", target.display()),
        }),
    }
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: mounts require Linux.
#[cfg(not(target_os = "linux"))]
pub fn unmount_detach(_target: &Path) -> Result<()> {
    Err(CorralError::PermissionDenied {
        message: "Linux required for mounts".into(),
    })
}
