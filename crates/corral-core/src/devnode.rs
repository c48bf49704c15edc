//! Character and block device nodes.

use std::path::Path;

use corral_common::error::{CorralError, Result};

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    /// Character device.
    Char,
    /// Block device.
    Block,
}

impl NodeType {
    /// Letter used by device access rules.
    #[must_use]
    pub const fn rule_char(self) -> char {
        match self {
            Self::Char => 'c',
            Self::Block => 'b',
        }
    }
}

/// A device node's identity and permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode {
    /// Character or block.
    pub node_type: NodeType,
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
    /// Permission bits.
    pub mode: u32,
}

/// Parses an octal permission string such as `0660`.
///
/// # Errors
///
/// Returns a validation error for non-octal input.
pub fn parse_mode(value: &str) -> Result<u32> {
    u32::from_str_radix(value.trim_start_matches("0o"), 8)
        .map_err(|_| CorralError::validation(format!("invalid device mode: {value:?}")))
}

/// Reads the node type, numbers and mode of an existing device node.
///
/// # Errors
///
/// Returns an error if the path cannot be inspected or is not a device node.
#[cfg(target_os = "linux")]
pub fn inspect(path: &Path) -> Result<DeviceNode> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let meta = std::fs::metadata(path).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let file_type = meta.file_type();
    let node_type = if file_type.is_char_device() {
        NodeType::Char
    } else if file_type.is_block_device() {
        NodeType::Block
    } else {
        return Err(CorralError::validation(format!(
            "{} is not a device node",
            path.display()
        )));
    };
    let rdev = meta.rdev();
    let major = u32::try_from(nix::sys::stat::major(rdev)).unwrap_or(u32::MAX);
    let minor = u32::try_from(nix::sys::stat::minor(rdev)).unwrap_or(u32::MAX);
    Ok(DeviceNode {
        node_type,
        major,
        minor,
        mode: meta.mode() & 0o7777,
    })
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: device nodes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn inspect(_path: &Path) -> Result<DeviceNode> {
    Err(CorralError::PermissionDenied {
        message: "Linux required for device nodes".into(),
    })
}

/// Creates a device node at `path` owned by `uid`/`gid`.
///
/// An existing file at `path` is replaced.
///
/// # Errors
///
/// Returns an error if `mknod(2)` or `chown(2)` fails.
#[cfg(target_os = "linux")]
pub fn create(path: &Path, node: &DeviceNode, uid: u32, gid: u32) -> Result<()> {
    use nix::sys::stat::{Mode, SFlag, makedev, mknod};

    if path.exists() {
        std::fs::remove_file(path).map_err(|e| CorralError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    let kind = match node.node_type {
        NodeType::Char => SFlag::S_IFCHR,
        NodeType::Block => SFlag::S_IFBLK,
    };
    let dev = makedev(u64::from(node.major), u64::from(node.minor));
    mknod(path, kind, Mode::from_bits_truncate(node.mode), dev).map_err(|e| {
        CorralError::PermissionDenied {
            message: format!("mknod {} failed: {e}", path.display()),
        }
    })?;
    std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|e| CorralError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tracing::debug!(
        path = %path.display(),
        major = node.major,
        minor = node.minor,
        "device node created"
    );
    Ok(())
}

/// Stub for non-Linux platforms.
///
/// # Errors
///
/// Always returns an error: device nodes require Linux.
#[cfg(not(target_os = "linux"))]
pub fn create(_path: &Path, _node: &DeviceNode, _uid: u32, _gid: u32) -> Result<()> {
    Err(CorralError::PermissionDenied {
        message: "Linux required for device nodes".into(),
    })
}
