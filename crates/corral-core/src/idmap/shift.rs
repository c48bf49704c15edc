//! Filesystem ownership shifting.
//!
//! Shifting rewrites the owner of every entry under a root filesystem from
//! namespace ids to host ids (or back), so an unprivileged container sees
//! its files as owned by its own root. Symlinks are re-owned but never
//! followed, and permission bits are re-applied because `chown(2)` clears
//! set-id bits.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use corral_common::error::{CorralError, Result};

use super::IdmapSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Shift,
    Unshift,
}

fn io_err(path: &Path, source: std::io::Error) -> CorralError {
    CorralError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn walk(root: &Path, mut visit: impl FnMut(&Path, &Metadata) -> Result<()>) -> Result<()> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let meta = std::fs::symlink_metadata(&path).map_err(|e| io_err(&path, e))?;
        visit(&path, &meta)?;
        if meta.file_type().is_dir() {
            for entry in std::fs::read_dir(&path).map_err(|e| io_err(&path, e))? {
                let entry = entry.map_err(|e| io_err(&path, e))?;
                stack.push(entry.path());
            }
        }
    }
    Ok(())
}

fn to_raw_id(id: i64, path: &Path) -> Result<u32> {
    u32::try_from(id).map_err(|_| CorralError::InvalidIdmap {
        message: format!("id {id} out of range for {}", path.display()),
    })
}

fn shift_tree(root: &Path, set: &IdmapSet, direction: Direction) -> Result<u64> {
    let mut changed = 0_u64;
    walk(root, |path, meta| {
        let uid = i64::from(meta.uid());
        let gid = i64::from(meta.gid());
        let mapped = match direction {
            Direction::Shift => set.ns_to_host(uid, gid),
            Direction::Unshift => set.host_to_ns(uid, gid),
        };
        let Some((new_uid, new_gid)) = mapped else {
            return Ok(());
        };

        std::os::unix::fs::lchown(
            path,
            Some(to_raw_id(new_uid, path)?),
            Some(to_raw_id(new_gid, path)?),
        )
        .map_err(|e| io_err(path, e))?;
        if !meta.file_type().is_symlink() {
            std::fs::set_permissions(path, meta.permissions()).map_err(|e| io_err(path, e))?;
        }
        changed += 1;
        Ok(())
    })?;
    tracing::debug!(
        root = %root.display(),
        direction = ?direction,
        changed,
        "shifted filesystem ownership"
    );
    Ok(changed)
}

/// Rewrites ownership under `root` from namespace ids to host ids.
///
/// Entries owned by ids outside the map are left untouched. Returns the
/// number of entries re-owned.
///
/// # Errors
///
/// Returns an error on the first entry that cannot be read or re-owned;
/// entries already processed keep their new owner.
pub fn shift_rootfs(root: &Path, set: &IdmapSet) -> Result<u64> {
    shift_tree(root, set, Direction::Shift)
}

/// Rewrites ownership under `root` from host ids back to namespace ids.
///
/// # Errors
///
/// Returns an error on the first entry that cannot be read or re-owned.
pub fn unshift_rootfs(root: &Path, set: &IdmapSet) -> Result<u64> {
    shift_tree(root, set, Direction::Unshift)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::idmap::IdmapEntry;

    fn identity_for(path: &Path) -> IdmapSet {
        let meta = std::fs::metadata(path).expect("metadata");
        let uid = i64::from(meta.uid());
        let gid = i64::from(meta.gid());
        IdmapSet::new(vec![IdmapEntry::uid(uid, uid, 1), IdmapEntry::gid(gid, gid, 1)])
    }

    #[test]
    fn shifts_every_entry_without_following_symlinks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        std::fs::write(outside.path().join("secret"), "x").expect("write outside");

        let root = dir.path().join("rootfs");
        std::fs::create_dir_all(root.join("etc")).expect("mkdir");
        std::fs::write(root.join("etc/hostname"), "c1").expect("write");
        std::os::unix::fs::symlink(outside.path(), root.join("link")).expect("symlink");

        let set = identity_for(&root);
        let changed = shift_rootfs(&root, &set).expect("shift");
        // rootfs, etc, etc/hostname, link
        assert_eq!(changed, 4);
    }

    #[test]
    fn preserves_permission_bits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("tool");
        std::fs::write(&file, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o750)).expect("chmod");

        let set = identity_for(dir.path());
        let _ = unshift_rootfs(dir.path(), &set).expect("unshift");
        let mode = std::fs::metadata(&file).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);
    }

    #[test]
    fn unmapped_owners_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("f"), "x").expect("write");
        let set = IdmapSet::new(vec![
            IdmapEntry::uid(5000, 3_000_000_000, 1),
            IdmapEntry::gid(5000, 3_000_000_000, 1),
        ]);
        assert_eq!(shift_rootfs(dir.path(), &set).expect("shift"), 0);
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = shift_rootfs(&dir.path().join("absent"), &IdmapSet::default()).unwrap_err();
        assert!(matches!(err, CorralError::Io { .. }));
    }
}
