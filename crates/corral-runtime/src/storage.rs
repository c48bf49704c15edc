//! Storage collaborator.
//!
//! Volumes holding container root filesystems are owned by a storage
//! driver. The lifecycle code only asks it to mount, unmount, snapshot,
//! restore, rename and delete volumes, and to shift ownership of a root
//! filesystem when the container's idmap changes.

use std::path::{Path, PathBuf};

use corral_common::constants::SNAPSHOT_DELIMITER;
use corral_common::error::{CorralError, Result};
use corral_core::command::run;
use corral_core::idmap::IdmapSet;
use corral_core::idmap::shift::{shift_rootfs, unshift_rootfs};

/// Storage pool operations on container volumes.
pub trait StorageDriver: Send + Sync {
    /// Name of the pool root disks live on.
    fn pool(&self) -> &str;

    /// Mount point of the container's root filesystem.
    fn rootfs_path(&self, container: &str) -> PathBuf;

    /// Creates an empty volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be created.
    fn create(&self, container: &str) -> Result<()>;

    /// Mounts the volume. Returns whether this call mounted it.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be mounted.
    fn mount(&self, container: &str) -> Result<bool>;

    /// Unmounts the volume. Returns whether this call unmounted it.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be unmounted.
    fn unmount(&self, container: &str) -> Result<bool>;

    /// Applies a size quota to the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool does not support quotas.
    fn set_quota(&self, container: &str, size: &str) -> Result<()>;

    /// Whether quotas can change while the volume is mounted.
    fn supports_online_resize(&self) -> bool {
        false
    }

    /// Creates a snapshot volume of `container`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be taken.
    fn snapshot(&self, container: &str, snapshot: &str) -> Result<()>;

    /// Checks that `container` can be restored from `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns an error naming why the restore is impossible.
    fn can_restore(&self, container: &str, snapshot: &str) -> Result<()>;

    /// Replaces the volume contents with the snapshot's.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents cannot be swapped.
    fn restore(&self, container: &str, snapshot: &str) -> Result<()>;

    /// Renames the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be renamed.
    fn rename(&self, container: &str, new_name: &str) -> Result<()>;

    /// Deletes the volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be removed.
    fn delete(&self, container: &str) -> Result<()>;

    /// Rewrites root filesystem ownership from namespace to host ids.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be re-owned.
    fn shift_rootfs(&self, container: &str, set: &IdmapSet) -> Result<()> {
        let _ = shift_rootfs(&self.rootfs_path(container), set)?;
        Ok(())
    }

    /// Rewrites root filesystem ownership from host back to namespace ids.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry cannot be re-owned.
    fn unshift_rootfs(&self, container: &str, set: &IdmapSet) -> Result<()> {
        let _ = unshift_rootfs(&self.rootfs_path(container), set)?;
        Ok(())
    }
}

/// Volumes as plain directories: `<root>/containers/<name>` and
/// `<root>/snapshots/<parent>/<snapshot>`.
#[derive(Debug, Clone)]
pub struct DirStorage {
    pool: String,
    root: PathBuf,
}

fn io_err(path: &Path, source: std::io::Error) -> CorralError {
    CorralError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl DirStorage {
    /// Creates a driver storing volumes under `root`.
    #[must_use]
    pub fn new(pool: &str, root: &Path) -> Self {
        Self {
            pool: pool.to_string(),
            root: root.to_path_buf(),
        }
    }

    fn volume_path(&self, container: &str) -> PathBuf {
        match container.split_once(SNAPSHOT_DELIMITER) {
            Some((parent, snap)) => self.root.join("snapshots").join(parent).join(snap),
            None => self.root.join("containers").join(container),
        }
    }

    fn copy_tree(source: &Path, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let source = format!("{}/.", source.display());
        let target_str = target.to_string_lossy();
        std::fs::create_dir_all(target).map_err(|e| io_err(target, e))?;
        let _ = run("cp", &["-a", &source, &target_str])?;
        Ok(())
    }
}

impl StorageDriver for DirStorage {
    fn pool(&self) -> &str {
        &self.pool
    }

    fn rootfs_path(&self, container: &str) -> PathBuf {
        self.volume_path(container).join("rootfs")
    }

    fn create(&self, container: &str) -> Result<()> {
        let rootfs = self.rootfs_path(container);
        std::fs::create_dir_all(&rootfs).map_err(|e| io_err(&rootfs, e))?;
        tracing::debug!(container, path = %rootfs.display(), "volume created");
        Ok(())
    }

    fn mount(&self, _container: &str) -> Result<bool> {
        Ok(false)
    }

    fn unmount(&self, _container: &str) -> Result<bool> {
        Ok(false)
    }

    fn set_quota(&self, _container: &str, size: &str) -> Result<()> {
        Err(CorralError::external(
            "failed to set quota",
            format!("the {} pool cannot enforce a size of {size}", self.pool),
        ))
    }

    fn snapshot(&self, container: &str, snapshot: &str) -> Result<()> {
        let target = self.volume_path(&format!("{container}{SNAPSHOT_DELIMITER}{snapshot}"));
        Self::copy_tree(&self.volume_path(container), &target)
    }

    fn can_restore(&self, _container: &str, snapshot: &str) -> Result<()> {
        let path = self.volume_path(snapshot);
        if !path.exists() {
            return Err(CorralError::NotFound {
                kind: "snapshot volume",
                id: snapshot.to_string(),
            });
        }
        Ok(())
    }

    fn restore(&self, container: &str, snapshot: &str) -> Result<()> {
        let target = self.rootfs_path(container);
        if target.exists() {
            std::fs::remove_dir_all(&target).map_err(|e| io_err(&target, e))?;
        }
        Self::copy_tree(&self.rootfs_path(snapshot), &target)
    }

    fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        let from = self.volume_path(container);
        let to = self.volume_path(new_name);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        if from.exists() {
            std::fs::rename(&from, &to).map_err(|e| io_err(&from, e))?;
        }
        Ok(())
    }

    fn delete(&self, container: &str) -> Result<()> {
        let path = self.volume_path(container);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_restore_copy_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DirStorage::new("default", dir.path());
        storage.create("web").expect("create");
        let rootfs = storage.rootfs_path("web");
        std::fs::write(rootfs.join("version"), "1").expect("write");

        storage.snapshot("web", "snap0").expect("snapshot");
        assert_eq!(
            std::fs::read_to_string(storage.rootfs_path("web/snap0").join("version")).expect("read"),
            "1"
        );

        std::fs::write(rootfs.join("version"), "2").expect("write");
        storage.can_restore("web", "web/snap0").expect("can restore");
        storage.restore("web", "web/snap0").expect("restore");
        assert_eq!(std::fs::read_to_string(rootfs.join("version")).expect("read"), "1");
    }

    #[test]
    fn rename_and_delete_move_the_volume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DirStorage::new("default", dir.path());
        storage.create("a").expect("create");
        storage.rename("a", "b").expect("rename");
        assert!(storage.rootfs_path("b").exists());
        assert!(!storage.rootfs_path("a").exists());
        storage.delete("b").expect("delete");
        assert!(!dir.path().join("containers/b").exists());
    }

    #[test]
    fn missing_snapshots_cannot_be_restored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = DirStorage::new("default", dir.path());
        assert!(storage.can_restore("a", "a/none").is_err());
        assert!(storage.set_quota("a", "10GB").is_err());
    }
}
