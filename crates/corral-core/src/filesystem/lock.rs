//! Advisory whole-file locks shared by every driver process on the host.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use corral_common::error::{CorralError, Result};
use nix::fcntl::{Flock, FlockArg};

/// A `flock(2)` lock, released when dropped.
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl FileLock {
    /// Blocks until `path` is locked exclusively. The file is created when
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Io`] if the file cannot be opened or locked.
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockExclusive)
    }

    /// Blocks until `path` is locked shared.
    ///
    /// # Errors
    ///
    /// Returns [`CorralError::Io`] if the file cannot be opened or locked.
    pub fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockShared)
    }

    fn acquire(path: &Path, arg: FlockArg) -> Result<Self> {
        let io_err = |source| CorralError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let lock = Flock::lock(file, arg).map_err(|(_, errno)| io_err(std::io::Error::from(errno)))?;
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish_non_exhaustive()
    }
}
