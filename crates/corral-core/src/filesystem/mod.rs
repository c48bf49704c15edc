//! Filesystem helpers: bind mounts, mount targets and advisory file locks.

pub mod lock;
pub mod mount;
