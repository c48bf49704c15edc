//! Cgroup v2 values derived from container limits.
//!
//! The driver never writes the cgroup tree directly: it computes
//! [`CgroupItem`]s and hands them to the runtime library, which applies
//! them at boot (as configuration) or live (on the running container).

pub mod cpu;
pub mod io;
pub mod memory;
pub mod pids;

use std::fmt;

use crate::devnode::NodeType;

/// Controller file of the device access list (allow).
pub const DEVICES_ALLOW: &str = "devices.allow";
/// Controller file of the device access list (deny).
pub const DEVICES_DENY: &str = "devices.deny";

/// A single cgroup controller setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupItem {
    /// Controller file, e.g. `memory.max`.
    pub key: &'static str,
    /// Value written to the file.
    pub value: String,
}

impl CgroupItem {
    /// Creates an item.
    #[must_use]
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for CgroupItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Device access rule granting read, write and mknod on one node.
#[must_use]
pub fn device_rule(node: NodeType, major: u32, minor: u32) -> String {
    format!("{} {major}:{minor} rwm", node.rule_char())
}
