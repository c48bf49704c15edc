//! # corral-core
//!
//! Host-side primitives used by the Corral container driver.
//!
//! This crate knows nothing about containers as aggregates. It provides:
//! - **Id maps**: uid/gid mapping sets, raw map parsing, host sub-id discovery
//!   and filesystem shifting.
//! - **Cgroups**: translation of container limits into cgroup v2 items.
//! - **Filesystem**: bind mounts and detach unmounts.
//! - **Devices**: device node inspection and creation, sysfs inventory of
//!   USB and GPU devices.
//! - **Network**: host-side interface plumbing through `ip`, `tc` and `ebtables`.
//! - **Helpers**: command execution, namespace entry, kernel modules and
//!   process signalling.
//!
//! Every privileged call is wrapped in a safe function returning
//! [`corral_common::error::Result`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cgroup;
pub mod command;
pub mod devnode;
pub mod filesystem;
pub mod idmap;
pub mod inventory;
pub mod kmod;
pub mod network;
pub mod process;
pub mod units;
