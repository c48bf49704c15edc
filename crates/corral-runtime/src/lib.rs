//! # corral-runtime
//!
//! Lifecycle driver for system containers on one host.
//!
//! - **Operations**: a per-container lock with a watchdog, so at most one
//!   start or stop is in flight.
//! - **Idmap allocation**: disjoint host id ranges for isolated containers.
//! - **Configuration**: profile expansion and key validation.
//! - **Devices**: diffing device maps and attaching, detaching and updating
//!   devices at boot or on the running container.
//! - **Lifecycle**: create, start, stop, shutdown, freeze, update, snapshot,
//!   restore, delete and rename, plus the hooks the runtime library calls.
//!
//! The runtime library, storage, persistence, events, security profiles and
//! host network are collaborators behind traits, wired in [`engine`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod device;
pub mod engine;
pub mod events;
pub mod expand;
pub mod idmap;
pub mod logs;
pub mod network;
pub mod operation;
pub mod security;
pub mod storage;
pub mod store;
pub mod validate;
