//! # corral-common
//!
//! Shared types, error definitions, the device model, configuration and
//! key constants used across the entire Corral workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate and provides the primitives the host, runtime and CLI
//! crates build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod types;
