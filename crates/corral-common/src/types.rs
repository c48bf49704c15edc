//! Domain primitive types used across the Corral workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CorralError, Result};

/// Flat string key/value configuration, as stored per container and per profile.
pub type ConfigMap = BTreeMap<String, String>;

/// Unique numeric identifier of a container record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(u64);

impl ContainerId {
    /// Creates a container ID from its numeric value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status reported for a container, as probed from the runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// No process is running.
    Stopped = 1,
    /// The runtime library is bringing the container up.
    Starting = 2,
    /// The init process is running.
    Running = 3,
    /// The runtime library is bringing the container down.
    Stopping = 4,
    /// A start is being aborted.
    Aborting = 5,
    /// The freezer is being engaged.
    Freezing = 6,
    /// All tasks are frozen.
    Frozen = 7,
    /// Tasks were thawed.
    Thawed = 8,
    /// The runtime library reported an error.
    Error = 9,
}

impl StatusCode {
    /// Returns the numeric code exposed to API clients.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether a container in this state has live processes.
    #[must_use]
    pub const fn is_running(self) -> bool {
        !matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether the container is frozen.
    #[must_use]
    pub const fn is_frozen(self) -> bool {
        matches!(self, Self::Frozen)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Aborting => "Aborting",
            Self::Freezing => "Freezing",
            Self::Frozen => "Frozen",
            Self::Thawed => "Thawed",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

impl FromStr for StatusCode {
    type Err = CorralError;

    /// Parses the upper-case state names printed by the runtime library.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => Ok(Self::Stopped),
            "STARTING" => Ok(Self::Starting),
            "RUNNING" => Ok(Self::Running),
            "STOPPING" => Ok(Self::Stopping),
            "ABORTING" => Ok(Self::Aborting),
            "FREEZING" => Ok(Self::Freezing),
            "FROZEN" => Ok(Self::Frozen),
            "THAWED" => Ok(Self::Thawed),
            "ERROR" => Ok(Self::Error),
            other => Err(CorralError::external("runtime state", format!("unknown state {other:?}"))),
        }
    }
}

/// Power state recorded in the store, independent of the live probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    /// Last recorded as stopped.
    #[default]
    Stopped,
    /// Last recorded as running.
    Running,
}

/// Lifecycle action tracked by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationAction {
    /// Start (or stateful restore) of the container.
    Start,
    /// Stop or shutdown of the container.
    Stop,
}

impl OperationAction {
    /// Lower-case name used in messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target passed by the runtime library to the stop hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTarget {
    /// The container is going down for good.
    Stop,
    /// The container is rebooting and must be started again.
    Reboot,
}

impl FromStr for StopTarget {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stop" => Ok(Self::Stop),
            "reboot" => Ok(Self::Reboot),
            other => Err(CorralError::validation(format!("invalid stop target: {other}"))),
        }
    }
}

impl fmt::Display for StopTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Reboot => f.write_str("reboot"),
        }
    }
}

/// Interprets the usual boolean spellings of configuration values.
#[must_use]
pub fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Looks up `key` in `config` and interprets it with [`is_true`].
#[must_use]
pub fn config_is_true(config: &ConfigMap, key: &str) -> bool {
    config.get(key).is_some_and(|v| is_true(v))
}

/// Checks that `name` is usable as a container name (a valid hostname label).
#[must_use]
pub fn valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    if name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}
