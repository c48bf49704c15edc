//! Unified error type for the Corral workspace.
//!
//! The variants follow the driver's error taxonomy: validation failures are
//! rejected before any mutation, resource exhaustion and external tool
//! failures are surfaced with context, and concurrency conflicts are
//! reported immediately without retry.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum CorralError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration key, device or profile failed validation.
    #[error("invalid configuration: {message}")]
    Validation {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Another lifecycle operation holds the container.
    #[error("container is busy running a {action} operation")]
    Busy {
        /// Action of the operation currently in flight.
        action: String,
    },

    /// The live operation is not the one the caller expected.
    #[error("container is running a {running} operation, not a {wanted} operation")]
    OperationMismatch {
        /// Action of the live operation.
        running: String,
        /// Action the caller asked for.
        wanted: String,
    },

    /// No operation is in flight for the container.
    #[error("no running {action} container operation")]
    NoOperation {
        /// Action the caller asked for, possibly empty.
        action: String,
    },

    /// The operation watchdog fired before anyone finished the operation.
    #[error("container {action} operation timed out after {} seconds", .timeout.as_secs())]
    OperationTimeout {
        /// Action of the stuck operation.
        action: String,
        /// Watchdog window that elapsed.
        timeout: Duration,
    },

    /// An operation was finished with a failure by another actor.
    #[error("container {action} operation failed: {message}")]
    OperationFailed {
        /// Action of the failed operation.
        action: String,
        /// Failure reported by the finisher.
        message: String,
    },

    /// No free host id range is left for an isolated container.
    #[error("not enough uid/gid available for the container")]
    IdmapExhausted,

    /// A raw id mapping targets a host id reserved as a sub-id.
    #[error("host id is in the range of subids")]
    HostIdIsSubId,

    /// An id map could not be parsed or combined.
    #[error("invalid idmap: {message}")]
    InvalidIdmap {
        /// Description of the problem.
        message: String,
    },

    /// An external collaborator or helper process failed.
    #[error("{context}: {message}")]
    External {
        /// What was being attempted.
        context: String,
        /// Failure reported by the collaborator.
        message: String,
    },

    /// A lifecycle entry point failed.
    #[error("failed to {action} container {container}: {source}")]
    Lifecycle {
        /// Lifecycle action that failed.
        action: &'static str,
        /// Name of the container.
        container: String,
        /// Underlying failure.
        source: Box<CorralError>,
    },

    /// A rollback failed after the original failure.
    #[error("{original} (rollback also failed: {rollback})")]
    Rollback {
        /// Failure that triggered the rollback.
        original: Box<CorralError>,
        /// Failure of the rollback itself.
        rollback: Box<CorralError>,
    },

    /// The runtime library did not answer a state probe in time.
    #[error("monitor is hung")]
    MonitorHung,

    /// The container is not in a state that allows the request.
    #[error("{message}")]
    InvalidState {
        /// Description of the conflicting state.
        message: String,
    },

    /// A protection flag forbids the request.
    #[error("{message}")]
    Protected {
        /// Description of the protection.
        message: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl CorralError {
    /// Builds a [`CorralError::Validation`] from a message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Builds a [`CorralError::External`] from a context and a message.
    #[must_use]
    pub fn external(context: impl Into<String>, message: impl ToString) -> Self {
        Self::External {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Builds a [`CorralError::InvalidState`] from a message.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Wraps `self` so the error names the action and the container.
    ///
    /// Errors that are already wrapped are returned unchanged.
    #[must_use]
    pub fn in_lifecycle(self, action: &'static str, container: &str) -> Self {
        match self {
            Self::Lifecycle { .. } => self,
            other => Self::Lifecycle {
                action,
                container: container.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Combines a failure with the failure of its rollback.
    ///
    /// When the rollback succeeded (`None`) the original error is returned.
    #[must_use]
    pub fn with_rollback(self, rollback: Option<Self>) -> Self {
        match rollback {
            Some(rollback) => Self::Rollback {
                original: Box::new(self),
                rollback: Box::new(rollback),
            },
            None => self,
        }
    }

    /// Returns the innermost error, looking through lifecycle wrapping.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Lifecycle { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, CorralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_message_names_the_action() {
        let err = CorralError::Busy {
            action: "start".into(),
        };
        assert_eq!(err.to_string(), "container is busy running a start operation");
    }

    #[test]
    fn lifecycle_wrapping_names_action_and_container() {
        let err = CorralError::IdmapExhausted.in_lifecycle("start", "c1");
        assert_eq!(
            err.to_string(),
            "failed to start container c1: not enough uid/gid available for the container"
        );
        assert!(matches!(err.root(), CorralError::IdmapExhausted));
    }

    #[test]
    fn lifecycle_wrapping_is_not_nested() {
        let err = CorralError::MonitorHung
            .in_lifecycle("stop", "c1")
            .in_lifecycle("restore", "c1");
        assert!(err.to_string().starts_with("failed to stop container c1"));
    }

    #[test]
    fn rollback_keeps_both_errors_visible() {
        let err = CorralError::validation("bad key")
            .with_rollback(Some(CorralError::external("shift", "lchown failed")));
        let text = err.to_string();
        assert!(text.contains("bad key"));
        assert!(text.contains("lchown failed"));
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let err = CorralError::OperationTimeout {
            action: "stop".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(
            err.to_string(),
            "container stop operation timed out after 30 seconds"
        );
    }
}
