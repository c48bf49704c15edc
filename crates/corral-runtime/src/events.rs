//! Lifecycle event notifications.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A lifecycle notification such as `container-started`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    /// Event name.
    pub action: String,
    /// Resource path, `/1.0/containers/<name>`.
    pub source: String,
    /// Extra context, for example `new_name` on rename.
    pub metadata: BTreeMap<String, String>,
    /// When the event fired.
    pub timestamp: DateTime<Utc>,
}

impl LifecycleEvent {
    /// Builds an event for `container`.
    #[must_use]
    pub fn new(action: &str, container: &str) -> Self {
        Self {
            action: action.to_string(),
            source: container_source(container),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        let _ = self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Resource path of a container.
#[must_use]
pub fn container_source(name: &str) -> String {
    format!("/1.0/containers/{name}")
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Delivery never fails the lifecycle action.
    fn emit(&self, event: LifecycleEvent);
}

/// Sink that writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: LifecycleEvent) {
        tracing::info!(
            action = %event.action,
            source = %event.source,
            metadata = ?event.metadata,
            "lifecycle event"
        );
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl EventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events named `action`.
    #[must_use]
    pub fn count(&self, action: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_event_keeps_old_source() {
        let event = LifecycleEvent::new("container-renamed", "old").with("new_name", "new");
        assert_eq!(event.source, "/1.0/containers/old");
        assert_eq!(event.metadata["new_name"], "new");
    }

    #[test]
    fn recorder_counts_by_action() {
        let recorder = EventRecorder::new();
        recorder.emit(LifecycleEvent::new("container-started", "c1"));
        recorder.emit(LifecycleEvent::new("container-updated", "c1"));
        recorder.emit(LifecycleEvent::new("container-updated", "c1"));
        assert_eq!(recorder.count("container-updated"), 2);
        assert_eq!(recorder.events().len(), 3);
    }
}
