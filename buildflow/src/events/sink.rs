//! Event sink trait and implementations.

use crate::core::BuildEvent;
use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

/// Trait for event sinks that receive build events.
///
/// Sinks are the persistence and live-view collaborators' hook into the
/// engine. A sink must never fail the build: errors are logged and
/// suppressed by the implementation.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &BuildEvent);

    /// Tries to emit an event without blocking.
    fn try_emit(&self, event: &BuildEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &BuildEvent) {}

    fn try_emit(&self, _event: &BuildEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &BuildEvent) {
        let stage = event.stage_name.as_deref().unwrap_or("-");
        let status = event
            .status
            .map(|s| s.to_string())
            .or_else(|| event.build_status.map(|s| s.to_string()))
            .unwrap_or_default();

        match self.level {
            Level::DEBUG | Level::TRACE => debug!(
                build_id = %event.build_id,
                sequence = event.sequence,
                stage = %stage,
                status = %status,
                exit_code = ?event.exit_code,
                "Event: {}", event.event_type()
            ),
            Level::WARN | Level::ERROR => warn!(
                build_id = %event.build_id,
                sequence = event.sequence,
                stage = %stage,
                status = %status,
                exit_code = ?event.exit_code,
                "Event: {}", event.event_type()
            ),
            _ => info!(
                build_id = %event.build_id,
                sequence = event.sequence,
                stage = %stage,
                status = %status,
                exit_code = ?event.exit_code,
                "Event: {}", event.event_type()
            ),
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &BuildEvent) {
        self.log_event(event);
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.log_event(event);
    }
}

/// A sink that keeps every event in memory.
///
/// Doubles as the in-memory implementation of the persistence contract:
/// append through the sink, query with [`events_for`](Self::events_for).
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<BuildEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events.read().clone()
    }

    /// Returns the events of one build, in sequence order.
    #[must_use]
    pub fn events_for(&self, build_id: &str) -> Vec<BuildEvent> {
        let mut events: Vec<_> = self
            .events
            .read()
            .iter()
            .filter(|e| e.build_id == build_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        events
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events whose type starts with a prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<BuildEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Returns the event types recorded for one stage, in arrival order.
    #[must_use]
    pub fn stage_event_types(&self, stage: &str) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage_name.as_deref() == Some(stage))
            .map(BuildEvent::event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &BuildEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventKind, StageStatus};

    fn stage_event(kind: EventKind, stage: &str) -> BuildEvent {
        BuildEvent::stage("lfs-1", kind, stage, StageStatus::Running)
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let event = stage_event(EventKind::StageStarted, "a");
        NoOpEventSink.emit(&event).await;
        LoggingEventSink::default().emit(&event).await;
        LoggingEventSink::debug().try_emit(&event);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&stage_event(EventKind::StageStarted, "a")).await;
        sink.try_emit(&stage_event(EventKind::StageCompleted, "a"));
        sink.try_emit(&BuildEvent::new("lfs-1", EventKind::CleanupPerformed));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.stage_event_types("a"), vec!["stage.started", "stage.completed"]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_events_for_sorts_by_sequence() {
        let sink = CollectingEventSink::new();
        let mut late = stage_event(EventKind::StageCompleted, "a");
        late.sequence = 2;
        let mut early = stage_event(EventKind::StageStarted, "a");
        early.sequence = 1;
        let mut other = stage_event(EventKind::StageStarted, "a");
        other.build_id = "lfs-2".to_string();

        sink.emit(&late).await;
        sink.emit(&early).await;
        sink.emit(&other).await;

        let events = sink.events_for("lfs-1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 1);
    }
}
