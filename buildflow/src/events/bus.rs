//! The build event bus.
//!
//! Every event passes through one [`EventBus`], which stamps it with a
//! per-build sequence number, broadcasts it to live subscribers and forwards
//! it to each registered sink.

use super::sink::EventSink;
use crate::core::BuildEvent;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default number of events buffered for slow subscribers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of build events to subscribers and sinks.
pub struct EventBus {
    sender: broadcast::Sender<BuildEvent>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    sequences: DashMap<String, u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sinks: RwLock::new(Vec::new()),
            sequences: DashMap::new(),
        }
    }

    /// Subscribes to every event published after this call.
    ///
    /// A subscriber that falls more than the channel capacity behind observes
    /// `RecvError::Lagged` and skips ahead.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.sender.subscribe()
    }

    /// Registers a sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Returns the number of registered sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Drops the sequence counter of an archived build.
    pub fn forget(&self, build_id: &str) {
        self.sequences.remove(build_id);
    }

    fn stamp(&self, mut event: BuildEvent) -> BuildEvent {
        let mut next = self.sequences.entry(event.build_id.clone()).or_insert(0);
        *next += 1;
        event.sequence = *next;
        event
    }

    fn sinks(&self) -> Vec<Arc<dyn EventSink>> {
        self.sinks.read().clone()
    }

    /// Publishes an event, awaiting each sink.
    pub async fn publish(&self, event: BuildEvent) -> BuildEvent {
        let event = self.stamp(event);
        // No receivers is not an error.
        let _ = self.sender.send(event.clone());
        for sink in self.sinks() {
            sink.emit(&event).await;
        }
        event
    }

    /// Publishes an event without awaiting.
    pub fn publish_now(&self, event: BuildEvent) -> BuildEvent {
        let event = self.stamp(event);
        let _ = self.sender.send(event.clone());
        for sink in self.sinks() {
            sink.try_emit(&event);
        }
        event
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn emit(&self, event: &BuildEvent) {
        self.publish(event.clone()).await;
    }

    fn try_emit(&self, event: &BuildEvent) {
        self.publish_now(event.clone());
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("sinks", &self.sink_count())
            .field("builds", &self.sequences.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildStatus, EventKind};
    use crate::events::CollectingEventSink;

    #[tokio::test]
    async fn test_sequences_are_per_build() {
        let bus = EventBus::default();
        let a1 = bus.publish(BuildEvent::new("a", EventKind::BuildStarted)).await;
        let b1 = bus.publish(BuildEvent::new("b", EventKind::BuildStarted)).await;
        let a2 = bus.publish_now(BuildEvent::new("a", EventKind::CancelRequested));

        assert_eq!((a1.sequence, a2.sequence, b1.sequence), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_subscriber_and_sink_receive_events() {
        let bus = EventBus::default();
        let sink = Arc::new(CollectingEventSink::new());
        bus.add_sink(sink.clone());
        let mut rx = bus.subscribe();

        bus.publish(BuildEvent::build("a", EventKind::BuildFinished, BuildStatus::Success))
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, EventKind::BuildFinished);
        assert_eq!(received.sequence, 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(BuildEvent::new("a", EventKind::BuildStarted)).await;
        bus.forget("a");
        let again = bus.publish(BuildEvent::new("a", EventKind::BuildStarted)).await;
        assert_eq!(again.sequence, 1);
    }
}
