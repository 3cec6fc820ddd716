//! [`EventPublisher`] implementations. The default is a structured-logging
//! sink; an in-memory collector and a fan-out composite exist for tests and
//! for wiring multiple sinks at startup.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;

/// Publishes domain events through `tracing`. This is the only publisher
/// wired up in production; audit consumption happens through the log
/// pipeline, not a dedicated event bus.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "domain event");
        } else {
            debug!(event_type = %event_type, event = %json, "domain event");
        }
    }
}

/// Collects events in memory; used by tests that assert on what was
/// published without standing up a logging subscriber.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) {
        self.events.write().push(event);
    }
}

/// Fans a single event out to every registered backend.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Box<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Box::new(publisher));
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        for publisher in &self.publishers {
            publisher.publish(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::snapshot_created;

    #[tokio::test]
    async fn logging_publisher_does_not_panic() {
        let publisher = LoggingEventPublisher::new();
        let event = snapshot_created(uuid::Uuid::nil(), "vol-1".into(), "daily_5", "snap-1".into());
        publisher.publish(event).await;
    }

    #[tokio::test]
    async fn in_memory_collector_tracks_events() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish(snapshot_created(uuid::Uuid::nil(), "vol-1".into(), "daily_5", "snap-1".into()))
            .await;
        collector
            .publish(snapshot_created(uuid::Uuid::nil(), "vol-2".into(), "daily_5", "snap-2".into()))
            .await;

        assert_eq!(collector.len(), 2);
        assert_eq!(collector.events_of_type("snapshot_created").len(), 2);

        collector.clear();
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn composite_fans_out_to_every_backend() {
        let a = std::sync::Arc::new(InMemoryEventCollector::new());
        let b = std::sync::Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(a.clone())
            .with_publisher(b.clone());

        composite
            .publish(snapshot_created(uuid::Uuid::nil(), "vol-1".into(), "daily_5", "snap-1".into()))
            .await;

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
