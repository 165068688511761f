//! Lifecycle event feed.
//!
//! Events are fire-and-forget: publishing never blocks the scheduler and never fails.
//! Consumers pick a sink at startup with [`crate::Scheduler::set_event_publisher`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field, builder style.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

pub trait EventPublisher: Send + Sync + Debug {
    fn publish(&self, event: Event);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: Event) {}
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

impl EventPublisher for TracingPublisher {
    fn publish(&self, event: Event) {
        tracing::debug!(
            event = %event.name,
            model = %event.model_id,
            fields = %serde_json::Value::Object(event.fields),
            "Lifecycle event"
        );
    }
}

/// Bounded in-memory recorder, oldest events are dropped first.
#[derive(Debug)]
pub struct MemoryPublisher {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl MemoryPublisher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().iter().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Events with the given name, in publish order.
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for MemoryPublisher {
    fn publish(&self, event: Event) {
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Fans events out to any number of subscribers. Lagging subscribers lose events.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Publishes each event to every inner publisher in order.
#[derive(Debug, Default, Clone)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }

    pub fn push(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, event: Event) {
        if let Some((last, rest)) = self.publishers.split_last() {
            for publisher in rest {
                publisher.publish(event.clone());
            }
            last.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_publisher_logs_fields() {
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).finish(),
        );
        TracingPublisher.publish(
            Event::new("ensure_ready", "alpha")
                .with("port", 8081u16)
                .with("pid", 42u32),
        );
        TracingPublisher.publish(Event::new("ensure_start", "alpha"));
    }

    #[test]
    fn test_event_fields() {
        let event = Event::new("evict", "alpha").with("freed_mb", 10u64);
        assert_eq!(event.field("freed_mb"), Some(&Value::from(10u64)));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "evict");
        assert_eq!(json["model_id"], "alpha");
        assert_eq!(json["fields"]["freed_mb"], 10);
    }

    #[test]
    fn test_memory_publisher_is_bounded() {
        let publisher = MemoryPublisher::new(2);
        publisher.publish(Event::new("a", "m"));
        publisher.publish(Event::new("b", "m"));
        publisher.publish(Event::new("c", "m"));

        assert_eq!(publisher.names(), vec!["b", "c"]);
        publisher.clear();
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();

        publisher.publish(Event::new("ensure_ready", "alpha"));

        assert_eq!(first.recv().await.unwrap().name, "ensure_ready");
        assert_eq!(second.recv().await.unwrap().model_id, "alpha");
    }

    #[test]
    fn test_broadcast_without_subscribers_does_not_fail() {
        BroadcastPublisher::new(1).publish(Event::new("evict", "alpha"));
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(MemoryPublisher::default());
        let b = Arc::new(MemoryPublisher::default());
        let fanout = FanoutPublisher::default()
            .push(a.clone())
            .push(b.clone())
            .push(Arc::new(TracingPublisher));

        fanout.publish(Event::new("unload_done", "beta"));

        assert_eq!(a.names(), vec!["unload_done"]);
        assert_eq!(b.names(), vec!["unload_done"]);
    }
}
