//! Event bus for the automation runtime
//!
//! Two delivery paths share one `fire()`:
//!
//! - **Listeners** are invoked synchronously, in registration order, before
//!   `fire()` returns. The runtime's router is a listener, which is what makes
//!   "every callback for event N is enqueued before any callback for N+1" hold.
//! - **Subscriptions** are tokio broadcast receivers, per event type or for
//!   every event. Sequences and tests use these to await state changes.

use ad_core::{Event, EventData, EventType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Backlog per broadcast channel before slow receivers lag
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Synchronous receiver of every fired event
///
/// Implementations must not block; hand work off to a queue instead.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

pub struct EventBus {
    /// Held weakly so the owner controls lifetime
    listeners: RwLock<Vec<(ListenerId, Weak<dyn EventListener>)>>,
    /// Lazily created on first subscription to a type
    senders: DashMap<EventType, broadcast::Sender<Event>>,
    match_all_sender: broadcast::Sender<Event>,
    next_listener_id: AtomicU64,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (match_all_sender, _) = broadcast::channel(capacity);
        Self {
            listeners: RwLock::new(Vec::new()),
            senders: DashMap::new(),
            match_all_sender,
            next_listener_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Listeners run in the order they were added. Dropping the last `Arc`
    /// unregisters the listener on the next fire.
    pub fn add_listener(&self, listener: &Arc<dyn EventListener>) -> ListenerId {
        let id = self.next_listener_id();
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        listeners.push((id, Arc::downgrade(listener)));
        trace!(listener = id.0, "Registered event listener");
        id
    }

    /// False if `id` was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Receiver for one event type across all namespaces; `*` gets everything
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event> {
        let event_type = event_type.into();
        if event_type.is_match_all() {
            return self.subscribe_all();
        }
        trace!(event_type = %event_type, "New subscription");
        let capacity = self.capacity;
        let sender = self
            .senders
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(capacity).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.match_all_sender.subscribe()
    }

    /// Listeners first, then typed subscribers, then `*` subscribers
    pub fn fire(&self, event: Event) {
        debug!(namespace = %event.namespace, event_type = %event.event_type, "Event");

        for listener in self.live_listeners() {
            listener.on_event(&event);
        }

        if let Some(sender) = self.senders.get(&event.event_type) {
            // Err only means nobody is listening
            let _ = sender.send(event.clone());
        }

        let _ = self.match_all_sender.send(event);
    }

    pub fn fire_typed<T: EventData + serde::Serialize>(&self, event: Event<T>) {
        self.fire(event.into_untyped());
    }

    /// Snapshot live listeners, pruning dropped ones, so no lock is held
    /// while listeners run
    fn live_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        let snapshot: Vec<_> = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            listeners
                .iter()
                .map(|(id, weak)| (*id, weak.upgrade()))
                .collect()
        };

        let dead: Vec<ListenerId> = snapshot
            .iter()
            .filter(|(_, l)| l.is_none())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.remove_listener(id);
        }

        snapshot.into_iter().filter_map(|(_, l)| l).collect()
    }

    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_default()
    }

    /// Event types that have had a subscriber
    pub fn subscription_count(&self) -> usize {
        self.senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use ad_core::events::{NamespaceEventData, NAMESPACE_ADDED};
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Event) {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.event_type));
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("test_event");

        bus.fire(Event::new("default", "test_event", json!({"key": "value"})));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type.as_str(), "test_event");
        assert_eq!(received.namespace, "default");
        assert_eq!(received.data["key"], "value");
    }

    #[tokio::test]
    async fn test_match_all_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();

        bus.fire(Event::new("default", "event_a", json!({})));
        bus.fire(Event::new("admin", "event_b", json!({})));

        let event1 = rx.recv().await.unwrap();
        let event2 = rx.recv().await.unwrap();

        assert_eq!(event1.event_type.as_str(), "event_a");
        assert_eq!(event2.event_type.as_str(), "event_b");
        assert_eq!(event2.namespace, "admin");
    }

    #[tokio::test]
    async fn test_typed_fire() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(NAMESPACE_ADDED);

        bus.fire_typed(Event::typed(
            "admin",
            NamespaceEventData {
                namespace: "mqtt".into(),
            },
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.data["namespace"], "mqtt");
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first: Arc<dyn EventListener> = Arc::new(Recorder {
            name: "first",
            seen: seen.clone(),
        });
        let second: Arc<dyn EventListener> = Arc::new(Recorder {
            name: "second",
            seen: seen.clone(),
        });
        bus.add_listener(&first);
        bus.add_listener(&second);

        bus.fire(Event::new("default", "a", json!({})));
        bus.fire(Event::new("default", "b", json!({})));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:a", "second:a", "first:b", "second:b"]
        );
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn EventListener> = Arc::new(Recorder {
            name: "gone",
            seen: seen.clone(),
        });
        bus.add_listener(&listener);
        drop(listener);

        bus.fire(Event::new("default", "a", json!({})));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_no_cross_event_pollution() {
        let bus = EventBus::new();
        let mut rx_a = bus.subscribe("event_a");
        let mut rx_b = bus.subscribe("event_b");

        bus.fire(Event::new("default", "event_a", json!({"type": "a"})));

        let received = rx_a.recv().await.unwrap();
        assert_eq!(received.data["type"], "a");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_removed_listener_stops_hearing() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let listener: Arc<dyn EventListener> = Arc::new(Recorder {
            name: "l",
            seen: seen.clone(),
        });
        let id = bus.add_listener(&listener);
        bus.fire(Event::new("default", "a", json!({})));

        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        bus.fire(Event::new("default", "b", json!({})));
        assert_eq!(*seen.lock().unwrap(), vec!["l:a"]);
    }
}
