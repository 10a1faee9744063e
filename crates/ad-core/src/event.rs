//! Events as they travel between plugins, the state store and apps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

const WILDCARD: &str = "*";

/// Payload with a fixed event name
pub trait EventData: Clone + Send + Sync + 'static {
    fn event_type() -> &'static str;
}

/// Name of an event, `*` standing for every name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn match_all() -> Self {
        Self(WILDCARD.into())
    }

    pub fn is_match_all(&self) -> bool {
        self.0 == WILDCARD
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0.as_str() == *other
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened in a namespace (`global` reaches every namespace)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,
    pub namespace: String,
    pub data: T,
    pub time_fired: DateTime<Utc>,
}

impl<T> Event<T> {
    /// Stamped with the wall clock; see [`Event::at`] for runtime time
    pub fn new(namespace: impl Into<String>, event_type: impl Into<EventType>, data: T) -> Self {
        Event {
            namespace: namespace.into(),
            event_type: event_type.into(),
            time_fired: Utc::now(),
            data,
        }
    }

    pub fn at(self, time_fired: DateTime<Utc>) -> Self {
        Event { time_fired, ..self }
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(namespace: impl Into<String>, data: T) -> Self {
        Event::new(namespace, T::event_type(), data)
    }
}

impl<T: EventData + Serialize> Event<T> {
    /// Payload as JSON; a payload that cannot be serialized becomes null
    pub fn into_untyped(self) -> Event {
        let data = serde_json::to_value(&self.data).unwrap_or_default();
        Event {
            event_type: self.event_type,
            namespace: self.namespace,
            time_fired: self.time_fired,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Clone, Serialize)]
    struct Ping {
        n: u32,
    }

    impl EventData for Ping {
        fn event_type() -> &'static str {
            "ping"
        }
    }

    #[test]
    fn test_typed_event_erases_to_json() {
        let when = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let event = Event::typed("default", Ping { n: 3 }).at(when).into_untyped();
        assert_eq!(event.event_type, "ping");
        assert_eq!(event.namespace, "default");
        assert_eq!(event.data, serde_json::json!({"n": 3}));
        assert_eq!(event.time_fired, when);
    }

    #[test]
    fn test_wildcard() {
        assert!(EventType::match_all().is_match_all());
        assert!(!EventType::from("state_changed").is_match_all());
        assert_eq!(EventType::match_all().to_string(), "*");
    }
}
