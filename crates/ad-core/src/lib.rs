//! Core types for the automation runtime
//!
//! This crate provides the fundamental types shared by every subsystem:
//! EntityId, EntityState, Event, and the namespace vocabulary.

mod entity_id;
mod event;
mod namespace;
mod state;

pub use entity_id::{EntityId, EntityIdError};
pub use event::{Event, EventData, EventType};
pub use namespace::{Writeback, ADMIN, DEFAULT, GLOBAL, RULES};
pub use state::{truncate_to_seconds, EntityState, LastChanged, StateUpdate};

/// Free-form keyword arguments forwarded to user callbacks
pub type Kwargs = indexmap::IndexMap<String, serde_json::Value>;

/// Entity map of a single namespace, keyed by entity_id
pub type NamespaceMap = indexmap::IndexMap<String, EntityState>;

/// Built-in event types emitted by the runtime
pub mod events {
    use super::*;

    /// Fired in the source namespace whenever an entity is written
    pub const STATE_CHANGED: &str = "state_changed";

    /// Fired on `admin` when a namespace is created at runtime
    pub const NAMESPACE_ADDED: &str = "__AD_NAMESPACE_ADDED";

    /// Fired on `admin` when an app-added namespace is removed
    pub const NAMESPACE_REMOVED: &str = "__AD_NAMESPACE_REMOVED";

    /// Fired on `admin` when an entity is explicitly added
    pub const ENTITY_ADDED: &str = "__AD_ENTITY_ADDED";

    /// Fired on `admin` when an entity is removed
    pub const ENTITY_REMOVED: &str = "__AD_ENTITY_REMOVED";

    /// Carries app log lines to `listen_log` callbacks
    pub const LOG_EVENT: &str = "__AD_LOG_EVENT";

    pub const PLUGIN_STARTED: &str = "plugin_started";
    pub const PLUGIN_STOPPED: &str = "plugin_stopped";

    /// Fired once the initial app reconciliation has finished
    pub const APPD_STARTED: &str = "appd_started";

    /// Fired after a later reconciliation changed the running set
    pub const APP_RELOADED: &str = "app_reloaded";

    pub const APP_INITIALIZED: &str = "app_initialized";
    pub const APP_TERMINATED: &str = "app_terminated";

    /// Returns true for runtime-internal events, which wildcard listeners never see
    pub fn is_system_event(event_type: &str) -> bool {
        event_type.starts_with("__")
    }

    /// Data for STATE_CHANGED events
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct StateChangedData {
        pub entity_id: String,
        pub old_state: Option<EntityState>,
        pub new_state: Option<EntityState>,
    }

    impl EventData for StateChangedData {
        fn event_type() -> &'static str {
            STATE_CHANGED
        }
    }

    /// Data for `__AD_ENTITY_ADDED` / `__AD_ENTITY_REMOVED`
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct EntityEventData {
        pub namespace: String,
        pub entity_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub state: Option<EntityState>,
    }

    /// Data for `__AD_NAMESPACE_ADDED` / `__AD_NAMESPACE_REMOVED`
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct NamespaceEventData {
        pub namespace: String,
    }

    /// Data for `__AD_LOG_EVENT`
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    pub struct LogEventData {
        pub app_name: String,
        pub ts: chrono::DateTime<chrono::Utc>,
        pub level: String,
        pub log_type: String,
        pub message: String,
    }

    impl EventData for LogEventData {
        fn event_type() -> &'static str {
            LOG_EVENT
        }
    }
}
