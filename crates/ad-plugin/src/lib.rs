//! Plugin adapter contract
//!
//! A plugin populates one namespace from an external backend and forwards
//! writes and service calls back to it. The runtime never talks to a backend
//! directly; it only sees this trait.
//!
//! - [`Plugin`] - the adapter contract
//! - [`PluginManager`] - namespace to plugin mapping, start/stop, snapshot refresh
//! - [`MemoryPlugin`] - an in-process backend used by the demo binary and tests

mod manager;
mod memory;

pub use manager::{PluginEvents, PluginManager, SharedPluginManager};
pub use memory::{MemoryPlugin, ServiceCallRecord};

use ad_core::{EntityState, Event, NamespaceMap, StateUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for plugin operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors surfaced by plugins
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("a plugin is already registered for namespace '{0}'")]
    AlreadyRegistered(String),

    #[error("no plugin for namespace '{0}'")]
    NotFound(String),

    #[error("plugin for '{namespace}' does not support {operation}")]
    Unsupported {
        namespace: String,
        operation: &'static str,
    },

    #[error("plugin for '{namespace}' is not connected")]
    NotConnected { namespace: String },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMeta {
    /// Namespace this plugin populates
    pub namespace: String,

    /// Type tag, e.g. `hass` or `mqtt`
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Anything else the plugin wants to expose
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PluginMeta {
    pub fn new(namespace: impl Into<String>, plugin_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            plugin_type: plugin_type.into(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Channel on which a plugin delivers backend events into the runtime
pub type PluginSender = mpsc::UnboundedSender<Event>;

/// The contract every backend adapter implements
///
/// Only `meta` and `get_state_snapshot` are mandatory. The optional hooks
/// default to "not supported", and the state store then falls back to
/// handling the write locally.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn meta(&self) -> PluginMeta;

    /// Begin delivering backend events on `events`
    ///
    /// `state_changed` events carry `{entity_id, old_state, new_state}`;
    /// anything else is passed through to event callbacks unchanged.
    async fn start(&self, events: PluginSender) -> PluginResult<()>;

    async fn stop(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Full entity map of the backend
    async fn get_state_snapshot(&self) -> PluginResult<NamespaceMap>;

    fn supports_set_state(&self) -> bool {
        false
    }

    /// Push a write to the backend
    ///
    /// Returns the backend's view of the entity after the write, which the
    /// runtime then stores and announces.
    async fn set_plugin_state(
        &self,
        namespace: &str,
        _entity_id: &str,
        _update: &StateUpdate,
    ) -> PluginResult<Option<EntityState>> {
        Err(PluginError::Unsupported {
            namespace: namespace.to_string(),
            operation: "set_plugin_state",
        })
    }

    fn supports_remove_entity(&self) -> bool {
        false
    }

    async fn remove_entity(&self, namespace: &str, _entity_id: &str) -> PluginResult<()> {
        Err(PluginError::Unsupported {
            namespace: namespace.to_string(),
            operation: "remove_entity",
        })
    }

    async fn call_service(
        &self,
        namespace: &str,
        _domain: &str,
        _service: &str,
        _data: Value,
    ) -> PluginResult<Option<Value>> {
        Err(PluginError::Unsupported {
            namespace: namespace.to_string(),
            operation: "call_service",
        })
    }

    /// Periodic housekeeping, driven by the utility loop
    async fn utility(&self) -> PluginResult<()> {
        Ok(())
    }
}
