//! In-process backend
//!
//! Keeps its entity map in memory. `push_state` plays the part of the remote
//! backend emitting a change; `turn_on`/`turn_off`/`toggle` service calls flip
//! the target entity's state the way a real backend would.

use crate::{Plugin, PluginError, PluginMeta, PluginResult, PluginSender};
use ad_clock::{SharedClock, SystemClock};
use ad_core::events::{StateChangedData, STATE_CHANGED};
use ad_core::{EntityId, EntityState, Event, NamespaceMap, StateUpdate};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// A recorded `call_service` invocation
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceCallRecord {
    pub domain: String,
    pub service: String,
    pub data: Value,
}

pub struct MemoryPlugin {
    namespace: String,
    entities: RwLock<NamespaceMap>,
    sender: Mutex<Option<PluginSender>>,
    calls: Mutex<Vec<ServiceCallRecord>>,
    /// Stamps `last_changed` and event times
    clock: SharedClock,
}

impl MemoryPlugin {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entities: RwLock::new(IndexMap::new()),
            sender: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Take time from the runtime's clock instead of the wall clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Seed an entity before the plugin starts
    pub fn with_entity(self, entity_id: &str, state: impl Into<Value>) -> Self {
        if let Ok(id) = entity_id.parse::<EntityId>() {
            let record = EntityState::new(id, state.into(), IndexMap::new());
            self.entities
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(entity_id.to_string(), record);
        }
        self
    }

    /// Simulate the backend changing an entity
    pub fn push_state(&self, entity_id: &str, update: StateUpdate) -> PluginResult<EntityState> {
        let id: EntityId = entity_id
            .parse()
            .map_err(|e| PluginError::Backend(format!("{e}")))?;

        let (old_state, new_state) = {
            let mut entities = self
                .entities
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let old_state = entities.get(entity_id).cloned();
            let mut new_state = old_state
                .clone()
                .unwrap_or_else(|| EntityState::new(id, Value::Null, IndexMap::new()));
            new_state.apply(&update, self.clock.now());
            entities.insert(entity_id.to_string(), new_state.clone());
            (old_state, new_state)
        };

        let data = StateChangedData {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: Some(new_state.clone()),
        };
        self.emit(Event::new(
            self.namespace.clone(),
            STATE_CHANGED,
            serde_json::to_value(data).unwrap_or_default(),
        ));
        Ok(new_state)
    }

    /// Simulate the backend firing a custom event
    pub fn push_event(&self, event_type: &str, data: Value) {
        self.emit(Event::new(self.namespace.clone(), event_type, data));
    }

    pub fn service_calls(&self) -> Vec<ServiceCallRecord> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: Event) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = sender.as_ref() {
            let _ = tx.send(event.at(self.clock.now()));
        }
    }

    fn current(&self, entity_id: &str) -> Option<EntityState> {
        self.entities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }
}

#[async_trait]
impl Plugin for MemoryPlugin {
    fn meta(&self) -> PluginMeta {
        PluginMeta::new(self.namespace.clone(), "memory")
    }

    async fn start(&self, events: PluginSender) -> PluginResult<()> {
        *self
            .sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(events);
        Ok(())
    }

    async fn stop(&self) -> PluginResult<()> {
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }

    async fn get_state_snapshot(&self) -> PluginResult<NamespaceMap> {
        Ok(self
            .entities
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    fn supports_set_state(&self) -> bool {
        true
    }

    async fn set_plugin_state(
        &self,
        _namespace: &str,
        entity_id: &str,
        update: &StateUpdate,
    ) -> PluginResult<Option<EntityState>> {
        let id: EntityId = entity_id
            .parse()
            .map_err(|e| PluginError::Backend(format!("{e}")))?;
        let mut entities = self
            .entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = entities
            .entry(entity_id.to_string())
            .or_insert_with(|| EntityState::new(id, Value::Null, IndexMap::new()));
        entry.apply(update, self.clock.now());
        Ok(Some(entry.clone()))
    }

    fn supports_remove_entity(&self) -> bool {
        true
    }

    async fn remove_entity(&self, _namespace: &str, entity_id: &str) -> PluginResult<()> {
        self.entities
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .shift_remove(entity_id);
        Ok(())
    }

    async fn call_service(
        &self,
        _namespace: &str,
        domain: &str,
        service: &str,
        data: Value,
    ) -> PluginResult<Option<Value>> {
        debug!(domain, service, "Memory plugin service call");
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(ServiceCallRecord {
                domain: domain.to_string(),
                service: service.to_string(),
                data: data.clone(),
            });

        let Some(entity_id) = data.get("entity_id").and_then(Value::as_str) else {
            return Ok(None);
        };
        let target = match service {
            "turn_on" => Some("on"),
            "turn_off" => Some("off"),
            "toggle" => match self.current(entity_id).map(|s| s.state) {
                Some(Value::String(s)) if s == "on" => Some("off"),
                _ => Some("on"),
            },
            _ => None,
        };
        match target {
            Some(state) => {
                let new_state = self.push_state(entity_id, StateUpdate::state(state))?;
                Ok(Some(json!({"state": new_state.state})))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_clock::VirtualClock;
    use ad_core::LastChanged;
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_push_state_emits_state_changed() {
        let plugin = MemoryPlugin::new("default").with_entity("light.hall", "off");
        let (tx, mut rx) = mpsc::unbounded_channel();
        plugin.start(tx).await.unwrap();

        plugin
            .push_state("light.hall", StateUpdate::state("on"))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type.as_str(), STATE_CHANGED);
        assert_eq!(event.data["old_state"]["state"], "off");
        assert_eq!(event.data["new_state"]["state"], "on");
    }

    #[tokio::test]
    async fn test_records_and_events_use_the_given_clock() {
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        let plugin = MemoryPlugin::new("default")
            .with_entity("light.hall", "off")
            .with_clock(Arc::new(VirtualClock::at(at)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        plugin.start(tx).await.unwrap();

        let pushed = plugin
            .push_state("light.hall", StateUpdate::state("on"))
            .unwrap();
        assert_eq!(pushed.last_changed, LastChanged::At(at));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.time_fired, at);

        let written = plugin
            .set_plugin_state("default", "sensor.temp", &StateUpdate::state(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(written.last_changed.instant(), Some(at));
    }

    #[tokio::test]
    async fn test_toggle_service_flips_state() {
        let plugin = MemoryPlugin::new("default").with_entity("switch.fan", "on");
        let (tx, _rx) = mpsc::unbounded_channel();
        plugin.start(tx).await.unwrap();

        plugin
            .call_service("default", "switch", "toggle", json!({"entity_id": "switch.fan"}))
            .await
            .unwrap();

        let snapshot = plugin.get_state_snapshot().await.unwrap();
        assert_eq!(snapshot["switch.fan"].state, json!("off"));
        assert_eq!(plugin.service_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_set_plugin_state_returns_backend_view() {
        let plugin = MemoryPlugin::new("default");
        let state = plugin
            .set_plugin_state(
                "default",
                "sensor.temp",
                &StateUpdate::state(21).with_attribute("unit", "C"),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.state, json!(21));
        assert_eq!(state.attributes["unit"], json!("C"));
    }
}
