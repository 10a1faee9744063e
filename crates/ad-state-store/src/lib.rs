//! Namespaced entity state store
//!
//! This crate provides the StateStore, which keeps one entity map per
//! namespace. It is responsible for:
//! - Namespace lifecycle (built-in, configured, and app-added namespaces)
//! - The `get_state` lookup rules (entity, domain, attribute, full record)
//! - Merging writes and delegating them to the namespace's plugin
//! - Publishing `state_changed` and the `__AD_*` bookkeeping events
//! - Persisting namespaces that carry a writeback policy

mod persist;

pub use persist::{NamespaceFile, NamespaceStorage, StorageError, STORAGE_VERSION};

use ad_clock::SharedClock;
use ad_core::events::{
    EntityEventData, NamespaceEventData, StateChangedData, ENTITY_ADDED, ENTITY_REMOVED,
    NAMESPACE_ADDED, NAMESPACE_REMOVED, STATE_CHANGED,
};
use ad_core::{
    EntityId, EntityIdError, EntityState, Event, NamespaceMap, StateUpdate, Writeback, ADMIN,
};
use ad_event_bus::EventBus;
use ad_plugin::{PluginError, PluginManager};
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Result type for state store operations
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the state store
#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown namespace '{0}'")]
    NamespaceNotFound(String),

    #[error("namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("namespace '{0}' was not added by an app and cannot be removed")]
    NotAppNamespace(String),

    #[error("invalid entity id: {0}")]
    InvalidEntityId(#[from] EntityIdError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One namespace's entities plus its bookkeeping
#[derive(Debug, Clone)]
struct Namespace {
    entities: NamespaceMap,
    writeback: Writeback,
    app_added: bool,
    dirty: bool,
}

impl Namespace {
    fn new(writeback: Writeback, app_added: bool) -> Self {
        Self {
            entities: IndexMap::new(),
            writeback,
            app_added,
            dirty: false,
        }
    }
}

/// Selects what `get_state` returns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateQuery {
    /// Full id, bare domain, or `None` for the whole namespace
    pub entity_id: Option<String>,
    /// Attribute name, `"all"` for the full record, or `None` for the state value
    pub attribute: Option<String>,
    /// Returned when the entity or attribute is missing
    pub default: Option<Value>,
}

impl StateQuery {
    /// Every entity in the namespace
    pub fn all() -> Self {
        <Self as Default>::default()
    }

    /// A single entity, or every entity of a domain when `id` has no `.`
    pub fn entity(id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn or_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// The namespaced state store
pub struct StateStore {
    namespaces: DashMap<String, Namespace>,
    event_bus: Arc<EventBus>,
    plugins: Arc<PluginManager>,
    clock: SharedClock,
    storage: Option<NamespaceStorage>,
}

impl StateStore {
    pub fn new(event_bus: Arc<EventBus>, plugins: Arc<PluginManager>, clock: SharedClock) -> Self {
        Self {
            namespaces: DashMap::new(),
            event_bus,
            plugins,
            clock,
            storage: None,
        }
    }

    /// Enable persistence under `<config_dir>/namespaces`
    pub fn with_storage(mut self, storage: NamespaceStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Create a built-in or configured namespace
    ///
    /// Idempotent. Persistent namespaces are loaded from disk when a file
    /// exists.
    pub async fn init_namespace(&self, name: &str, writeback: Writeback) -> StateResult<()> {
        if self.namespaces.contains_key(name) {
            return Ok(());
        }
        let namespace = self.load_namespace(name, writeback, false).await?;
        self.namespaces.insert(name.to_string(), namespace);
        debug!(namespace = name, ?writeback, "Initialized namespace");
        Ok(())
    }

    /// Create a namespace on behalf of an app
    #[instrument(skip(self))]
    pub async fn add_namespace(&self, name: &str, writeback: Writeback) -> StateResult<()> {
        if self.namespaces.contains_key(name) {
            return Err(StateError::AlreadyExists(name.to_string()));
        }
        let namespace = self.load_namespace(name, writeback, true).await?;
        self.namespaces.insert(name.to_string(), namespace);
        info!(namespace = name, "Namespace added");

        self.fire_admin(
            NAMESPACE_ADDED,
            NamespaceEventData {
                namespace: name.to_string(),
            },
        );
        Ok(())
    }

    /// Remove an app-added namespace and its persistent file
    #[instrument(skip(self))]
    pub async fn remove_namespace(&self, name: &str) -> StateResult<()> {
        let app_added = self
            .namespaces
            .get(name)
            .map(|ns| ns.app_added)
            .ok_or_else(|| StateError::NamespaceNotFound(name.to_string()))?;
        if !app_added {
            return Err(StateError::NotAppNamespace(name.to_string()));
        }

        self.namespaces.remove(name);
        if let Some(storage) = &self.storage {
            storage.delete(name).await?;
        }
        info!(namespace = name, "Namespace removed");

        self.fire_admin(
            NAMESPACE_REMOVED,
            NamespaceEventData {
                namespace: name.to_string(),
            },
        );
        Ok(())
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    /// Names of every namespace, sorted
    pub fn list_namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|n| n.key().clone()).collect();
        names.sort();
        names
    }

    /// Namespaces created through `add_namespace`
    pub fn app_namespaces(&self) -> Vec<String> {
        self.namespaces
            .iter()
            .filter(|n| n.app_added)
            .map(|n| n.key().clone())
            .collect()
    }

    async fn load_namespace(
        &self,
        name: &str,
        writeback: Writeback,
        app_added: bool,
    ) -> StateResult<Namespace> {
        let mut namespace = Namespace::new(writeback, app_added);
        if writeback.is_persistent() {
            if let Some(storage) = &self.storage {
                if let Some(entities) = storage.load(name).await? {
                    namespace.entities = entities;
                }
            }
        }
        Ok(namespace)
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Add an entity without a `last_changed` stamp
    ///
    /// Returns `false` (and does nothing) when it already exists.
    #[instrument(skip(self, state, attributes), fields(namespace = %namespace, entity_id = %entity_id))]
    pub async fn add_entity(
        &self,
        namespace: &str,
        entity_id: &str,
        state: Value,
        attributes: IndexMap<String, Value>,
    ) -> StateResult<bool> {
        let id: EntityId = entity_id.parse()?;
        let record = {
            let mut ns = self
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| StateError::NamespaceNotFound(namespace.to_string()))?;
            if ns.entities.contains_key(entity_id) {
                trace!("Entity already present");
                return Ok(false);
            }
            let record = EntityState::new(id, state, attributes);
            ns.entities.insert(entity_id.to_string(), record.clone());
            ns.dirty = true;
            record
        };

        self.fire_admin(
            ENTITY_ADDED,
            EntityEventData {
                namespace: namespace.to_string(),
                entity_id: entity_id.to_string(),
                state: Some(record),
            },
        );
        self.flush_if_safe(namespace).await?;
        Ok(true)
    }

    /// Remove an entity, delegating to the namespace's plugin when it can
    #[instrument(skip(self), fields(namespace = %namespace, entity_id = %entity_id))]
    pub async fn remove_entity(&self, namespace: &str, entity_id: &str) -> StateResult<bool> {
        if !self.namespaces.contains_key(namespace) {
            return Err(StateError::NamespaceNotFound(namespace.to_string()));
        }

        if let Some(plugin) = self.plugins.get(namespace) {
            if plugin.supports_remove_entity() {
                plugin.remove_entity(namespace, entity_id).await?;
            }
        }

        let removed = self.namespaces.get_mut(namespace).and_then(|mut ns| {
            let removed = ns.entities.shift_remove(entity_id);
            if removed.is_some() {
                ns.dirty = true;
            }
            removed
        });

        if removed.is_none() {
            return Ok(false);
        }

        debug!("Entity removed");
        self.fire_admin(
            ENTITY_REMOVED,
            EntityEventData {
                namespace: namespace.to_string(),
                entity_id: entity_id.to_string(),
                state: None,
            },
        );
        self.flush_if_safe(namespace).await?;
        Ok(true)
    }

    pub fn entity_exists(&self, namespace: &str, entity_id: &str) -> bool {
        self.namespaces
            .get(namespace)
            .map(|ns| ns.entities.contains_key(entity_id))
            .unwrap_or(false)
    }

    /// A clone of one entity's record
    pub fn get_entity(&self, namespace: &str, entity_id: &str) -> Option<EntityState> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.entities.get(entity_id).cloned())
    }

    /// Borrow one entity's record without copying it
    pub fn with_entity<R>(
        &self,
        namespace: &str,
        entity_id: &str,
        f: impl FnOnce(&EntityState) -> R,
    ) -> Option<R> {
        let ns = self.namespaces.get(namespace)?;
        ns.entities.get(entity_id).map(f)
    }

    /// A clone of a namespace's entity map
    pub fn namespace_map(&self, namespace: &str) -> Option<NamespaceMap> {
        self.namespaces.get(namespace).map(|ns| ns.entities.clone())
    }

    /// Look up state following the query rules
    ///
    /// A missing namespace logs a warning and yields the query's default.
    pub fn get_state(&self, namespace: &str, query: &StateQuery) -> Option<Value> {
        let Some(ns) = self.namespaces.get(namespace) else {
            warn!(namespace, "get_state on unknown namespace");
            return query.default.clone();
        };

        let Some(entity_id) = query.entity_id.as_deref() else {
            return Some(map_to_value(ns.entities.iter()));
        };

        if !entity_id.contains('.') {
            let prefix = format!("{entity_id}.");
            return Some(map_to_value(
                ns.entities.iter().filter(|(id, _)| id.starts_with(&prefix)),
            ));
        }

        let Some(record) = ns.entities.get(entity_id) else {
            return query.default.clone();
        };

        match query.attribute.as_deref() {
            None => Some(record.state.clone()),
            Some("all") => Some(record.to_value()),
            Some(attribute) => record
                .attribute(attribute)
                .cloned()
                .or_else(|| record.top_level(attribute))
                .or_else(|| query.default.clone()),
        }
    }

    /// Merge a write into an entity and announce it
    ///
    /// When the namespace's plugin accepts writes the plugin's view of the
    /// entity is what gets stored. `state_changed` is published on every call,
    /// even when nothing actually changed.
    #[instrument(skip(self, update), fields(namespace = %namespace, entity_id = %entity_id))]
    pub async fn set_state(
        &self,
        namespace: &str,
        entity_id: &str,
        update: StateUpdate,
        silent: bool,
    ) -> StateResult<EntityState> {
        let id: EntityId = entity_id.parse()?;
        let old_state = {
            let ns = self
                .namespaces
                .get(namespace)
                .ok_or_else(|| StateError::NamespaceNotFound(namespace.to_string()))?;
            ns.entities.get(entity_id).cloned()
        };

        if old_state.is_none() && !silent {
            info!("{} not found in namespace {}, creating it", entity_id, namespace);
        }

        let now = self.clock.now();
        let mut new_state = old_state
            .clone()
            .unwrap_or_else(|| EntityState::new(id, Value::Null, IndexMap::new()));
        new_state.apply(&update, now);

        if let Some(plugin) = self.plugins.get(namespace) {
            if plugin.supports_set_state() {
                if let Some(from_plugin) =
                    plugin.set_plugin_state(namespace, entity_id, &update).await?
                {
                    new_state = from_plugin;
                }
            }
        }

        {
            let mut ns = self
                .namespaces
                .get_mut(namespace)
                .ok_or_else(|| StateError::NamespaceNotFound(namespace.to_string()))?;
            ns.entities.insert(entity_id.to_string(), new_state.clone());
            ns.dirty = true;
        }

        debug!(state = %new_state.state, "State set");
        self.event_bus.fire_typed(
            Event::typed(
                namespace,
                StateChangedData {
                    entity_id: entity_id.to_string(),
                    old_state,
                    new_state: Some(new_state.clone()),
                },
            )
            .at(now),
        );

        self.flush_if_safe(namespace).await?;
        Ok(new_state)
    }

    /// Accept an event delivered by a plugin
    ///
    /// `state_changed` updates the local map first (a missing `new_state`
    /// removes the entity); every event is then published on the bus.
    pub async fn process_event(&self, event: Event) {
        if event.event_type == STATE_CHANGED && event.namespace != ADMIN {
            match serde_json::from_value::<StateChangedData>(event.data.clone()) {
                Ok(data) => self.apply_plugin_change(&event.namespace, data).await,
                Err(e) => warn!(
                    namespace = %event.namespace,
                    error = %e,
                    "Malformed state_changed from plugin"
                ),
            }
        }
        self.event_bus.fire(event);
    }

    async fn apply_plugin_change(&self, namespace: &str, data: StateChangedData) {
        let applied = match self.namespaces.get_mut(namespace) {
            Some(mut ns) => {
                match data.new_state {
                    Some(state) => {
                        ns.entities.insert(data.entity_id.clone(), state);
                    }
                    None => {
                        ns.entities.shift_remove(&data.entity_id);
                    }
                }
                ns.dirty = true;
                true
            }
            None => {
                warn!(namespace, entity_id = %data.entity_id, "State change for unknown namespace");
                false
            }
        };
        if applied {
            if let Err(e) = self.flush_if_safe(namespace).await {
                warn!(namespace, error = %e, "Failed to persist namespace");
            }
        }
    }

    /// Replace a namespace's entity map with a plugin snapshot
    pub fn set_namespace_state(&self, namespace: &str, entities: NamespaceMap) {
        let count = entities.len();
        self.namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Namespace::new(Writeback::None, false))
            .entities = entities;
        debug!(namespace, entities = count, "Namespace refreshed from snapshot");
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    async fn flush_if_safe(&self, namespace: &str) -> StateResult<()> {
        let safe = self
            .namespaces
            .get(namespace)
            .map(|ns| ns.writeback == Writeback::Safe)
            .unwrap_or(false);
        if safe {
            self.save_namespace(namespace).await?;
        }
        Ok(())
    }

    /// Write one persistent namespace to disk
    pub async fn save_namespace(&self, namespace: &str) -> StateResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let snapshot = match self.namespaces.get_mut(namespace) {
            Some(mut ns) if ns.writeback.is_persistent() => {
                ns.dirty = false;
                ns.entities.clone()
            }
            _ => return Ok(()),
        };
        storage.save(namespace, &snapshot).await?;
        Ok(())
    }

    /// Checkpoint every dirty `hybrid` namespace
    pub async fn save_hybrid_namespaces(&self) {
        let dirty: Vec<String> = self
            .namespaces
            .iter()
            .filter(|ns| ns.writeback == Writeback::Hybrid && ns.dirty)
            .map(|ns| ns.key().clone())
            .collect();
        for namespace in dirty {
            if let Err(e) = self.save_namespace(&namespace).await {
                warn!(namespace = %namespace, error = %e, "Failed to checkpoint namespace");
            }
        }
    }

    /// Flush every persistent namespace (shutdown)
    pub async fn save_all(&self) {
        let persistent: Vec<String> = self
            .namespaces
            .iter()
            .filter(|ns| ns.writeback.is_persistent())
            .map(|ns| ns.key().clone())
            .collect();
        for namespace in persistent {
            if let Err(e) = self.save_namespace(&namespace).await {
                warn!(namespace = %namespace, error = %e, "Failed to save namespace");
            }
        }
    }

    fn fire_admin<T>(&self, event_type: &str, data: T)
    where
        T: serde::Serialize,
    {
        let event = Event::new(
            ADMIN,
            event_type,
            serde_json::to_value(data).unwrap_or_default(),
        )
        .at(self.clock.now());
        self.event_bus.fire(event);
    }
}

fn map_to_value<'a>(entries: impl Iterator<Item = (&'a String, &'a EntityState)>) -> Value {
    Value::Object(
        entries
            .map(|(id, state)| (id.clone(), state.to_value()))
            .collect::<Map<String, Value>>(),
    )
}

/// Thread-safe wrapper for StateStore
pub type SharedStateStore = Arc<StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use ad_clock::VirtualClock;
    use ad_core::{LastChanged, DEFAULT};
    use ad_plugin::{MemoryPlugin, Plugin};
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        store: StateStore,
        bus: Arc<EventBus>,
        clock: VirtualClock,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let clock = VirtualClock::at(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let store = StateStore::new(
            bus.clone(),
            Arc::new(PluginManager::new()),
            Arc::new(clock.clone()),
        );
        store.init_namespace(DEFAULT, Writeback::None).await.unwrap();
        store.init_namespace(ADMIN, Writeback::None).await.unwrap();
        Fixture { store, bus, clock }
    }

    #[tokio::test]
    async fn test_add_entity_roundtrips_and_is_never_changed() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe(ENTITY_ADDED);
        let mut attributes = IndexMap::new();
        attributes.insert("friendly_name".to_string(), json!("Hall"));

        assert!(f
            .store
            .add_entity(DEFAULT, "light.hall", json!("off"), attributes.clone())
            .await
            .unwrap());
        assert!(!f
            .store
            .add_entity(DEFAULT, "light.hall", json!("on"), IndexMap::new())
            .await
            .unwrap());

        let all = f
            .store
            .get_state(DEFAULT, &StateQuery::entity("light.hall").attribute("all"))
            .unwrap();
        assert_eq!(all["state"], json!("off"));
        assert_eq!(all["attributes"]["friendly_name"], json!("Hall"));
        assert_eq!(all["last_changed"], json!("never"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.namespace, ADMIN);
        assert_eq!(event.data["entity_id"], "light.hall");
    }

    #[tokio::test]
    async fn test_get_state_rules() {
        let f = fixture().await;
        f.store
            .set_state(
                DEFAULT,
                "light.hall",
                StateUpdate::state("on").with_attribute("brightness", 200),
                true,
            )
            .await
            .unwrap();
        f.store
            .set_state(DEFAULT, "light.porch", StateUpdate::state("off"), true)
            .await
            .unwrap();
        f.store
            .set_state(DEFAULT, "switch.fan", StateUpdate::state("on"), true)
            .await
            .unwrap();

        let s = &f.store;
        assert_eq!(s.get_state(DEFAULT, &StateQuery::entity("light.hall")), Some(json!("on")));
        assert_eq!(
            s.get_state(DEFAULT, &StateQuery::entity("light.hall").attribute("brightness")),
            Some(json!(200))
        );
        assert_eq!(
            s.get_state(DEFAULT, &StateQuery::entity("light.hall").attribute("last_changed")),
            Some(json!("2024-05-01T12:00:00Z"))
        );
        assert_eq!(
            s.get_state(DEFAULT, &StateQuery::entity("light.nope").or_default("gone")),
            Some(json!("gone"))
        );
        assert_eq!(s.get_state(DEFAULT, &StateQuery::entity("light.nope")), None);

        let lights = s.get_state(DEFAULT, &StateQuery::entity("light")).unwrap();
        assert_eq!(lights.as_object().unwrap().len(), 2);

        let everything = s.get_state(DEFAULT, &StateQuery::all()).unwrap();
        assert_eq!(everything.as_object().unwrap().len(), 3);

        assert_eq!(
            s.get_state("missing", &StateQuery::entity("light.hall").or_default(0)),
            Some(json!(0))
        );
    }

    #[tokio::test]
    async fn test_set_state_merges_and_always_emits() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe(STATE_CHANGED);

        f.store
            .set_state(
                DEFAULT,
                "sensor.temp",
                StateUpdate::state(20).with_attribute("unit", "C"),
                true,
            )
            .await
            .unwrap();
        f.clock.advance(Duration::milliseconds(2500));
        let second = f
            .store
            .set_state(DEFAULT, "sensor.temp", StateUpdate::state(20), true)
            .await
            .unwrap();

        assert_eq!(second.attributes["unit"], json!("C"));
        assert_eq!(
            second.last_changed,
            LastChanged::At(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 2).unwrap())
        );

        let first_event = rx.recv().await.unwrap();
        assert!(first_event.data["old_state"].is_null());
        let second_event = rx.recv().await.unwrap();
        assert_eq!(second_event.data["old_state"]["state"], json!(20));
        assert_eq!(second_event.data["new_state"]["state"], json!(20));
    }

    #[tokio::test]
    async fn test_set_state_replace() {
        let f = fixture().await;
        f.store
            .set_state(
                DEFAULT,
                "sensor.a",
                StateUpdate::state(1).with_attribute("x", 1).with_attribute("y", 2),
                true,
            )
            .await
            .unwrap();
        let state = f
            .store
            .set_state(
                DEFAULT,
                "sensor.a",
                StateUpdate::default().with_attribute("z", 3).replacing(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(state.attributes.keys().collect::<Vec<_>>(), vec!["z"]);
    }

    #[tokio::test]
    async fn test_unknown_namespace_errors() {
        let f = fixture().await;
        let err = f
            .store
            .set_state("nowhere", "light.x", StateUpdate::state("on"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NamespaceNotFound(ns) if ns == "nowhere"));
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let f = fixture().await;
        let mut added = f.bus.subscribe(NAMESPACE_ADDED);

        f.store.add_namespace("scratch", Writeback::None).await.unwrap();
        assert!(matches!(
            f.store.add_namespace("scratch", Writeback::None).await,
            Err(StateError::AlreadyExists(_))
        ));
        assert!(matches!(
            f.store.remove_namespace(DEFAULT).await,
            Err(StateError::NotAppNamespace(_))
        ));
        assert_eq!(added.recv().await.unwrap().data["namespace"], "scratch");

        f.store.remove_namespace("scratch").await.unwrap();
        assert!(!f.store.namespace_exists("scratch"));
    }

    #[tokio::test]
    async fn test_remove_entity_emits_and_delegates() {
        let bus = Arc::new(EventBus::new());
        let plugins = Arc::new(PluginManager::new());
        let plugin = Arc::new(MemoryPlugin::new(DEFAULT).with_entity("light.x", "on"));
        plugins.register(plugin.clone()).unwrap();
        let store = StateStore::new(bus.clone(), plugins, Arc::new(VirtualClock::starting_now()));
        store.init_namespace(DEFAULT, Writeback::None).await.unwrap();
        store.set_namespace_state(DEFAULT, plugin.get_state_snapshot().await.unwrap());

        let mut removed = bus.subscribe(ENTITY_REMOVED);
        assert!(store.remove_entity(DEFAULT, "light.x").await.unwrap());
        assert!(!store.entity_exists(DEFAULT, "light.x"));
        assert_eq!(removed.recv().await.unwrap().data["entity_id"], "light.x");
        assert!(plugin.get_state_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plugin_event_updates_store_before_publish() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe(STATE_CHANGED);
        let new_state = EntityState::new("binary_sensor.door".parse().unwrap(), json!("on"), IndexMap::new());

        f.store
            .process_event(Event::new(
                DEFAULT,
                STATE_CHANGED,
                json!({"entity_id": "binary_sensor.door", "old_state": null, "new_state": new_state}),
            ))
            .await;

        assert_eq!(
            f.store.get_state(DEFAULT, &StateQuery::entity("binary_sensor.door")),
            Some(json!("on"))
        );
        assert_eq!(rx.recv().await.unwrap().data["entity_id"], "binary_sensor.door");
    }

    #[tokio::test]
    async fn test_safe_namespace_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let make = || {
            StateStore::new(
                Arc::new(EventBus::new()),
                Arc::new(PluginManager::new()),
                Arc::new(VirtualClock::starting_now()),
            )
            .with_storage(NamespaceStorage::new(dir.path()))
        };

        let store = make();
        store.init_namespace("cache", Writeback::Safe).await.unwrap();
        store
            .set_state("cache", "counter.visits", StateUpdate::state(3), true)
            .await
            .unwrap();

        let reopened = make();
        reopened.init_namespace("cache", Writeback::Safe).await.unwrap();
        assert_eq!(
            reopened.get_state("cache", &StateQuery::entity("counter.visits")),
            Some(json!(3))
        );
    }

    #[tokio::test]
    async fn test_hybrid_namespace_waits_for_checkpoint() {
        let dir = TempDir::new().unwrap();
        let storage = NamespaceStorage::new(dir.path());
        let store = StateStore::new(
            Arc::new(EventBus::new()),
            Arc::new(PluginManager::new()),
            Arc::new(VirtualClock::starting_now()),
        )
        .with_storage(storage.clone());
        store.init_namespace("lazy", Writeback::Hybrid).await.unwrap();
        store
            .set_state("lazy", "sensor.a", StateUpdate::state(1), true)
            .await
            .unwrap();
        assert!(!storage.file_path("lazy").exists());

        store.save_hybrid_namespaces().await;
        assert!(storage.file_path("lazy").exists());
    }
}
