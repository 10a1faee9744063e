//! Plugin registration and lifecycle

use crate::{Plugin, PluginError, PluginResult};
use ad_clock::{SharedClock, SystemClock};
use ad_core::events::{PLUGIN_STARTED, PLUGIN_STOPPED};
use ad_core::{Event, NamespaceMap, ADMIN};
use dashmap::DashMap;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

/// Receiving half of the plugin event channel
pub type PluginEvents = mpsc::UnboundedReceiver<Event>;

/// Maps namespaces to their plugins and owns the inbound event channel
pub struct PluginManager {
    plugins: DashMap<String, Arc<dyn Plugin>>,
    running: DashMap<String, bool>,
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<PluginEvents>>,
    clock: SharedClock,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Lifecycle announcements are stamped from `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            plugins: DashMap::new(),
            running: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            clock,
        }
    }

    /// Register a plugin for its namespace
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        let namespace = plugin.meta().namespace;
        if self.plugins.contains_key(&namespace) {
            return Err(PluginError::AlreadyRegistered(namespace));
        }
        info!(namespace = %namespace, plugin_type = %plugin.meta().plugin_type, "Registered plugin");
        self.running.insert(namespace.clone(), false);
        self.plugins.insert(namespace, plugin);
        Ok(())
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(namespace).map(|p| p.value().clone())
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_running(&self, namespace: &str) -> bool {
        self.running.get(namespace).map(|r| *r).unwrap_or(false)
    }

    /// Take the receiving half of the event channel (once)
    pub fn take_events(&self) -> Option<PluginEvents> {
        self.rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// A sender plugins (and tests) can use to inject backend events
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    /// Start one plugin and announce it on `admin`
    #[instrument(skip(self))]
    pub async fn start(&self, namespace: &str) -> PluginResult<()> {
        let plugin = self
            .get(namespace)
            .ok_or_else(|| PluginError::NotFound(namespace.to_string()))?;
        plugin.start(self.tx.clone()).await?;
        self.running.insert(namespace.to_string(), true);
        self.announce(PLUGIN_STARTED, namespace, &plugin.meta().plugin_type);
        Ok(())
    }

    /// Start every plugin; failures are logged and do not stop the others
    pub async fn start_all(&self) {
        for namespace in self.namespaces() {
            if let Err(e) = self.start(&namespace).await {
                error!(namespace = %namespace, error = %e, "Plugin failed to start");
            }
        }
    }

    /// Stop one plugin and announce it on `admin`
    #[instrument(skip(self))]
    pub async fn stop(&self, namespace: &str) -> PluginResult<()> {
        let plugin = self
            .get(namespace)
            .ok_or_else(|| PluginError::NotFound(namespace.to_string()))?;
        plugin.stop().await?;
        self.running.insert(namespace.to_string(), false);
        self.announce(PLUGIN_STOPPED, namespace, &plugin.meta().plugin_type);
        Ok(())
    }

    pub async fn stop_all(&self) {
        for namespace in self.namespaces() {
            if !self.is_running(&namespace) {
                continue;
            }
            if let Err(e) = self.stop(&namespace).await {
                warn!(namespace = %namespace, error = %e, "Plugin failed to stop cleanly");
            }
        }
    }

    /// Pull the full entity map for a namespace from its plugin
    pub async fn snapshot(&self, namespace: &str) -> PluginResult<NamespaceMap> {
        let plugin = self
            .get(namespace)
            .ok_or_else(|| PluginError::NotFound(namespace.to_string()))?;
        plugin.get_state_snapshot().await
    }

    /// Run every running plugin's periodic housekeeping
    pub async fn utility(&self) {
        for namespace in self.namespaces() {
            if !self.is_running(&namespace) {
                continue;
            }
            if let Some(plugin) = self.get(&namespace) {
                if let Err(e) = plugin.utility().await {
                    warn!(namespace = %namespace, error = %e, "Plugin utility failed");
                }
            }
        }
    }

    fn announce(&self, event_type: &str, namespace: &str, plugin_type: &str) {
        let event = Event::new(
            ADMIN,
            event_type,
            json!({"name": namespace, "namespace": namespace, "type": plugin_type}),
        )
        .at(self.clock.now());
        let _ = self.tx.send(event);
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for PluginManager
pub type SharedPluginManager = Arc<PluginManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryPlugin;

    #[tokio::test]
    async fn test_register_and_start_announces() {
        let manager = PluginManager::new();
        let mut events = manager.take_events().unwrap();
        manager
            .register(Arc::new(MemoryPlugin::new("default")))
            .unwrap();

        manager.start_all().await;
        assert!(manager.is_running("default"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type.as_str(), PLUGIN_STARTED);
        assert_eq!(event.namespace, ADMIN);
        assert_eq!(event.data["namespace"], "default");
    }

    #[test]
    fn test_duplicate_namespace_rejected() {
        let manager = PluginManager::new();
        manager
            .register(Arc::new(MemoryPlugin::new("default")))
            .unwrap();
        let err = manager
            .register(Arc::new(MemoryPlugin::new("default")))
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(ns) if ns == "default"));
    }

    #[test]
    fn test_events_taken_once() {
        let manager = PluginManager::new();
        assert!(manager.take_events().is_some());
        assert!(manager.take_events().is_none());
    }
}
