//! Service registry with async handlers
//!
//! Services are keyed by `(namespace, domain, service)`. A handler registered
//! in the `global` namespace answers for every namespace that has no more
//! specific handler. When nothing local matches, the call is forwarded to
//! the namespace's plugin.

use ad_core::GLOBAL;
use ad_plugin::{PluginError, PluginManager};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Result type for service calls
pub type ServiceResult = Result<Option<serde_json::Value>, ServiceError>;

/// Future type for async service handlers
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

/// Service handler function type
pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

/// Errors that can occur when working with services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service not found: {namespace}/{domain}/{service}")]
    NotFound {
        namespace: String,
        domain: String,
        service: String,
    },

    #[error("service {domain}/{service} is already registered to app '{owner}'")]
    AlreadyRegistered {
        domain: String,
        service: String,
        owner: String,
    },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

/// A single invocation of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub namespace: String,
    pub domain: String,
    pub service: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub domain: String,
    pub service: String,
}

impl ServiceKey {
    fn new(namespace: &str, domain: &str, service: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            domain: domain.to_string(),
            service: service.to_string(),
        }
    }
}

struct RegisteredService {
    handler: ServiceHandler,
    /// App that registered the service; `None` for built-ins
    owner: Option<String>,
}

/// The service registry manages all registered services
pub struct ServiceRegistry {
    services: DashMap<ServiceKey, RegisteredService>,
    plugins: Arc<PluginManager>,
}

impl ServiceRegistry {
    pub fn new(plugins: Arc<PluginManager>) -> Self {
        Self {
            services: DashMap::new(),
            plugins,
        }
    }

    /// Register a built-in service
    pub fn register<F, Fut>(&self, namespace: &str, domain: &str, service: &str, handler: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);
        debug!(namespace, domain, service, "Registering service");
        self.services.insert(
            ServiceKey::new(namespace, domain, service),
            RegisteredService {
                handler,
                owner: None,
            },
        );
    }

    /// Register a service owned by an app
    ///
    /// A service already owned by a different app is left alone.
    #[instrument(skip(self, handler))]
    pub fn register_for_app(
        &self,
        app: &str,
        namespace: &str,
        domain: &str,
        service: &str,
        handler: ServiceHandler,
    ) -> Result<(), ServiceError> {
        let key = ServiceKey::new(namespace, domain, service);
        if let Some(existing) = self.services.get(&key) {
            if let Some(owner) = existing.owner.as_deref() {
                if owner != app {
                    return Err(ServiceError::AlreadyRegistered {
                        domain: domain.to_string(),
                        service: service.to_string(),
                        owner: owner.to_string(),
                    });
                }
            }
        }
        self.services.insert(
            key,
            RegisteredService {
                handler,
                owner: Some(app.to_string()),
            },
        );
        Ok(())
    }

    /// Call a service
    ///
    /// Lookup order: exact namespace, then `global`, then the namespace's plugin.
    #[instrument(skip(self, data))]
    pub async fn call(
        &self,
        namespace: &str,
        domain: &str,
        service: &str,
        data: serde_json::Value,
    ) -> ServiceResult {
        let handler = self
            .services
            .get(&ServiceKey::new(namespace, domain, service))
            .or_else(|| self.services.get(&ServiceKey::new(GLOBAL, domain, service)))
            .map(|s| s.handler.clone());

        let call = ServiceCall {
            namespace: namespace.to_string(),
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        };

        if let Some(handler) = handler {
            debug!("Calling local service");
            return handler(call).await;
        }

        match self.plugins.get(namespace) {
            Some(plugin) => {
                debug!("Forwarding service call to plugin");
                Ok(plugin
                    .call_service(namespace, domain, service, call.data)
                    .await?)
            }
            None => {
                warn!("Service not found");
                Err(ServiceError::NotFound {
                    namespace: namespace.to_string(),
                    domain: domain.to_string(),
                    service: service.to_string(),
                })
            }
        }
    }

    /// Check if a local service exists for a namespace (including `global` ones)
    pub fn has_service(&self, namespace: &str, domain: &str, service: &str) -> bool {
        self.services
            .contains_key(&ServiceKey::new(namespace, domain, service))
            || self
                .services
                .contains_key(&ServiceKey::new(GLOBAL, domain, service))
    }

    /// List services visible in `namespace` (`global` lists everything)
    pub fn list_services(&self, namespace: &str) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .services
            .iter()
            .map(|s| s.key().clone())
            .filter(|k| namespace == GLOBAL || k.namespace == namespace || k.namespace == GLOBAL)
            .collect();
        keys.sort();
        keys
    }

    /// Services registered by one app
    pub fn app_services(&self, app: &str) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self
            .services
            .iter()
            .filter(|s| s.owner.as_deref() == Some(app))
            .map(|s| s.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Unregister a service
    pub fn unregister(&self, namespace: &str, domain: &str, service: &str) -> bool {
        self.services
            .remove(&ServiceKey::new(namespace, domain, service))
            .is_some()
    }

    /// Drop every service an app registered (app termination)
    #[instrument(skip(self))]
    pub fn clear_app(&self, app: &str) -> usize {
        let keys = self.app_services(app);
        let count = keys.len();
        for key in keys {
            self.services.remove(&key);
        }
        if count > 0 {
            debug!(count, "Cleared app services");
        }
        count
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Thread-safe wrapper for ServiceRegistry
pub type SharedServiceRegistry = Arc<ServiceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use ad_plugin::MemoryPlugin;
    use serde_json::json;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(Arc::new(PluginManager::new()))
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let registry = registry();
        registry.register("default", "test", "echo", |call: ServiceCall| async move {
            Ok(Some(call.data))
        });

        let result = registry
            .call("default", "test", "echo", json!({"msg": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"msg": "hello"})));
    }

    #[tokio::test]
    async fn test_global_handler_answers_every_namespace() {
        let registry = registry();
        registry.register(GLOBAL, "event", "fire", |call: ServiceCall| async move {
            Ok(Some(json!(call.namespace)))
        });

        let result = registry
            .call("mqtt", "event", "fire", json!({}))
            .await
            .unwrap();
        assert_eq!(result, Some(json!("mqtt")));
        assert!(registry.has_service("anything", "event", "fire"));
    }

    #[tokio::test]
    async fn test_falls_back_to_plugin() {
        let plugins = Arc::new(PluginManager::new());
        let plugin = Arc::new(MemoryPlugin::new("default"));
        plugins.register(plugin.clone()).unwrap();
        let registry = ServiceRegistry::new(plugins);

        registry
            .call("default", "notify", "mobile", json!({"message": "hi"}))
            .await
            .unwrap();

        let calls = plugin.service_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].domain, "notify");
    }

    #[tokio::test]
    async fn test_not_found() {
        let registry = registry();
        let err = registry
            .call("default", "nope", "nothing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[test]
    fn test_app_ownership_and_clear() {
        let registry = registry();
        let handler: ServiceHandler = Arc::new(|_| Box::pin(async { Ok(None) }) as ServiceFuture);

        registry
            .register_for_app("app_a", "default", "custom", "go", handler.clone())
            .unwrap();
        let err = registry
            .register_for_app("app_b", "default", "custom", "go", handler)
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRegistered { owner, .. } if owner == "app_a"));

        assert_eq!(registry.app_services("app_a").len(), 1);
        assert_eq!(registry.clear_app("app_a"), 1);
        assert_eq!(registry.service_count(), 0);
    }
}
