//! The app contract and the static registry of app classes
//!
//! Apps are compiled in. A config entry's `module` and `class` pick a
//! factory from the [`AppRegistry`]; reloading an app means calling the
//! factory again and swapping in the new object.

use crate::error::{AppError, AppResult};
use crate::Adapi;
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Lets callers recover the concrete type behind an `Arc<dyn App>`
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A user app
///
/// `initialize` runs on the app's worker slot once its dependencies are up;
/// callbacks should be registered there. `terminate` runs before the app is
/// torn down for a reload or shutdown.
#[async_trait]
pub trait App: AsAny {
    async fn initialize(&self) -> anyhow::Result<()>;

    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Downcast a running app to its concrete type
pub fn downcast_app<T: App>(app: Arc<dyn App>) -> Option<Arc<T>> {
    app.into_any_arc().downcast::<T>().ok()
}

/// Builds an app object from its API handle
pub type AppFactory = Arc<dyn Fn(Adapi) -> anyhow::Result<Arc<dyn App>> + Send + Sync>;

/// `(module, class)` to factory
#[derive(Clone, Default)]
pub struct AppRegistry {
    factories: BTreeMap<(String, String), AppFactory>,
}

impl fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module: &str, class: &str, factory: F)
    where
        F: Fn(Adapi) -> anyhow::Result<Arc<dyn App>> + Send + Sync + 'static,
    {
        self.factories
            .insert((module.to_string(), class.to_string()), Arc::new(factory));
    }

    /// Builder form of [`AppRegistry::register`]
    pub fn with<F>(mut self, module: &str, class: &str, factory: F) -> Self
    where
        F: Fn(Adapi) -> anyhow::Result<Arc<dyn App>> + Send + Sync + 'static,
    {
        self.register(module, class, factory);
        self
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.factories.keys().any(|(m, _)| m == module)
    }

    pub fn modules(&self) -> BTreeSet<String> {
        self.factories.keys().map(|(m, _)| m.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiate `class` from `module`
    pub fn create(&self, module: &str, class: &str, api: Adapi) -> AppResult<Arc<dyn App>> {
        let factory = match self.factories.get(&(module.to_string(), class.to_string())) {
            Some(factory) => factory,
            None if self.has_module(module) => {
                return Err(AppError::ClassNotFound {
                    module: module.to_string(),
                    class: class.to_string(),
                })
            }
            None => return Err(AppError::ModuleNotFound(module.to_string())),
        };
        factory(api).map_err(|e| AppError::ClassSignature {
            module: module.to_string(),
            class: class.to_string(),
            reason: format!("{e:#}"),
        })
    }
}

/// Lifecycle state of a configured app, mirrored into `app.<name>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Idle,
    Initializing,
    Running,
    Failed,
    Terminated,
}

impl AppStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Idle => "idle",
            AppStatus::Initializing => "initializing",
            AppStatus::Running => "running",
            AppStatus::Failed => "failed",
            AppStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl App for Noop {
        async fn initialize(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> AppRegistry {
        AppRegistry::new()
            .with("lights", "Hall", |_| Ok(Arc::new(Noop) as Arc<dyn App>))
            .with("broken", "Bad", |_| anyhow::bail!("missing argument 'room'"))
    }

    #[test]
    fn test_registry_lookup() {
        let reg = registry();
        assert!(reg.has_module("lights"));
        assert!(!reg.has_module("garden"));
        assert_eq!(reg.len(), 2);
        assert_eq!(
            reg.modules(),
            BTreeSet::from(["broken".to_string(), "lights".to_string()])
        );
    }

    #[test]
    fn test_downcast() {
        let app: Arc<dyn App> = Arc::new(Noop);
        assert!(downcast_app::<Noop>(app).is_some());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AppStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_value(AppStatus::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }
}
