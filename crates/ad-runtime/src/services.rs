//! Built-in `state`, `event` and `app` services
//!
//! Registered in `global`, so they answer in every namespace; the namespace
//! of the call is the one acted on.

use crate::app_management::AppManagement;
use crate::kernel::Kernel;
use ad_core::{Event, StateUpdate, GLOBAL};
use ad_service_registry::{ServiceCall, ServiceError, ServiceResult};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::{error, info};

fn upgrade<T>(weak: &Weak<T>) -> Result<Arc<T>, ServiceError> {
    weak.upgrade()
        .ok_or_else(|| ServiceError::CallFailed("runtime is shutting down".into()))
}

fn data_map(call: &ServiceCall) -> Result<Map<String, Value>, ServiceError> {
    match &call.data {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        other => Err(ServiceError::InvalidData(format!(
            "expected an object, got {other}"
        ))),
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Result<String, ServiceError> {
    match map.remove(key) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(ServiceError::InvalidData(format!("{key} is required"))),
    }
}

fn state_err(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::CallFailed(e.to_string())
}

fn register_kernel<F, Fut>(kernel: &Arc<Kernel>, domain: &str, service: &str, f: F)
where
    F: Fn(Arc<Kernel>, ServiceCall) -> Fut + Send + Sync + Copy + 'static,
    Fut: Future<Output = ServiceResult> + Send + 'static,
{
    let weak = Arc::downgrade(kernel);
    kernel.services.register(GLOBAL, domain, service, move |call| {
        let weak = weak.clone();
        async move { f(upgrade(&weak)?, call).await }
    });
}

/// Register every built-in service
pub fn register(kernel: &Arc<Kernel>, apps: &Arc<AppManagement>) {
    register_kernel(kernel, "state", "set", set_state);
    register_kernel(kernel, "state", "add_entity", add_entity);
    register_kernel(kernel, "state", "remove_entity", remove_entity);
    register_kernel(kernel, "event", "fire", fire_event);

    for action in [AppAction::Start, AppAction::Stop, AppAction::Restart, AppAction::Reload] {
        let weak = Arc::downgrade(apps);
        kernel
            .services
            .register(GLOBAL, "app", action.service(), move |call| {
                let weak = weak.clone();
                async move { app_service(weak, action, call) }
            });
    }
}

async fn set_state(kernel: Arc<Kernel>, call: ServiceCall) -> ServiceResult {
    let mut data = data_map(&call)?;
    let entity_id = take_string(&mut data, "entity_id")?;
    let update: StateUpdate = serde_json::from_value(Value::Object(data))
        .map_err(|e| ServiceError::InvalidData(e.to_string()))?;
    let state = kernel
        .state
        .set_state(&call.namespace, &entity_id, update, false)
        .await
        .map_err(state_err)?;
    Ok(Some(state.to_value()))
}

async fn add_entity(kernel: Arc<Kernel>, call: ServiceCall) -> ServiceResult {
    let mut data = data_map(&call)?;
    let entity_id = take_string(&mut data, "entity_id")?;
    let state = data.remove("state").unwrap_or(Value::Null);
    let attributes: IndexMap<String, Value> = match data.remove("attributes") {
        Some(Value::Object(map)) => map.into_iter().collect(),
        Some(_) => return Err(ServiceError::InvalidData("attributes must be a mapping".into())),
        None => IndexMap::new(),
    };
    let added = kernel
        .state
        .add_entity(&call.namespace, &entity_id, state, attributes)
        .await
        .map_err(state_err)?;
    Ok(Some(Value::Bool(added)))
}

async fn remove_entity(kernel: Arc<Kernel>, call: ServiceCall) -> ServiceResult {
    let mut data = data_map(&call)?;
    let entity_id = take_string(&mut data, "entity_id")?;
    let removed = kernel
        .state
        .remove_entity(&call.namespace, &entity_id)
        .await
        .map_err(state_err)?;
    Ok(Some(Value::Bool(removed)))
}

async fn fire_event(kernel: Arc<Kernel>, call: ServiceCall) -> ServiceResult {
    let mut data = data_map(&call)?;
    let event_type = take_string(&mut data, "event")?;
    kernel
        .bus
        .fire(Event::new(call.namespace.as_str(), event_type.as_str(), Value::Object(data)).at(kernel.now()));
    Ok(None)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppAction {
    Start,
    Stop,
    Restart,
    Reload,
}

impl AppAction {
    fn service(self) -> &'static str {
        match self {
            AppAction::Start => "start",
            AppAction::Stop => "stop",
            AppAction::Restart => "restart",
            AppAction::Reload => "reload",
        }
    }
}

/// Queue an app lifecycle action
///
/// Runs detached: the caller may be the very app being stopped, and its
/// terminate would otherwise wait on its own slot.
fn app_service(weak: Weak<AppManagement>, action: AppAction, call: ServiceCall) -> ServiceResult {
    let apps = upgrade(&weak)?;
    let name = if action == AppAction::Reload {
        String::new()
    } else {
        let mut data = data_map(&call)?;
        take_string(&mut data, "app")?
    };
    info!(service = action.service(), app = %name, "App service called");
    tokio::spawn(async move {
        let result = match action {
            AppAction::Start => apps.start_app(&name).await,
            AppAction::Stop => apps.stop_app(&name).await.map(|_| ()),
            AppAction::Restart => apps.restart_app(&name).await,
            AppAction::Reload => apps.reload_apps().await.map(|_| ()),
        };
        if let Err(e) = result {
            error!(service = action.service(), app = %name, error = %e, "App service failed");
        }
    });
    Ok(None)
}
