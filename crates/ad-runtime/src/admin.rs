//! Bookkeeping entities in the admin namespace

use crate::app::AppStatus;
use crate::kernel::Kernel;
use ad_callbacks::CallbackKind;
use ad_config::AllAppConfig;
use ad_core::{StateUpdate, ADMIN};
use ad_threading::SlotStatus;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub const VERSION_SENSOR: &str = "sensor.appdaemon_version";
pub const BOOTED_SENSOR: &str = "sensor.appdaemon_booted";
pub const UPTIME_SENSOR: &str = "sensor.appdaemon_uptime";
pub const ACTIVE_APPS_SENSOR: &str = "sensor.active_apps";
pub const INACTIVE_APPS_SENSOR: &str = "sensor.inactive_apps";
pub const SUN_ENTITY: &str = "sun.sun";

pub fn app_entity(name: &str) -> String {
    format!("app.{name}")
}

pub fn thread_entity(slot: usize) -> String {
    format!("thread.thread-{slot}")
}

async fn write(kernel: &Kernel, entity_id: &str, update: StateUpdate) {
    if let Err(e) = kernel.state.set_state(ADMIN, entity_id, update, true).await {
        // App names are free-form and may not make valid entity ids
        debug!(entity_id, error = %e, "Unable to update admin entity");
    }
}

fn timestamp(kernel: &Kernel, t: DateTime<Utc>) -> String {
    t.with_timezone(&kernel.tz).to_rfc3339()
}

/// Seed the runtime sensors at startup
pub async fn init_entities(kernel: &Kernel) {
    write(kernel, VERSION_SENSOR, StateUpdate::state(env!("CARGO_PKG_VERSION"))).await;
    write(
        kernel,
        BOOTED_SENSOR,
        StateUpdate::state(timestamp(kernel, kernel.booted)),
    )
    .await;
    update_uptime(kernel).await;
    write(kernel, ACTIVE_APPS_SENSOR, StateUpdate::state(0)).await;
    write(kernel, INACTIVE_APPS_SENSOR, StateUpdate::state(0)).await;
}

/// Mirror one app's lifecycle state with its registration totals
pub async fn write_app_status(kernel: &Kernel, name: &str, status: AppStatus) {
    let callbacks = &kernel.callbacks;
    let update = StateUpdate::state(status.as_str())
        .with_attribute("state_callbacks", callbacks.count(Some(name), Some(CallbackKind::State)))
        .with_attribute("event_callbacks", callbacks.count(Some(name), Some(CallbackKind::Event)))
        .with_attribute("log_callbacks", callbacks.count(Some(name), Some(CallbackKind::Log)))
        .with_attribute("timers", kernel.scheduler.entries(Some(name)).len());
    write(kernel, &app_entity(name), update).await;
}

pub async fn remove_app_entity(kernel: &Kernel, name: &str) {
    let entity_id = app_entity(name);
    if let Err(e) = kernel.state.remove_entity(ADMIN, &entity_id).await {
        debug!(entity_id = %entity_id, error = %e, "Unable to remove app entity");
    }
}

/// Recount active and inactive apps
pub async fn update_app_sensors(
    kernel: &Kernel,
    config: &AllAppConfig,
    statuses: &BTreeMap<String, AppStatus>,
) {
    let mut active = Vec::new();
    let mut inactive = Vec::new();
    for name in config.apps.keys() {
        match statuses.get(name) {
            Some(AppStatus::Running) => active.push(name.clone()),
            _ => inactive.push(name.clone()),
        }
    }
    write(
        kernel,
        ACTIVE_APPS_SENSOR,
        StateUpdate::state(active.len()).with_attribute("apps", active),
    )
    .await;
    write(
        kernel,
        INACTIVE_APPS_SENSOR,
        StateUpdate::state(inactive.len()).with_attribute("apps", inactive),
    )
    .await;
}

pub async fn update_uptime(kernel: &Kernel) {
    let uptime = (kernel.now() - kernel.booted).num_seconds().max(0);
    write(kernel, UPTIME_SENSOR, StateUpdate::state(uptime)).await;
}

/// `sun.sun` with the upcoming transitions
pub async fn update_sun(kernel: &Kernel, up: bool) {
    let now = kernel.now();
    let sun = kernel.scheduler.sun();
    let mut update = StateUpdate::state(if up { "above_horizon" } else { "below_horizon" });
    match sun.next_rising(now) {
        Ok(t) => update = update.with_attribute("next_rising", timestamp(kernel, t)),
        Err(e) => debug!(error = %e, "No next sunrise"),
    }
    match sun.next_setting(now) {
        Ok(t) => update = update.with_attribute("next_setting", timestamp(kernel, t)),
        Err(e) => debug!(error = %e, "No next sunset"),
    }
    write(kernel, SUN_ENTITY, update).await;
}

/// Tracks slot state so `thread.*` entities are only rewritten on change
#[derive(Debug, Default)]
pub struct ThreadEntities {
    last: BTreeMap<usize, SlotStatus>,
}

impl ThreadEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&mut self, kernel: &Kernel) {
        for slot in kernel.pool.status() {
            if self.last.get(&slot.id) == Some(&slot) {
                continue;
            }
            trace!(slot = slot.id, q = slot.q, callback = %slot.callback, "Thread changed");
            let update = StateUpdate::state(slot.callback.clone())
                .with_attribute("q", slot.q)
                .with_attribute("callback", slot.callback.clone())
                .with_attribute(
                    "last_callback",
                    slot.last_callback.clone().map_or(Value::Null, Value::from),
                );
            write(kernel, &thread_entity(slot.id), update).await;
            self.last.insert(slot.id, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_names() {
        assert_eq!(app_entity("hall_lights"), "app.hall_lights");
        assert_eq!(thread_entity(3), "thread.thread-3");
        assert!(ad_core::EntityId::is_valid(&thread_entity(0)));
        assert!(ad_core::EntityId::is_valid(&app_entity("hall_lights")));
    }
}
