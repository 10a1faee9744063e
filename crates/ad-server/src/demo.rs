//! Apps compiled into the binary
//!
//! Referenced from `apps.yaml` as `module: hello, class: HelloWorld` and
//! `module: motion, class: MotionLights`.

use ad_runtime::{Adapi, App, AppRegistry, Callback, StateArgs, StateOptions, TimerArgs, TimerOptions};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

pub fn registry() -> AppRegistry {
    AppRegistry::new()
        .with("hello", "HelloWorld", |api| Ok(Arc::new(HelloWorld { api }) as Arc<dyn App>))
        .with("motion", "MotionLights", |api| {
            Ok(Arc::new(MotionLights::new(api)?) as Arc<dyn App>)
        })
}

/// Says hello and reports the sun times
pub struct HelloWorld {
    api: Adapi,
}

#[async_trait]
impl App for HelloWorld {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.api.log("Hello from the automation runtime");
        let rising = self.api.sunrise()?;
        let setting = self.api.sunset()?;
        let tz = self.api.time_zone();
        self.api.log(&format!(
            "Next sunrise {}, next sunset {}",
            rising.with_timezone(&tz),
            setting.with_timezone(&tz)
        ));
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.api.log("Goodbye");
        Ok(())
    }
}

/// Turns a light on while a motion sensor reports activity
///
/// Args: `sensor`, `light`, and `delay` (seconds the light stays on after
/// the last trigger, default 60).
pub struct MotionLights {
    api: Adapi,
    sensor: String,
    light: String,
    delay: f64,
}

impl MotionLights {
    fn new(api: Adapi) -> anyhow::Result<Self> {
        let text = |key: &str| -> anyhow::Result<String> {
            api.arg(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("missing '{key}' argument"))
        };
        let sensor = text("sensor")?;
        let light = text("light")?;
        let delay = api.arg("delay").and_then(|v| v.as_f64()).unwrap_or(60.0);
        Ok(Self {
            sensor,
            light,
            delay,
            api,
        })
    }
}

#[async_trait]
impl App for MotionLights {
    async fn initialize(&self) -> anyhow::Result<()> {
        let api = self.api.clone();
        let light = self.light.clone();
        let delay = self.delay;
        let off_timer: Arc<Mutex<Option<String>>> = Arc::default();

        self.api.listen_state(
            Some(&self.sensor),
            StateOptions::new().new_state("on"),
            Callback::from_async(move |args: StateArgs| {
                let api = api.clone();
                let light = light.clone();
                let off_timer = off_timer.clone();
                async move {
                    api.log(&format!("Motion on {}, turning on {light}", args.entity_id));
                    api.call_service("light/turn_on", json!({ "entity_id": light }))
                        .await?;

                    let previous = off_timer
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(handle) = previous {
                        api.cancel_timer(&handle)?;
                    }
                    let off_api = api.clone();
                    let off_light = light.clone();
                    let handle = api.run_in(
                        Callback::from_async(move |_: TimerArgs| {
                            let api = off_api.clone();
                            let light = off_light.clone();
                            async move {
                                api.call_service("light/turn_off", json!({ "entity_id": light }))
                                    .await?;
                                Ok(())
                            }
                        }),
                        delay,
                        TimerOptions::new(),
                    )?;
                    *off_timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                    Ok(())
                }
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_knows_demo_modules() {
        let registry = registry();
        assert!(registry.has_module("hello"));
        assert!(registry.has_module("motion"));
        assert_eq!(registry.len(), 2);
    }
}
