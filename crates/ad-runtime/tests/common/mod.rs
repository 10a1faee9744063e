//! Test runtime on a virtual clock
//!
//! Builds an isolated runtime in a temp config directory with a memory
//! plugin in `default`, plus a probe app type that records what happens to
//! it.

#![allow(dead_code)]

use ad_clock::{SharedClock, VirtualClock};
use ad_core::events::STATE_CHANGED;
use ad_core::{Event, StateUpdate, ADMIN};
use ad_event_bus::EventListener;
use ad_plugin::{MemoryPlugin, Plugin, PluginManager};
use ad_runtime::{Adapi, App, AppDaemon, AppDaemonConfig, AppRegistry, AppStatus, StateQuery};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// 10:00 local time in London, mid June
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, 9, 0, 0).unwrap()
}

/// Shared log of what probe apps saw
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.count(entry) > 0
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

type Setup = Arc<dyn Fn(&Adapi, &Recorder) -> anyhow::Result<()> + Send + Sync>;

/// App that records its lifecycle and runs `setup` in `initialize`
pub struct Probe {
    pub api: Adapi,
    recorder: Recorder,
    setup: Setup,
}

#[async_trait]
impl App for Probe {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.recorder.push(format!("init:{}", self.api.name()));
        (self.setup)(&self.api, &self.recorder)
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.recorder.push(format!("term:{}", self.api.name()));
        Ok(())
    }
}

/// Factory for a [`Probe`]
pub fn probe<F>(
    recorder: &Recorder,
    setup: F,
) -> impl Fn(Adapi) -> anyhow::Result<Arc<dyn App>> + Send + Sync + 'static
where
    F: Fn(&Adapi, &Recorder) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let recorder = recorder.clone();
    let setup: Setup = Arc::new(setup);
    move |api| {
        Ok(Arc::new(Probe {
            api,
            recorder: recorder.clone(),
            setup: setup.clone(),
        }) as Arc<dyn App>)
    }
}

/// Keeps every bus event for assertions
#[derive(Default)]
pub struct Captured(Mutex<Vec<Event>>);

impl EventListener for Captured {
    fn on_event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }
}

impl Captured {
    pub fn of_type(&self, event_type: &str) -> Vec<Event> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

pub struct Builder {
    apps_yaml: String,
    extra: String,
    entities: Vec<(String, String)>,
    modules: Vec<(String, String)>,
    registry: AppRegistry,
}

impl Builder {
    /// Contents of `apps/apps.yaml`
    pub fn apps(mut self, yaml: &str) -> Self {
        self.apps_yaml = yaml.to_string();
        self
    }

    /// Extra `appdaemon:` keys, one per line without indentation
    pub fn config(mut self, lines: &str) -> Self {
        for line in lines.lines().filter(|l| !l.trim().is_empty()) {
            self.extra.push_str("  ");
            self.extra.push_str(line);
            self.extra.push('\n');
        }
        self
    }

    pub fn entity(mut self, entity_id: &str, state: &str) -> Self {
        self.entities.push((entity_id.to_string(), state.to_string()));
        self
    }

    /// A module source file under `apps/`
    pub fn module(mut self, name: &str, source: &str) -> Self {
        self.modules.push((name.to_string(), source.to_string()));
        self
    }

    pub fn registry(mut self, registry: AppRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn start(self) -> TestAppDaemon {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("apps");
        fs::create_dir_all(&app_dir).unwrap();
        fs::write(app_dir.join("apps.yaml"), &self.apps_yaml).unwrap();
        for (name, source) in &self.modules {
            fs::write(app_dir.join(format!("{name}.py")), source).unwrap();
        }

        let yaml = format!(
            "appdaemon:\n  latitude: 51.5\n  longitude: -0.12\n  elevation: 10\n  time_zone: Europe/London\n  total_threads: 2\n{}",
            self.extra
        );
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let path = dir.path().join("appdaemon.yaml");
        let mut config = AppDaemonConfig::from_value(value, &path).unwrap();
        config.config_dir = dir.path().to_path_buf();
        config.validate().unwrap();

        let clock = Arc::new(VirtualClock::at(start_time()));
        let shared: SharedClock = clock.clone();

        let mut plugin = MemoryPlugin::new("default").with_clock(shared.clone());
        for (entity_id, state) in &self.entities {
            plugin = plugin.with_entity(entity_id, state.as_str());
        }
        let plugin = Arc::new(plugin);
        let plugins = Arc::new(PluginManager::with_clock(shared));
        plugins.register(plugin.clone() as Arc<dyn Plugin>).unwrap();

        let ad = AppDaemon::with_parts(config, self.registry, clock.clone() as SharedClock, plugins)
            .await
            .unwrap();

        let captured = Arc::new(Captured::default());
        let listener: Arc<dyn EventListener> = captured.clone();
        ad.kernel().bus.add_listener(&listener);

        ad.start().await.unwrap();
        let test = TestAppDaemon {
            dir,
            app_dir,
            clock,
            plugin,
            ad,
            captured,
            _listener: listener,
            bump: Mutex::new(0),
        };
        test.settle().await;
        test
    }
}

pub struct TestAppDaemon {
    pub dir: TempDir,
    pub app_dir: PathBuf,
    pub clock: Arc<VirtualClock>,
    pub plugin: Arc<MemoryPlugin>,
    pub ad: AppDaemon,
    pub captured: Arc<Captured>,
    _listener: Arc<dyn EventListener>,
    bump: Mutex<u64>,
}

impl TestAppDaemon {
    pub fn builder() -> Builder {
        Builder {
            apps_yaml: String::new(),
            extra: String::new(),
            entities: Vec::new(),
            modules: Vec::new(),
            registry: AppRegistry::new(),
        }
    }

    /// Wait for plugin events to be pumped and every slot to go idle
    pub async fn settle(&self) {
        let pool = &self.ad.kernel().pool;
        let mut quiet = 0;
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let busy = pool.total_queued() > 0 || pool.status().iter().any(|s| s.callback != "idle");
            if busy {
                quiet = 0;
            } else {
                quiet += 1;
                if quiet >= 3 {
                    return;
                }
            }
        }
        panic!("runtime did not settle");
    }

    /// Poll until `done` holds, for work that runs off the worker slots
    pub async fn wait_until<F: Fn() -> bool>(&self, done: F) {
        for _ in 0..400 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    /// Move the clock forward and run a utility pass
    pub async fn advance(&self, seconds: i64) {
        self.clock.advance_seconds(seconds);
        self.tick().await;
    }

    pub async fn set_time(&self, at: DateTime<Utc>) {
        self.clock.set(at);
        self.tick().await;
    }

    pub async fn tick(&self) {
        self.settle().await;
        self.ad.utility_pass().await;
        self.settle().await;
    }

    /// The backend reports a new state
    pub async fn push_state(&self, entity_id: &str, state: &str) {
        self.plugin
            .push_state(entity_id, StateUpdate::state(state))
            .unwrap();
        self.settle().await;
    }

    fn write_bumped(&self, path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
        // Push mtime forward so the change is seen within the same second
        let mut bump = self.bump.lock().unwrap();
        *bump += 10;
        let file = fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(*bump))
            .unwrap();
    }

    pub fn write_apps(&self, yaml: &str) {
        self.write_bumped(&self.app_dir.join("apps.yaml"), yaml);
    }

    pub fn write_module(&self, name: &str, source: &str) {
        self.write_bumped(&self.app_dir.join(format!("{name}.py")), source);
    }

    pub fn remove_module(&self, name: &str) {
        fs::remove_file(self.app_dir.join(format!("{name}.py"))).unwrap();
    }

    pub fn status(&self, app: &str) -> Option<AppStatus> {
        self.ad.apps().app_status(app)
    }

    pub fn state(&self, namespace: &str, entity_id: &str) -> Option<Value> {
        self.ad
            .kernel()
            .state
            .get_state(namespace, &StateQuery::entity(entity_id))
    }

    pub fn admin_state(&self, entity_id: &str) -> Option<Value> {
        self.state(ADMIN, entity_id)
    }

    pub fn events(&self, event_type: &str) -> Vec<Event> {
        self.captured.of_type(event_type)
    }

    pub fn state_changes(&self, entity_id: &str) -> usize {
        self.events(STATE_CHANGED)
            .iter()
            .filter(|e| e.data.get("entity_id").and_then(Value::as_str) == Some(entity_id))
            .count()
    }

    pub async fn stop(&self) {
        self.ad.stop().await;
    }
}
