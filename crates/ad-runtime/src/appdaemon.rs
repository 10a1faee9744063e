//! Top-level supervisor
//!
//! Owns the kernel and the app manager, pumps plugin events into the state
//! store and drives the utility loop that fires timers and picks up file
//! changes.

use crate::admin::{self, ThreadEntities};
use crate::app::AppRegistry;
use crate::app_management::AppManagement;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::Kernel;
use crate::router::EventRouter;
use crate::services;
use ad_clock::{SharedClock, SunEvent, SystemClock};
use ad_config::AppDaemonConfig;
use ad_core::events::{PLUGIN_STARTED, PLUGIN_STOPPED};
use ad_core::{Event, Writeback, ADMIN, DEFAULT, RULES};
use ad_dependency::UpdateMode;
use ad_event_bus::{EventListener, ListenerId};
use ad_plugin::{MemoryPlugin, PluginEvents, PluginManager, SharedPluginManager};
use ad_threading::QueueMonitor;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Plugin type handled in-process
pub const MEMORY_PLUGIN: &str = "memory";

struct UtilityState {
    monitor: QueueMonitor,
    threads: ThreadEntities,
    sun_up: Option<bool>,
}

pub struct AppDaemon {
    kernel: Arc<Kernel>,
    apps: Arc<AppManagement>,
    /// The bus only holds a weak reference
    router: Arc<dyn EventListener>,
    router_id: ListenerId,
    stopping: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    utility: tokio::sync::Mutex<UtilityState>,
}

impl AppDaemon {
    /// Build a runtime on the wall clock with plugins from the config
    pub async fn new(config: AppDaemonConfig, registry: AppRegistry) -> RuntimeResult<Self> {
        Self::with_clock(config, registry, Arc::new(SystemClock)).await
    }

    /// Plugins from the config, time from `clock`
    pub async fn with_clock(
        config: AppDaemonConfig,
        registry: AppRegistry,
        clock: SharedClock,
    ) -> RuntimeResult<Self> {
        let plugins = Arc::new(PluginManager::with_clock(clock.clone()));
        for (name, plugin) in &config.plugins {
            match plugin.plugin_type.as_str() {
                MEMORY_PLUGIN => plugins.register(Arc::new(
                    MemoryPlugin::new(&plugin.namespace).with_clock(clock.clone()),
                ))?,
                other => {
                    return Err(RuntimeError::UnknownPluginType {
                        name: name.clone(),
                        plugin_type: other.to_string(),
                    })
                }
            }
        }
        Self::with_parts(config, registry, clock, plugins).await
    }

    /// Build a runtime from explicit parts
    pub async fn with_parts(
        config: AppDaemonConfig,
        registry: AppRegistry,
        clock: SharedClock,
        plugins: SharedPluginManager,
    ) -> RuntimeResult<Self> {
        let kernel = Kernel::new(config, clock, plugins)?;

        for (name, ns) in &kernel.config.namespaces {
            kernel.state.init_namespace(name, ns.writeback).await?;
        }
        let mut builtins = vec![ADMIN.to_string(), RULES.to_string(), DEFAULT.to_string()];
        builtins.extend(kernel.plugins.namespaces());
        for name in builtins {
            kernel.state.init_namespace(&name, Writeback::None).await?;
        }

        let router: Arc<dyn EventListener> = Arc::new(EventRouter::new(Arc::downgrade(&kernel)));
        let router_id = kernel.bus.add_listener(&router);

        let apps = AppManagement::new(kernel.clone(), registry)?;
        services::register(&kernel, &apps);

        let monitor = QueueMonitor::new(
            kernel.config.qsize_warning_threshold,
            kernel.config.qsize_warning_step,
            kernel.config.qsize_warning_iterations,
        );
        Ok(Self {
            kernel,
            apps,
            router,
            router_id,
            stopping: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
            utility: tokio::sync::Mutex::new(UtilityState {
                monitor,
                threads: ThreadEntities::new(),
                sun_up: None,
            }),
        })
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn apps(&self) -> &Arc<AppManagement> {
        &self.apps
    }

    pub fn config(&self) -> &AppDaemonConfig {
        &self.kernel.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.kernel.now()
    }

    pub fn router(&self) -> &Arc<dyn EventListener> {
        &self.router
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Bring up plugins and load apps
    #[instrument(skip(self))]
    pub async fn start(&self) -> RuntimeResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            time_zone = %self.kernel.tz,
            "Starting runtime"
        );
        admin::init_entities(&self.kernel).await;

        if let Some(events) = self.kernel.plugins.take_events() {
            let handle = tokio::spawn(pump(
                events,
                self.kernel.clone(),
                self.apps.clone(),
                self.stopping.clone(),
            ));
            *self.pump.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        }

        self.kernel.plugins.start_all().await;
        for namespace in self.kernel.plugins.namespaces() {
            refresh_namespace(&self.kernel, &namespace).await;
        }

        {
            let mut utility = self.utility.lock().await;
            self.check_sun(&mut utility).await;
        }

        if self.kernel.config.disable_apps {
            info!("Apps are disabled");
        } else {
            self.apps.check_app_updates(None, UpdateMode::Init).await?;
        }
        Ok(())
    }

    /// One pass of periodic housekeeping
    pub async fn utility_pass(&self) {
        if self.is_stopping() {
            return;
        }
        let kernel = &self.kernel;
        let now = kernel.now();
        let mut utility = self.utility.lock().await;

        if kernel.scheduler.check_dst(now) {
            info!("Daylight saving transition, timers realigned");
        }
        // Fire first: a sun entry due at this crossing must be inactive
        // before the crossing reseats it
        kernel.process_fired(kernel.scheduler.tick(now));
        self.check_sun(&mut utility).await;

        utility.threads.update(kernel).await;
        admin::update_uptime(kernel).await;
        utility.monitor.check(&kernel.pool);

        kernel.state.save_hybrid_namespaces().await;
        kernel.plugins.utility().await;
        drop(utility);

        if !kernel.config.disable_apps {
            if let Err(e) = self.apps.check_app_updates(None, UpdateMode::Normal).await {
                error!(error = %e, "App update check failed");
            }
        }
    }

    /// Reseat sun timers when the sun crosses the horizon
    async fn check_sun(&self, utility: &mut UtilityState) {
        let kernel = &self.kernel;
        let up = match kernel.scheduler.sun().sun_up(kernel.now()) {
            Ok(up) => up,
            Err(e) => {
                warn!(error = %e, "Unable to work out sun position");
                return;
            }
        };
        let previous = utility.sun_up.replace(up);
        if previous == Some(up) {
            return;
        }
        if let Some(was_up) = previous {
            let elapsed = if was_up { SunEvent::Setting } else { SunEvent::Rising };
            let reseated = kernel.scheduler.reseat_sun(elapsed);
            debug!(?elapsed, reseated, "Sun transition");
        }
        admin::update_sun(kernel, up).await;
    }

    /// Run until `shutdown` resolves or `endtime` passes
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        let endtime = self
            .kernel
            .config
            .endtime()?
            .map(|t| ad_scheduler::localize(self.kernel.tz, t));
        let delay = self.kernel.config.utility_delay();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    self.utility_pass().await;
                    if endtime.map_or(false, |end| self.kernel.now() >= end) {
                        info!("End time reached");
                        break;
                    }
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Stop apps, plugins and workers, and flush persistent namespaces
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping runtime");
        if let Err(e) = self.apps.check_app_updates(None, UpdateMode::Terminate).await {
            warn!(error = %e, "Error stopping apps");
        }
        self.kernel.sequences.cancel_all().await;
        self.kernel.plugins.stop_all().await;
        self.kernel.state.save_all().await;
        self.kernel.pool.shutdown().await;
        self.kernel.bus.remove_listener(self.router_id);

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = pump {
            handle.abort();
        }
        info!("Runtime stopped");
    }
}

async fn refresh_namespace(kernel: &Kernel, namespace: &str) {
    if !kernel.plugins.is_running(namespace) {
        return;
    }
    match kernel.plugins.snapshot(namespace).await {
        Ok(entities) => kernel.state.set_namespace_state(namespace, entities),
        Err(e) => warn!(namespace, error = %e, "Unable to read plugin state"),
    }
}

fn plugin_namespace(event: &Event) -> Option<String> {
    event
        .data
        .get("namespace")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Feed plugin events into the state store and react to plugin restarts
async fn pump(
    mut events: PluginEvents,
    kernel: Arc<Kernel>,
    apps: Arc<AppManagement>,
    stopping: Arc<AtomicBool>,
) {
    let mut stopped: BTreeSet<String> = BTreeSet::new();
    while let Some(event) = events.recv().await {
        let status = (event.namespace == ADMIN)
            .then(|| {
                if event.event_type == PLUGIN_STOPPED {
                    plugin_namespace(&event).map(|ns| (ns, UpdateMode::PluginFailed))
                } else if event.event_type == PLUGIN_STARTED {
                    plugin_namespace(&event).map(|ns| (ns, UpdateMode::PluginRestart))
                } else {
                    None
                }
            })
            .flatten();

        kernel.state.process_event(event).await;

        let Some((namespace, mode)) = status else {
            continue;
        };
        if stopping.load(Ordering::SeqCst) {
            continue;
        }
        match mode {
            UpdateMode::PluginFailed => {
                warn!(namespace = %namespace, "Plugin stopped");
                stopped.insert(namespace.clone());
            }
            UpdateMode::PluginRestart if stopped.remove(&namespace) => {
                info!(namespace = %namespace, "Plugin restarted");
                refresh_namespace(&kernel, &namespace).await;
            }
            _ => continue,
        }
        let apps = apps.clone();
        tokio::spawn(async move {
            if let Err(e) = apps.check_app_updates(Some(&namespace), mode).await {
                error!(namespace = %namespace, error = %e, "App update after plugin change failed");
            }
        });
    }
    debug!("Plugin event channel closed");
}
