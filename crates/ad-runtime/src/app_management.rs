//! App manager
//!
//! Keeps running app objects in step with the app config files and the
//! module sources under `app_dir`. Every reconciliation pass works out what
//! to stop, unload, import and start, then does it in dependency order.

use crate::admin;
use crate::app::{App, AppRegistry, AppStatus};
use crate::error::{AppError, AppResult};
use crate::kernel::Kernel;
use crate::Adapi;
use ad_callbacks::{new_handle, Invocation, LogLevel};
use ad_config::{AllAppConfig, AppConfig, AppConfigFiles, SequenceConfig};
use ad_core::events::{APPD_STARTED, APP_INITIALIZED, APP_RELOADED, APP_TERMINATED};
use ad_core::{Event, ADMIN};
use ad_dependency::{
    collect_files, DependencyError, Graph, LoadingActions, ModuleDeps, UpdateActions, UpdateMode,
};
use ad_threading::{ThreadError, WorkItem, WorkKind};
use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// A live app object and what it was built from
pub struct ManagedApp {
    pub id: String,
    pub object: Arc<dyn App>,
    pub api: Adapi,
    pub module: String,
}

/// Which lifecycle hook to run on an app's slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Initialize,
    Terminate,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::Initialize => "initialize",
            Stage::Terminate => "terminate",
        }
    }
}

/// File tracking and load state, guarded by one lock per pass
struct Tracking {
    config_files: AppConfigFiles,
    config: AllAppConfig,
    modules: Option<ModuleDeps>,
    loaded: BTreeSet<String>,
    failed_modules: BTreeSet<String>,
    /// Apps stopped because their plugin went away, by namespace
    plugin_stopped: BTreeMap<String, BTreeSet<String>>,
}

pub struct AppManagement {
    kernel: Arc<Kernel>,
    registry: AppRegistry,
    objects: DashMap<String, ManagedApp>,
    statuses: DashMap<String, AppStatus>,
    inner: Mutex<Tracking>,
    weak_self: Weak<AppManagement>,
}

impl AppManagement {
    pub fn new(kernel: Arc<Kernel>, registry: AppRegistry) -> AppResult<Arc<Self>> {
        let config = &kernel.config;
        let config_files =
            AppConfigFiles::new(&config.config_dir, config.app_dir(), config.exclude_dirs())?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            kernel: kernel.clone(),
            registry,
            objects: DashMap::new(),
            statuses: DashMap::new(),
            inner: Mutex::new(Tracking {
                config_files,
                config: AllAppConfig::default(),
                modules: None,
                loaded: BTreeSet::new(),
                failed_modules: BTreeSet::new(),
                plugin_stopped: BTreeMap::new(),
            }),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// A running app's object
    pub fn get_app(&self, name: &str) -> Option<Arc<dyn App>> {
        self.objects.get(name).map(|m| m.object.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn running_apps(&self) -> BTreeSet<String> {
        self.objects.iter().map(|m| m.key().clone()).collect()
    }

    pub fn app_status(&self, name: &str) -> Option<AppStatus> {
        self.statuses.get(name).map(|s| *s)
    }

    pub fn app_statuses(&self) -> BTreeMap<String, AppStatus> {
        self.statuses
            .iter()
            .map(|s| (s.key().clone(), *s.value()))
            .collect()
    }

    /// Snapshot of the merged app config in force
    pub async fn app_config(&self) -> AllAppConfig {
        self.inner.lock().await.config.clone()
    }

    async fn set_status(&self, name: &str, status: AppStatus) {
        self.statuses.insert(name.to_string(), status);
        admin::write_app_status(&self.kernel, name, status).await;
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Bring running apps in line with files on disk
    ///
    /// `plugin` names the namespace whose plugin stopped or restarted for the
    /// plugin modes. Production mode skips rescans in `Normal` mode.
    pub async fn check_app_updates(
        &self,
        plugin: Option<&str>,
        mode: UpdateMode,
    ) -> AppResult<UpdateActions> {
        let rescan = !(mode == UpdateMode::Normal && self.kernel.config.production_mode);
        self.reconcile(plugin, mode, rescan).await
    }

    /// Rescan and reload now, production mode or not
    pub async fn reload_apps(&self) -> AppResult<UpdateActions> {
        self.reconcile(None, UpdateMode::Normal, true).await
    }

    #[instrument(skip(self))]
    async fn reconcile(
        &self,
        plugin: Option<&str>,
        mode: UpdateMode,
        rescan: bool,
    ) -> AppResult<UpdateActions> {
        let mut tracking = self.inner.lock().await;
        let mut actions = UpdateActions::default();

        if mode == UpdateMode::Terminate {
            actions.apps.term = self.running_apps();
            let graph = tracking.config.dependency_graph();
            self.stop_apps(&graph, &mut actions.apps).await;
            return Ok(actions);
        }

        if rescan {
            self.check_config(&mut tracking, mode, &mut actions).await;
            self.check_modules(&mut tracking, &mut actions);
        }

        match (plugin, mode) {
            (Some(namespace), UpdateMode::PluginFailed) => {
                let affected = self.plugin_apps(&tracking.config, namespace);
                if !affected.is_empty() {
                    info!(namespace, apps = ?affected, "Stopping apps using a stopped plugin");
                }
                actions.apps.term.extend(affected.iter().cloned());
                tracking
                    .plugin_stopped
                    .entry(namespace.to_string())
                    .or_default()
                    .extend(affected);
            }
            (Some(namespace), UpdateMode::PluginRestart) => {
                if let Some(stopped) = tracking.plugin_stopped.remove(namespace) {
                    info!(namespace, apps = ?stopped, "Restarting apps after plugin restart");
                    actions.apps.init.extend(stopped);
                }
            }
            _ => {}
        }

        let graph = tracking.config.dependency_graph();
        self.stop_apps(&graph, &mut actions.apps).await;
        self.unload_modules(&mut tracking);
        self.import_modules(&mut tracking, &mut actions);
        self.start_apps(&tracking, &mut actions.apps).await;

        if mode == UpdateMode::Init {
            info!(running = self.objects.len(), "Initial app load complete");
            self.fire_admin(APPD_STARTED, json!({}));
        } else if actions.apps.changes() || actions.modules.changes() {
            info!(
                init = ?actions.apps.init,
                reload = ?actions.apps.reload,
                term = ?actions.apps.term,
                "Apps reloaded"
            );
            self.fire_admin(
                APP_RELOADED,
                json!({
                    "init": actions.apps.init,
                    "reload": actions.apps.reload,
                    "term": actions.apps.term,
                    "failed": actions.apps.failed,
                }),
            );
        }
        admin::update_app_sensors(&self.kernel, &tracking.config, &self.app_statuses()).await;
        Ok(actions)
    }

    fn fire_admin(&self, event_type: &str, data: serde_json::Value) {
        self.kernel
            .bus
            .fire(Event::new(ADMIN, event_type, data).at(self.kernel.now()));
    }

    /// Re-read app config files and sequence definitions
    async fn check_config(
        &self,
        tracking: &mut Tracking,
        mode: UpdateMode,
        actions: &mut UpdateActions,
    ) {
        let changed = tracking.config_files.scan();
        if !changed && mode != UpdateMode::Init {
            return;
        }
        let new_config = tracking.config_files.merged();
        let mut apps = tracking.config.app_changes(&new_config);
        let sequences = tracking.config.sequence_changes(&new_config);

        // Apps that ran a hot-reloading sequence pick up its new definition
        for name in &sequences.reload {
            let hot = new_config.sequences.get(name).map_or(false, |s| s.hot_reload);
            if hot {
                for caller in self.kernel.sequences.callers(name) {
                    if new_config.apps.get(&caller).map_or(false, |a| !a.disable) {
                        apps.reload.insert(caller);
                    }
                }
            }
        }

        if !sequences.term.is_empty() {
            let names: Vec<&str> = sequences.term.iter().map(String::as_str).collect();
            if let Err(e) = self.kernel.sequences.remove_sequences(names).await {
                warn!(error = %e, "Unable to remove sequences");
            }
        }
        let updated = sequences.init_set();
        if !updated.is_empty() {
            // Collected so no borrowing closure lives across the await
            let configs: Vec<SequenceConfig> = new_config
                .sequences
                .values()
                .filter(|s| updated.contains(&s.name))
                .cloned()
                .collect();
            if let Err(e) = self
                .kernel
                .sequences
                .update_sequence_entities(configs.iter())
                .await
            {
                warn!(error = %e, "Unable to update sequence entities");
            }
        }

        for name in tracking.config.app_names().difference(&new_config.app_names()) {
            self.statuses.remove(name);
            admin::remove_app_entity(&self.kernel, name).await;
        }
        for app in new_config.apps.values() {
            if !self.statuses.contains_key(&app.name) {
                self.set_status(&app.name, AppStatus::Idle).await;
            }
        }

        if self.kernel.config.pin_apps {
            let wanted = new_config.active_app_count();
            if wanted > self.kernel.pool.size() {
                let size = self.kernel.pool.grow(wanted);
                info!(threads = size, "Added threads so every pinned app has its own");
            }
        }

        debug!(
            apps = new_config.apps.len(),
            sequences = new_config.sequences.len(),
            "App config updated"
        );
        tracking.config = new_config;
        actions.apps = apps;
        actions.sequences = sequences;
    }

    /// Track module sources and work out which apps they touch
    fn check_modules(&self, tracking: &mut Tracking, actions: &mut UpdateActions) {
        let config = &self.kernel.config;
        let paths = collect_files(
            &config.app_dir(),
            &config.module_extension,
            &config.exclude_dirs(),
        );
        match tracking.modules.as_mut() {
            Some(deps) => deps.update(paths),
            None => {
                tracking.modules = Some(ModuleDeps::from_paths(paths, config.package_marker.clone()))
            }
        }
        let Some(deps) = tracking.modules.as_ref() else {
            return;
        };
        if !deps.files.there_were_changes() {
            return;
        }
        deps.files.log_changes("module", &config.app_dir());

        let modified = deps.modified_modules();
        let new: BTreeSet<String> = deps
            .modules_to_import()
            .difference(&modified)
            .cloned()
            .collect();
        let deleted: BTreeSet<String> = deps
            .files
            .deleted
            .iter()
            .filter_map(|p| deps.name_of(p))
            .collect();
        let reload = deps.get_dependents(modified.iter().map(String::as_str));

        let all = &tracking.config;
        actions
            .apps
            .reload
            .extend(all.apps_using_modules(&reload));
        actions.apps.term.extend(all.apps_using_modules(&deleted));
        // Apps that were waiting on a module that has now appeared
        actions.apps.init.extend(
            all.apps_using_modules(&new)
                .into_iter()
                .filter(|a| !self.objects.contains_key(a)),
        );

        actions.modules.init.extend(new);
        actions.modules.reload.extend(reload);
        actions.modules.term.extend(deleted);
    }

    fn unload_modules(&self, tracking: &mut Tracking) {
        let Some(deps) = tracking.modules.as_ref() else {
            return;
        };
        match deps.modules_to_delete() {
            Ok(order) => {
                for module in order {
                    if tracking.loaded.remove(&module) {
                        info!(module = %module, "Unloaded module");
                    }
                    tracking.failed_modules.remove(&module);
                }
            }
            Err(e) => warn!(error = %e, "Unable to order deleted modules"),
        }
    }

    /// Import new and modified modules, failing the apps that use a bad one
    fn import_modules(&self, tracking: &mut Tracking, actions: &mut UpdateActions) {
        let Some(deps) = tracking.modules.as_ref() else {
            return;
        };

        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut order = Vec::new();
        for _ in 0..=deps.graph().len() {
            match actions.modules.import_sort(deps) {
                Ok(sorted) => {
                    order = sorted;
                    break;
                }
                Err(DependencyError::CircularDependency { cycle, .. }) => {
                    error!(cycle = ?cycle, "Circular import between modules");
                    let stuck = deps.get_dependents(cycle.iter().map(String::as_str));
                    actions.modules.failed.extend(stuck.iter().cloned());
                    failed.extend(stuck);
                }
                Err(e) => {
                    error!(error = %e, "Unable to order module imports");
                    return;
                }
            }
        }

        for module in order {
            if failed.contains(&module) {
                continue;
            }
            let unreadable = deps
                .path_of(&module)
                .map_or(false, |p| deps.failed_files().contains(p));
            let broken_import = deps
                .graph()
                .dependencies(&module)
                .map_or(false, |d| d.iter().any(|m| failed.contains(m)));
            if unreadable || broken_import {
                warn!(module = %module, "Module failed to import");
                failed.extend(deps.get_dependents([module.as_str()]));
                continue;
            }
            debug!(module = %module, "Imported module");
            tracking.loaded.insert(module.clone());
            tracking.failed_modules.remove(&module);
        }

        if failed.is_empty() {
            return;
        }
        for module in &failed {
            tracking.loaded.remove(module);
        }
        tracking.failed_modules.extend(failed.iter().cloned());
        actions.modules.failed.extend(failed.iter().cloned());

        let config = &tracking.config;
        let mut apps = config.apps_using_modules(&failed);
        apps.extend(
            config
                .dependency_graph()
                .transitive_dependents(apps.iter().map(String::as_str)),
        );
        for app in apps {
            warn!(app = %app, "App uses a module that failed to import");
            actions.apps.failed.insert(app);
        }
    }

    /// Apps using `namespace` plus everything depending on them
    fn plugin_apps(&self, config: &AllAppConfig, namespace: &str) -> BTreeSet<String> {
        let direct: BTreeSet<String> = self
            .objects
            .iter()
            .filter(|m| m.api.namespace() == namespace)
            .map(|m| m.key().clone())
            .collect();
        let mut all = direct.clone();
        all.extend(
            config
                .dependency_graph()
                .transitive_dependents(direct.iter().map(String::as_str))
                .into_iter()
                .filter(|a| self.objects.contains_key(a)),
        );
        all
    }

    // ------------------------------------------------------------------
    // Stopping
    // ------------------------------------------------------------------

    async fn stop_apps(&self, graph: &Graph, apps: &mut LoadingActions) {
        for name in apps.failed.clone() {
            if self.objects.contains_key(&name) {
                apps.term.insert(name);
            }
        }
        if apps.term_set().is_empty() {
            return;
        }
        let order = match apps.term_sort(graph) {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "Unable to order app shutdown, stopping by name");
                apps.term_set().into_iter().collect()
            }
        };
        for name in order {
            if !self.objects.contains_key(&name) {
                continue;
            }
            if !self.terminate_app(&name).await {
                apps.init.remove(&name);
                apps.reload.remove(&name);
            }
        }
    }

    /// Run `terminate` and drop everything the app registered
    ///
    /// Returns false when `terminate` failed or timed out; the app is torn
    /// down either way.
    async fn terminate_app(&self, name: &str) -> bool {
        let Some((_, managed)) = self.objects.remove(name) else {
            return true;
        };
        info!(app = %name, "Terminating app");
        let ok = match self.run_stage(name, managed.object.clone(), Stage::Terminate).await {
            Ok(()) => true,
            Err(e) => {
                error!(app = %name, error = %format!("{e:#}"), "Error terminating app");
                false
            }
        };
        self.clear_registrations(name);
        self.set_status(name, AppStatus::Terminated).await;
        self.fire_admin(APP_TERMINATED, json!({ "app": name }));
        ok
    }

    fn clear_registrations(&self, name: &str) {
        let kernel = &self.kernel;
        for record in kernel.callbacks.clear_app(name) {
            kernel.cancel_record_timers(&record.timers());
        }
        let timers = kernel.scheduler.cancel_app(name);
        let services = kernel.services.clear_app(name);
        kernel.pool.unregister_app(name);
        debug!(app = %name, timers, services, "Cleared app registrations");
    }

    async fn run_stage(&self, name: &str, object: Arc<dyn App>, stage: Stage) -> anyhow::Result<()> {
        let invocation = Invocation::Async(Box::pin(async move {
            match stage {
                Stage::Initialize => object.initialize().await,
                Stage::Terminate => object.terminate().await,
            }
        }));
        let item = WorkItem::new(name, WorkKind::Init, stage.label(), invocation);
        let done = self.kernel.pool.dispatch_with_result(item)?;
        let outcome = match stage {
            Stage::Initialize => done.await,
            Stage::Terminate => {
                let limit = self.kernel.config.terminate_timeout();
                match tokio::time::timeout(limit, done).await {
                    Ok(outcome) => outcome,
                    Err(_) => anyhow::bail!("terminate did not finish within {limit:?}"),
                }
            }
        };
        outcome.map_err(|_| anyhow::anyhow!("worker dropped the {} call", stage.label()))?
    }

    // ------------------------------------------------------------------
    // Starting
    // ------------------------------------------------------------------

    fn module_loaded(&self, tracking: &Tracking, module: &str) -> bool {
        if tracking.failed_modules.contains(module) {
            return false;
        }
        if tracking.loaded.contains(module) {
            return true;
        }
        // Compiled-in module with no source file
        let tracked = tracking
            .modules
            .as_ref()
            .map_or(false, |deps| deps.contains(module));
        !tracked && self.registry.has_module(module)
    }

    async fn start_apps(&self, tracking: &Tracking, apps: &mut LoadingActions) {
        let config = &tracking.config;
        let graph = config.dependency_graph();
        let priorities = config.priorities();
        for failed in &apps.failed {
            self.set_status(failed, AppStatus::Failed).await;
        }

        let mut order = Vec::new();
        for _ in 0..=graph.len() {
            match apps.start_sort(&graph, &priorities) {
                Ok(sorted) => {
                    order = sorted;
                    break;
                }
                Err(DependencyError::CircularDependency { cycle, .. }) => {
                    error!(cycle = ?cycle, "Circular dependency between apps");
                    let dependents = graph.transitive_dependents(cycle.iter().map(String::as_str));
                    let mut stuck: BTreeSet<String> = cycle.into_iter().collect();
                    stuck.extend(dependents);
                    for name in stuck {
                        self.set_status(&name, AppStatus::Failed).await;
                        apps.failed.insert(name);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Unable to order app start");
                    return;
                }
            }
        }

        for name in order {
            let Some(app) = config.apps.get(&name) else {
                continue;
            };
            if app.disable || apps.failed.contains(&name) || self.objects.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.start_one(tracking, app).await {
                error!(app = %name, error = %e, "App failed to start");
                self.set_status(&name, AppStatus::Failed).await;
                apps.failed.insert(name);
            }
        }
    }

    fn check_dependencies(&self, tracking: &Tracking, app: &AppConfig) -> AppResult<()> {
        let config = &tracking.config;
        for dep in &app.dependencies {
            match config.globals.get(dep) {
                Some(global) => {
                    if !self.module_loaded(tracking, &global.module) {
                        return Err(AppError::GlobalNotLoaded {
                            app: app.name.clone(),
                            module: global.module.clone(),
                        });
                    }
                }
                None if !self.objects.contains_key(dep) => {
                    return Err(AppError::DependencyNotRunning {
                        app: app.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                None => {}
            }
        }
        for module in &app.global_dependencies {
            if !self.module_loaded(tracking, module) {
                return Err(AppError::GlobalNotLoaded {
                    app: app.name.clone(),
                    module: module.clone(),
                });
            }
        }
        if !self.module_loaded(tracking, &app.module) {
            return Err(AppError::ModuleNotFound(app.module.clone()));
        }
        Ok(())
    }

    async fn start_one(&self, tracking: &Tracking, app: &AppConfig) -> AppResult<()> {
        self.check_dependencies(tracking, app)?;
        let name = app.name.clone();

        self.kernel
            .pool
            .register_app(&name, app.pin_app, app.pin_thread)
            .map_err(|e| match e {
                ThreadError::PinOutOfRange { pin, size } => AppError::PinOutOfRange {
                    app: name.clone(),
                    pin,
                    threads: size,
                },
                other => AppError::Initialize {
                    app: name.clone(),
                    source: other.into(),
                },
            })?;

        let log_level = match app.log_level.as_deref().map(str::parse::<LogLevel>) {
            Some(Ok(level)) => level,
            Some(Err(e)) => {
                warn!(app = %name, error = %e, "Ignoring bad log_level");
                LogLevel::default()
            }
            None => LogLevel::default(),
        };
        let api = Adapi::new(
            &name,
            self.kernel.clone(),
            self.weak_self.clone(),
            app.args.clone(),
            log_level,
        );
        let object = match self.registry.create(&app.module, &app.class, api.clone()) {
            Ok(object) => object,
            Err(e) => {
                self.kernel.pool.unregister_app(&name);
                return Err(e);
            }
        };

        self.set_status(&name, AppStatus::Initializing).await;
        self.objects.insert(
            name.clone(),
            ManagedApp {
                id: new_handle(),
                object: object.clone(),
                api,
                module: app.module.clone(),
            },
        );
        info!(app = %name, module = %app.module, class = %app.class, "Initializing app");

        if let Err(source) = self.run_stage(&name, object, Stage::Initialize).await {
            self.objects.remove(&name);
            self.clear_registrations(&name);
            return Err(AppError::Initialize { app: name, source });
        }
        self.set_status(&name, AppStatus::Running).await;
        self.fire_admin(APP_INITIALIZED, json!({ "app": name }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Single-app control
    // ------------------------------------------------------------------

    /// Start one configured app, if it is not already running
    pub async fn start_app(&self, name: &str) -> AppResult<()> {
        let tracking = self.inner.lock().await;
        let app = tracking
            .config
            .apps
            .get(name)
            .ok_or_else(|| AppError::UnknownApp(name.to_string()))?;
        if self.objects.contains_key(name) {
            return Ok(());
        }
        let result = self.start_one(&tracking, app).await;
        if result.is_err() {
            self.set_status(name, AppStatus::Failed).await;
        }
        admin::update_app_sensors(&self.kernel, &tracking.config, &self.app_statuses()).await;
        result
    }

    /// Stop one app; false when its `terminate` failed
    pub async fn stop_app(&self, name: &str) -> AppResult<bool> {
        let tracking = self.inner.lock().await;
        if !self.objects.contains_key(name) && !tracking.config.apps.contains_key(name) {
            return Err(AppError::UnknownApp(name.to_string()));
        }
        let ok = self.terminate_app(name).await;
        admin::update_app_sensors(&self.kernel, &tracking.config, &self.app_statuses()).await;
        Ok(ok)
    }

    pub async fn restart_app(&self, name: &str) -> AppResult<()> {
        self.stop_app(name).await?;
        self.start_app(name).await
    }
}
