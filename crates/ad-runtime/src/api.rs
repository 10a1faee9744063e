//! The per-app API handle
//!
//! Every app object is built with an [`Adapi`]. All registrations made
//! through it are owned by the app and disappear when the app stops.

use crate::app::App;
use crate::app_management::AppManagement;
use crate::error::{ApiError, ApiResult};
use crate::kernel::Kernel;
use ad_callbacks::{
    Callback, CallbackError, CallbackInfo, CallbackKind, EventArgs, EventOptions, LogArgs,
    LogLevel, LogOptions, Pinning, StateArgs, StateOptions, TimerArgs,
};
use ad_clock::Tz;
use ad_config::SequenceRef;
use ad_core::events::LogEventData;
use ad_core::{EntityState, Event, Kwargs, StateUpdate, Writeback, ADMIN, DEFAULT, GLOBAL};
use ad_scheduler::{SchedulerError, TimeSpec, TimerInfo, TimerOptions};
use ad_sequences::SequenceHandle;
use ad_service_registry::{ServiceCall, ServiceFuture, ServiceHandler, ServiceResult};
use ad_state_store::StateQuery;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error, info, instrument, warn};

/// Log written by [`Adapi::log`]
pub const MAIN_LOG: &str = "main_log";
/// Log written by [`Adapi::error`]
pub const ERROR_LOG: &str = "error_log";

struct ApiInner {
    name: String,
    kernel: Arc<Kernel>,
    apps: Weak<AppManagement>,
    namespace: RwLock<String>,
    args: Kwargs,
    log_level: LogLevel,
}

/// An app's view of the runtime
///
/// Cheap to clone. [`Adapi::in_namespace`] returns a view whose calls
/// target another namespace without changing the app's default.
#[derive(Clone)]
pub struct Adapi {
    inner: Arc<ApiInner>,
    namespace_override: Option<String>,
}

impl std::fmt::Debug for Adapi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapi")
            .field("name", &self.inner.name)
            .field("namespace", &self.namespace())
            .finish()
    }
}

impl Adapi {
    pub(crate) fn new(
        name: &str,
        kernel: Arc<Kernel>,
        apps: Weak<AppManagement>,
        args: Kwargs,
        log_level: LogLevel,
    ) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                name: name.to_string(),
                kernel,
                apps,
                namespace: RwLock::new(DEFAULT.to_string()),
                args,
                log_level,
            }),
            namespace_override: None,
        }
    }

    fn kernel(&self) -> &Kernel {
        &self.inner.kernel
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Extra keys from the app's config entry
    pub fn args(&self) -> &Kwargs {
        &self.inner.args
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.inner.args.get(key)
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Namespace calls go to when none is given
    pub fn namespace(&self) -> String {
        match &self.namespace_override {
            Some(ns) => ns.clone(),
            None => self
                .inner
                .namespace
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn get_namespace(&self) -> String {
        self.namespace()
    }

    /// Change this app's default namespace
    pub fn set_namespace(&self, namespace: &str) -> ApiResult<()> {
        if !self.kernel().state.namespace_exists(namespace) {
            warn!(app = %self.name(), namespace, "Unknown namespace, keeping current one");
            return Err(ApiError::NamespaceNotFound(namespace.to_string()));
        }
        *self
            .inner
            .namespace
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = namespace.to_string();
        Ok(())
    }

    /// A view of this API bound to `namespace`
    pub fn in_namespace(&self, namespace: &str) -> Adapi {
        Adapi {
            inner: self.inner.clone(),
            namespace_override: Some(namespace.to_string()),
        }
    }

    pub async fn add_namespace(&self, namespace: &str, writeback: Writeback) -> ApiResult<()> {
        Ok(self.kernel().state.add_namespace(namespace, writeback).await?)
    }

    pub async fn remove_namespace(&self, namespace: &str) -> ApiResult<()> {
        Ok(self.kernel().state.remove_namespace(namespace).await?)
    }

    pub fn list_namespaces(&self) -> Vec<String> {
        self.kernel().state.list_namespaces()
    }

    fn check_pin(&self, pinning: &Pinning) -> ApiResult<()> {
        if let Some(slot) = pinning.pin_thread {
            self.kernel().pool.validate_pin(slot)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Watch an entity, a whole domain (`"light"`), or everything (`None`)
    ///
    /// Returns the handle used to cancel the listener.
    #[instrument(skip(self, options, callback), fields(app = %self.name()))]
    pub fn listen_state(
        &self,
        entity: Option<&str>,
        options: StateOptions,
        callback: Callback<StateArgs>,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let kernel = self.kernel();
        let namespace = options.namespace.clone().unwrap_or_else(|| self.namespace());
        if let Some(entity) = entity.filter(|e| e.contains('.')) {
            if namespace != GLOBAL && !kernel.state.entity_exists(&namespace, entity) {
                warn!(app = %self.name(), namespace = %namespace, entity, "Listening to an entity that does not exist yet");
            }
        }

        let timeout = options.timeout;
        let immediate = options.immediate;
        let handle = kernel
            .callbacks
            .add_state(self.name(), &namespace, entity, options, callback);
        if let Some(timeout) = timeout {
            kernel.arm_timeout(self.name(), &handle, timeout);
        }
        if immediate {
            let current = entity.and_then(|e| kernel.state.get_entity(&namespace, e));
            kernel.route(kernel.callbacks.immediate(&handle, current.as_ref()));
        }
        debug!(handle = %handle, namespace = %namespace, "State listener registered");
        Ok(handle)
    }

    fn cancel_listener(&self, handle: &str, kind: CallbackKind) -> ApiResult<bool> {
        match self.kernel().callbacks.cancel(self.name(), handle, Some(kind)) {
            Ok(record) => {
                self.kernel().cancel_record_timers(&record.timers());
                Ok(true)
            }
            Err(CallbackError::NotFound(_)) => {
                warn!(app = %self.name(), handle, %kind, "Callback already cancelled or never existed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn listener_info(&self, handle: &str, kind: CallbackKind) -> ApiResult<CallbackInfo> {
        let info = self
            .kernel()
            .callbacks
            .info(handle)
            .ok_or_else(|| CallbackError::NotFound(handle.to_string()))?;
        if info.app != self.name() {
            return Err(ApiError::NotOwner {
                handle: handle.to_string(),
                owner: info.app,
            });
        }
        if info.kind != kind {
            return Err(CallbackError::WrongKind {
                handle: handle.to_string(),
                expected: kind,
                actual: info.kind,
            }
            .into());
        }
        Ok(info)
    }

    /// Cancel a state listener; cancelling twice is a logged no-op
    pub fn cancel_listen_state(&self, handle: &str) -> ApiResult<bool> {
        self.cancel_listener(handle, CallbackKind::State)
    }

    pub fn info_listen_state(&self, handle: &str) -> ApiResult<CallbackInfo> {
        self.listener_info(handle, CallbackKind::State)
    }

    /// Read state per [`StateQuery`]; `None` for unknown namespaces or entities
    pub fn get_state(&self, query: &StateQuery) -> Option<Value> {
        let namespace = self.namespace();
        if !self.kernel().state.namespace_exists(&namespace) {
            warn!(app = %self.name(), namespace = %namespace, "get_state on unknown namespace");
            return None;
        }
        self.kernel().state.get_state(&namespace, query)
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<EntityState> {
        self.kernel().state.get_entity(&self.namespace(), entity_id)
    }

    pub fn entity_exists(&self, entity_id: &str) -> bool {
        self.kernel().state.entity_exists(&self.namespace(), entity_id)
    }

    pub async fn set_state(&self, entity_id: &str, update: StateUpdate) -> ApiResult<EntityState> {
        Ok(self
            .kernel()
            .state
            .set_state(&self.namespace(), entity_id, update, false)
            .await?)
    }

    pub async fn add_entity(
        &self,
        entity_id: &str,
        state: Value,
        attributes: IndexMap<String, Value>,
    ) -> ApiResult<bool> {
        Ok(self
            .kernel()
            .state
            .add_entity(&self.namespace(), entity_id, state, attributes)
            .await?)
    }

    pub async fn remove_entity(&self, entity_id: &str) -> ApiResult<bool> {
        Ok(self
            .kernel()
            .state
            .remove_entity(&self.namespace(), entity_id)
            .await?)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Watch one event type, or every non-system event when `event` is `None`
    #[instrument(skip(self, options, callback), fields(app = %self.name()))]
    pub fn listen_event(
        &self,
        event: Option<&str>,
        options: EventOptions,
        callback: Callback<EventArgs>,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let kernel = self.kernel();
        let namespace = options.namespace.clone().unwrap_or_else(|| self.namespace());
        let timeout = options.timeout;
        let handle = kernel
            .callbacks
            .add_event(self.name(), &namespace, event, options, callback);
        if let Some(timeout) = timeout {
            kernel.arm_timeout(self.name(), &handle, timeout);
        }
        debug!(handle = %handle, namespace = %namespace, "Event listener registered");
        Ok(handle)
    }

    pub fn cancel_listen_event(&self, handle: &str) -> ApiResult<bool> {
        self.cancel_listener(handle, CallbackKind::Event)
    }

    pub fn info_listen_event(&self, handle: &str) -> ApiResult<CallbackInfo> {
        self.listener_info(handle, CallbackKind::Event)
    }

    /// Publish an event in the current namespace
    pub fn fire_event(&self, event_type: &str, data: Value) {
        let event = Event::new(self.namespace(), event_type, data).at(self.kernel().now());
        self.kernel().bus.fire(event);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    fn parse_time(spec: &str) -> ApiResult<TimeSpec> {
        Ok(spec.parse::<TimeSpec>()?)
    }

    /// Run once after `seconds`
    pub fn run_in(
        &self,
        callback: Callback<TimerArgs>,
        seconds: f64,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        Ok(self
            .kernel()
            .scheduler
            .run_in(self.name(), callback, seconds, options)?)
    }

    /// Run once at the next occurrence of `at` (`"HH:MM:SS"`, `"sunset - 00:10:00"`, ...)
    pub fn run_once(
        &self,
        callback: Callback<TimerArgs>,
        at: &str,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let spec = Self::parse_time(at)?;
        Ok(self
            .kernel()
            .scheduler
            .run_once(self.name(), callback, &spec, options)?)
    }

    /// Run once at an absolute time; a time in the past is an error
    pub fn run_at(
        &self,
        callback: Callback<TimerArgs>,
        at: &str,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let spec = Self::parse_time(at)?;
        Ok(self
            .kernel()
            .scheduler
            .run_at(self.name(), callback, &spec, options)?)
    }

    pub fn run_daily(
        &self,
        callback: Callback<TimerArgs>,
        at: &str,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let spec = Self::parse_time(at)?;
        Ok(self
            .kernel()
            .scheduler
            .run_daily(self.name(), callback, &spec, options)?)
    }

    pub fn run_hourly(
        &self,
        callback: Callback<TimerArgs>,
        start: Option<&str>,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let start = start.map(Self::parse_time).transpose()?;
        Ok(self
            .kernel()
            .scheduler
            .run_hourly(self.name(), callback, start.as_ref(), options)?)
    }

    pub fn run_minutely(
        &self,
        callback: Callback<TimerArgs>,
        start: Option<&str>,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let start = start.map(Self::parse_time).transpose()?;
        Ok(self
            .kernel()
            .scheduler
            .run_minutely(self.name(), callback, start.as_ref(), options)?)
    }

    /// Repeat every `interval` seconds, starting at `start` or one interval from now
    pub fn run_every(
        &self,
        callback: Callback<TimerArgs>,
        start: Option<&str>,
        interval: f64,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        let start = start.map(Self::parse_time).transpose()?;
        let interval = chrono::Duration::milliseconds((interval * 1000.0).round() as i64);
        Ok(self
            .kernel()
            .scheduler
            .run_every(self.name(), callback, start.as_ref(), interval, options)?)
    }

    pub fn run_at_sunrise(
        &self,
        callback: Callback<TimerArgs>,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        Ok(self
            .kernel()
            .scheduler
            .run_at_sunrise(self.name(), callback, options)?)
    }

    pub fn run_at_sunset(
        &self,
        callback: Callback<TimerArgs>,
        options: TimerOptions,
    ) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        Ok(self
            .kernel()
            .scheduler
            .run_at_sunset(self.name(), callback, options)?)
    }

    fn own_timer(&self, handle: &str) -> ApiResult<Option<()>> {
        match self.kernel().scheduler.owner(handle) {
            None => Ok(None),
            Some(owner) if owner != self.name() => Err(ApiError::NotOwner {
                handle: handle.to_string(),
                owner,
            }),
            Some(_) => Ok(Some(())),
        }
    }

    /// Cancel a timer; cancelling twice is a logged no-op
    pub fn cancel_timer(&self, handle: &str) -> ApiResult<bool> {
        if self.own_timer(handle)?.is_none() {
            warn!(app = %self.name(), handle, "Timer already gone");
            return Ok(false);
        }
        Ok(self.kernel().scheduler.cancel(handle))
    }

    pub fn info_timer(&self, handle: &str) -> ApiResult<TimerInfo> {
        self.own_timer(handle)?
            .and_then(|_| self.kernel().scheduler.info(handle))
            .ok_or_else(|| ApiError::TimerNotFound(handle.to_string()))
    }

    pub fn timer_running(&self, handle: &str) -> bool {
        self.kernel().scheduler.timer_running(handle)
    }

    /// Restart a one-shot timer from now
    pub fn reset_timer(&self, handle: &str) -> ApiResult<()> {
        if self.own_timer(handle)?.is_none() {
            return Err(ApiError::TimerNotFound(handle.to_string()));
        }
        Ok(self.kernel().scheduler.reset(handle)?)
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    pub fn log(&self, message: &str) {
        self.write_log(LogLevel::Info, MAIN_LOG, message);
    }

    pub fn log_at(&self, level: LogLevel, message: &str) {
        self.write_log(level, MAIN_LOG, message);
    }

    pub fn error(&self, message: &str) {
        self.write_log(LogLevel::Error, ERROR_LOG, message);
    }

    fn write_log(&self, level: LogLevel, log_type: &str, message: &str) {
        if level < self.inner.log_level {
            return;
        }
        let app = self.name();
        match level {
            LogLevel::Debug => debug!(target: "app", app, log_type, "{message}"),
            LogLevel::Info => info!(target: "app", app, log_type, "{message}"),
            LogLevel::Warning => warn!(target: "app", app, log_type, "{message}"),
            LogLevel::Error | LogLevel::Critical => error!(target: "app", app, log_type, "{message}"),
        }

        // An app watching logs would otherwise be fed its own lines forever
        if self.kernel().callbacks.has_log_callback(app) {
            return;
        }
        let line = LogEventData {
            app_name: app.to_string(),
            ts: self.kernel().now(),
            level: level.as_str().to_string(),
            log_type: log_type.to_string(),
            message: message.to_string(),
        };
        self.kernel().bus.fire_typed(Event::typed(ADMIN, line).at(self.kernel().now()));
    }

    /// Watch log lines from every app at or above `options.level`
    pub fn listen_log(&self, options: LogOptions, callback: Callback<LogArgs>) -> ApiResult<String> {
        self.check_pin(&options.pinning)?;
        Ok(self.kernel().callbacks.add_log(self.name(), options, callback))
    }

    pub fn cancel_listen_log(&self, handle: &str) -> ApiResult<bool> {
        self.cancel_listener(handle, CallbackKind::Log)
    }

    // ------------------------------------------------------------------
    // Services and sequences
    // ------------------------------------------------------------------

    fn split_service(service: &str) -> ApiResult<(&str, &str)> {
        service
            .split_once('/')
            .filter(|(d, s)| !d.is_empty() && !s.is_empty())
            .ok_or_else(|| ApiError::BadServiceName(service.to_string()))
    }

    /// Call `domain/service` in the current namespace
    pub async fn call_service(&self, service: &str, data: Value) -> ApiResult<Option<Value>> {
        let (domain, service) = Self::split_service(service)?;
        Ok(self
            .kernel()
            .services
            .call(&self.namespace(), domain, service, data)
            .await?)
    }

    /// Offer `domain/service` in the current namespace until this app stops
    pub fn register_service<F, Fut>(&self, service: &str, handler: F) -> ApiResult<()>
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let (domain, service) = Self::split_service(service)?;
        let handler: ServiceHandler = Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);
        self.kernel().services.register_for_app(
            self.name(),
            &self.namespace(),
            domain,
            service,
            handler,
        )?;
        Ok(())
    }

    pub async fn run_sequence(&self, target: SequenceRef) -> ApiResult<SequenceHandle> {
        Ok(self
            .kernel()
            .sequences
            .run_sequence(self.name(), &self.namespace(), target)
            .await?)
    }

    pub async fn cancel_sequence(&self, name: &str) -> bool {
        self.kernel().sequences.cancel_sequence(name).await
    }

    // ------------------------------------------------------------------
    // Apps, time and sun
    // ------------------------------------------------------------------

    /// Another running app, if it is loaded
    ///
    /// The handle goes dead when that app is reloaded or stopped.
    pub fn get_app(&self, name: &str) -> Option<Weak<dyn App>> {
        let apps = self.inner.apps.upgrade()?;
        apps.get_app(name).map(|app| Arc::downgrade(&app))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.kernel().now()
    }

    pub fn now_ts(&self) -> f64 {
        self.kernel().clock.now_ts()
    }

    pub fn time_zone(&self) -> Tz {
        self.kernel().tz
    }

    pub fn sun_up(&self) -> ApiResult<bool> {
        let sun = self.kernel().scheduler.sun();
        Ok(sun.sun_up(self.now()).map_err(SchedulerError::from)?)
    }

    pub fn sun_down(&self) -> ApiResult<bool> {
        self.sun_up().map(|up| !up)
    }

    pub fn sunrise(&self) -> ApiResult<DateTime<Utc>> {
        let sun = self.kernel().scheduler.sun();
        Ok(sun.next_rising(self.now()).map_err(SchedulerError::from)?)
    }

    pub fn sunset(&self) -> ApiResult<DateTime<Utc>> {
        let sun = self.kernel().scheduler.sun();
        Ok(sun.next_setting(self.now()).map_err(SchedulerError::from)?)
    }
}
