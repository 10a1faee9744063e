//! Shared subsystems every app and the supervisor talk to

use crate::error::RuntimeResult;
use ad_callbacks::{CallbackRegistry, Matches, SharedCallbackRegistry, TimerArgs};
use ad_clock::{SharedClock, SunCalculator, Tz};
use ad_config::AppDaemonConfig;
use ad_event_bus::{EventBus, SharedEventBus};
use ad_plugin::SharedPluginManager;
use ad_scheduler::{Fired, ScheduleAction, ScheduleRequest, Scheduler, SharedScheduler};
use ad_sequences::{Sequences, SharedSequences};
use ad_service_registry::{ServiceRegistry, SharedServiceRegistry};
use ad_state_store::{NamespaceStorage, SharedStateStore, StateStore};
use ad_threading::{PoolConfig, SharedWorkerPool, WorkItem, WorkKind, WorkerPool};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Everything below the app manager, shared by reference
///
/// Holds no apps, so app objects can keep it alive through their
/// [`crate::Adapi`] without forming a cycle.
pub struct Kernel {
    pub config: AppDaemonConfig,
    pub tz: Tz,
    pub clock: SharedClock,
    pub bus: SharedEventBus,
    pub plugins: SharedPluginManager,
    pub state: SharedStateStore,
    pub services: SharedServiceRegistry,
    pub callbacks: SharedCallbackRegistry,
    pub scheduler: SharedScheduler,
    pub pool: SharedWorkerPool,
    pub sequences: SharedSequences,
    pub booted: DateTime<Utc>,
}

impl Kernel {
    /// Build every subsystem; must run inside a tokio runtime
    pub fn new(
        config: AppDaemonConfig,
        clock: SharedClock,
        plugins: SharedPluginManager,
    ) -> RuntimeResult<Arc<Self>> {
        let tz = config.tz()?;
        let sun = SunCalculator::new(config.latitude, config.longitude, config.elevation)?;

        let bus = Arc::new(EventBus::new());
        let state = Arc::new(
            StateStore::new(bus.clone(), plugins.clone(), clock.clone())
                .with_storage(NamespaceStorage::new(&config.config_dir)),
        );
        let services = Arc::new(ServiceRegistry::new(plugins.clone()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let scheduler = Arc::new(Scheduler::new(clock.clone(), sun, tz));
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            threads: config.total_threads,
            pin_apps: config.pin_apps,
            pin_threads: config.pin_threads(),
            slow_callback_warning: config.thread_duration_warning(),
        }));
        let sequences = Arc::new(Sequences::new(
            state.clone(),
            services.clone(),
            bus.clone(),
            clock.clone(),
        ));
        sequences.register_services();

        let booted = clock.now();
        Ok(Arc::new(Self {
            config,
            tz,
            clock,
            bus,
            plugins,
            state,
            services,
            callbacks,
            scheduler,
            pool,
            sequences,
            booted,
        }))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Queue work, logging when the slot refuses it
    pub fn dispatch(&self, item: WorkItem) {
        let app = item.app.clone();
        let name = item.name.clone();
        match self.pool.dispatch(item) {
            Ok(slot) => trace!(app = %app, callback = %name, slot, "Dispatched"),
            Err(e) => warn!(app = %app, callback = %name, error = %e, "Unable to dispatch callback"),
        }
    }

    /// Act on the outcome of a match
    ///
    /// Timers are cancelled first so a retracted `duration` never fires, then
    /// new `duration` timers are armed, then callbacks are queued in match
    /// order.
    pub fn route(&self, matches: Matches) {
        if matches.is_empty() {
            return;
        }
        for timer in &matches.cancel_timers {
            if self.scheduler.cancel(timer) {
                trace!(timer = %timer, "Cancelled timer");
            }
        }

        let now = self.now();
        for arm in matches.arm {
            let request = ScheduleRequest::at(
                arm.app.clone(),
                now + arm.fire_in,
                ScheduleAction::StateDuration {
                    listener: arm.listener.clone(),
                    namespace: arm.namespace,
                    entity_id: arm.entity_id,
                },
            )
            .with_id(arm.timer);
            if let Err(e) = self.scheduler.insert(request) {
                warn!(app = %arm.app, listener = %arm.listener, error = %e, "Unable to arm duration timer");
            }
        }

        for d in matches.dispatch {
            self.dispatch(
                WorkItem::new(d.app, WorkKind::from(d.kind), d.handle, d.invocation).pinning(d.pinning),
            );
        }
    }

    /// Expire a listener after `timeout`
    pub fn arm_timeout(&self, app: &str, handle: &str, timeout: chrono::Duration) -> Option<String> {
        let request = ScheduleRequest::at(
            app,
            self.now() + timeout,
            ScheduleAction::ListenerTimeout {
                listener: handle.to_string(),
            },
        );
        match self.scheduler.insert(request) {
            Ok(timer) => {
                self.callbacks.set_timeout_timer(handle, timer.clone());
                Some(timer)
            }
            Err(e) => {
                warn!(app, handle, error = %e, "Unable to arm listener timeout");
                None
            }
        }
    }

    /// Run what the scheduler found due
    pub fn process_fired(&self, fired: Vec<Fired>) {
        for f in fired {
            match f.action {
                ScheduleAction::Timer(callback) => {
                    let invocation = callback.bind(TimerArgs { kwargs: f.kwargs });
                    self.dispatch(
                        WorkItem::new(f.app, WorkKind::Schedule, f.id, invocation).pinning(f.pinning),
                    );
                }
                ScheduleAction::StateDuration {
                    listener,
                    namespace,
                    entity_id,
                } => {
                    let current = self.state.get_entity(&namespace, &entity_id);
                    self.route(self.callbacks.fire_duration(&listener, &f.id, current.as_ref()));
                }
                ScheduleAction::ListenerTimeout { listener } => {
                    if self.callbacks.expire(&listener) {
                        debug!(app = %f.app, listener = %listener, "Listener removed after timeout");
                    }
                }
            }
        }
    }

    /// Drop every timer tied to removed callback records
    pub fn cancel_record_timers<'a, I>(&self, timers: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for timer in timers {
            self.scheduler.cancel(timer);
        }
    }
}
