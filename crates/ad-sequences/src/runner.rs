use crate::wait::{seconds, wait_for_state};
use crate::{SequenceError, SequenceResult};
use ad_clock::SharedClock;
use ad_config::sequence::{parse_steps, steps_to_value};
use ad_config::{SequenceConfig, SequenceRef, SequenceStep};
use ad_core::{StateUpdate, RULES};
use ad_event_bus::SharedEventBus;
use ad_service_registry::{ServiceCall, ServiceError, SharedServiceRegistry};
use ad_state_store::SharedStateStore;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

pub const ACTIVE: &str = "active";
pub const IDLE: &str = "idle";

/// Caller name used for runs started through the `sequence/run` service
pub const SERVICE_CALLER: &str = "_services";

/// Entity id for a sequence given as `sequence.<name>` or a bare name
pub fn sequence_entity(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("sequence.{name}")
    }
}

/// A started sequence run
pub struct SequenceHandle {
    pub entity_id: String,
    task: JoinHandle<()>,
}

impl SequenceHandle {
    /// Wait for the run to finish or be cancelled
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            warn!(entity_id = %self.entity_id, error = %e, "Sequence task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Running {
    run: u64,
    cancel: oneshot::Sender<()>,
}

/// Sequence entities in `rules` and the tasks running them
pub struct Sequences {
    state: SharedStateStore,
    services: SharedServiceRegistry,
    bus: SharedEventBus,
    clock: SharedClock,
    running: DashMap<String, Running>,
    /// Apps that started each named sequence
    callers: DashMap<String, BTreeSet<String>>,
    next_run: AtomicU64,
}

pub type SharedSequences = Arc<Sequences>;

impl Sequences {
    pub fn new(
        state: SharedStateStore,
        services: SharedServiceRegistry,
        bus: SharedEventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            state,
            services,
            bus,
            clock,
            running: DashMap::new(),
            callers: DashMap::new(),
            next_run: AtomicU64::new(1),
        }
    }

    /// Register `sequence/run` and `sequence/cancel` in `rules`
    pub fn register_services(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.services.register(RULES, "sequence", "run", move |call| {
            let weak = weak.clone();
            async move { run_service(weak, call).await }
        });
        let weak = Arc::downgrade(self);
        self.services.register(RULES, "sequence", "cancel", move |call| {
            let weak = weak.clone();
            async move {
                let sequences = upgrade(&weak)?;
                let targets: Vec<String> = match call.data.get("entity_id") {
                    Some(Value::String(s)) => vec![s.clone()],
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                    _ => return Err(ServiceError::InvalidData("entity_id is required".into())),
                };
                for target in targets {
                    sequences.cancel_sequence(&target).await;
                }
                Ok(None)
            }
        });
    }

    /// Create or replace the entity of each configured sequence
    ///
    /// A replaced definition keeps the entity's current state, so a run in
    /// progress still reads as active.
    pub async fn update_sequence_entities<'a, I>(&self, sequences: I) -> SequenceResult<()>
    where
        I: IntoIterator<Item = &'a SequenceConfig>,
    {
        for seq in sequences {
            let entity_id = seq.entity_id();
            let mut attributes = IndexMap::new();
            attributes.insert(
                "friendly_name".to_string(),
                json!(seq.friendly_name.as_deref().unwrap_or(&seq.name)),
            );
            attributes.insert("loop".to_string(), json!(seq.looping));
            attributes.insert("hot_reload".to_string(), json!(seq.hot_reload));
            attributes.insert("namespace".to_string(), json!(seq.namespace));
            attributes.insert("steps".to_string(), steps_to_value(&seq.steps));

            if self.state.entity_exists(RULES, &entity_id) {
                let update = StateUpdate {
                    attributes: Some(attributes),
                    replace: true,
                    ..Default::default()
                };
                self.state.set_state(RULES, &entity_id, update, true).await?;
                debug!(entity_id = %entity_id, "Sequence definition replaced");
            } else {
                self.state
                    .add_entity(RULES, &entity_id, json!(IDLE), attributes)
                    .await?;
                info!(entity_id = %entity_id, "Sequence added");
            }
        }
        Ok(())
    }

    /// Cancel and drop sequences by name
    pub async fn remove_sequences<'a, I>(&self, names: I) -> SequenceResult<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for name in names {
            let entity_id = sequence_entity(name);
            self.cancel_sequence(&entity_id).await;
            self.callers.remove(&entity_id);
            self.state.remove_entity(RULES, &entity_id).await?;
            info!(entity_id = %entity_id, "Sequence removed");
        }
        Ok(())
    }

    pub fn sequence_exists(&self, name: &str) -> bool {
        self.state.entity_exists(RULES, &sequence_entity(name))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(&sequence_entity(name))
    }

    pub fn running_sequences(&self) -> BTreeSet<String> {
        self.running.iter().map(|r| r.key().clone()).collect()
    }

    /// Apps that have run a sequence, for hot reload
    pub fn callers(&self, name: &str) -> BTreeSet<String> {
        self.callers
            .get(&sequence_entity(name))
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Start a run
    ///
    /// An inline list gets a throwaway `sequence.<uuid>` entity that is
    /// removed when the run ends. Starting a named sequence that is already
    /// running cancels the earlier run.
    #[instrument(skip(self, target), fields(app = %calling_app))]
    pub async fn run_sequence(
        self: &Arc<Self>,
        calling_app: &str,
        namespace: &str,
        target: SequenceRef,
    ) -> SequenceResult<SequenceHandle> {
        let (entity_id, steps, looping, namespace, ephemeral) = match target {
            SequenceRef::Named(name) => {
                let entity_id = sequence_entity(&name);
                let (steps, looping, seq_namespace) = self.load(&entity_id)?;
                if calling_app != SERVICE_CALLER {
                    self.callers
                        .entry(entity_id.clone())
                        .or_default()
                        .insert(calling_app.to_string());
                }
                let namespace = seq_namespace.unwrap_or_else(|| namespace.to_string());
                (entity_id, steps, looping, namespace, false)
            }
            SequenceRef::Inline(steps) => {
                let entity_id = format!("sequence.{}", uuid::Uuid::new_v4().simple());
                let mut attributes = IndexMap::new();
                attributes.insert("steps".to_string(), steps_to_value(&steps));
                self.state
                    .add_entity(RULES, &entity_id, json!(ACTIVE), attributes)
                    .await?;
                (entity_id, steps, false, namespace.to_string(), true)
            }
        };

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();
        if let Some(previous) = self.running.insert(entity_id.clone(), Running { run, cancel }) {
            info!(entity_id = %entity_id, "Sequence restarted, cancelling earlier run");
            drop(previous);
        }

        let this = self.clone();
        let task_entity = entity_id.clone();
        let task = tokio::spawn(async move {
            this.execute(run, task_entity, steps, looping, namespace, ephemeral, cancelled)
                .await;
        });
        Ok(SequenceHandle { entity_id, task })
    }

    /// Stop a running sequence at its next suspension point
    pub async fn cancel_sequence(&self, name: &str) -> bool {
        let entity_id = sequence_entity(name);
        match self.running.remove(&entity_id) {
            Some((_, running)) => {
                debug!(entity_id = %entity_id, "Cancelling sequence");
                let _ = running.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Cancel every running sequence
    pub async fn cancel_all(&self) {
        for entity_id in self.running_sequences() {
            self.cancel_sequence(&entity_id).await;
        }
    }

    fn load(&self, entity_id: &str) -> SequenceResult<(Vec<SequenceStep>, bool, Option<String>)> {
        let record = self
            .state
            .get_entity(RULES, entity_id)
            .ok_or_else(|| SequenceError::NotFound(entity_id.to_string()))?;
        let steps = record
            .attribute("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| SequenceError::BadSequence {
                name: entity_id.to_string(),
                reason: "no steps".to_string(),
            })?;
        let steps = parse_steps(steps)?;
        let looping = record
            .attribute("loop")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let namespace = record
            .attribute("namespace")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok((steps, looping, namespace))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        self: Arc<Self>,
        run: u64,
        entity_id: String,
        steps: Vec<SequenceStep>,
        looping: bool,
        namespace: String,
        ephemeral: bool,
        cancelled: oneshot::Receiver<()>,
    ) {
        let active = StateUpdate::state(ACTIVE).with_attribute("running_namespace", namespace.clone());
        if let Err(e) = self.state.set_state(RULES, &entity_id, active, true).await {
            warn!(entity_id = %entity_id, error = %e, "Unable to mark sequence active");
        }

        let body = async {
            loop {
                let mut stack = vec![entity_id.clone()];
                self.do_steps(&entity_id, &namespace, &steps, &mut stack).await?;
                if !looping {
                    break;
                }
            }
            Ok::<(), SequenceError>(())
        };

        tokio::select! {
            result = body => match result {
                Ok(()) => debug!(entity_id = %entity_id, "Sequence finished"),
                Err(e) => error!(entity_id = %entity_id, error = %e, "Sequence stopped"),
            },
            _ = cancelled => info!(entity_id = %entity_id, "Sequence cancelled"),
        }

        // A newer run of the same sequence owns the entity from here on
        let superseded = self
            .running
            .get(&entity_id)
            .map(|r| r.run != run)
            .unwrap_or(false);
        self.running.remove_if(&entity_id, |_, r| r.run == run);
        if superseded {
            return;
        }

        if ephemeral {
            if let Err(e) = self.state.remove_entity(RULES, &entity_id).await {
                warn!(entity_id = %entity_id, error = %e, "Unable to remove inline sequence");
            }
        } else if let Err(e) = self
            .state
            .set_state(RULES, &entity_id, StateUpdate::state(IDLE), true)
            .await
        {
            warn!(entity_id = %entity_id, error = %e, "Unable to mark sequence idle");
        }
    }

    fn do_steps<'a>(
        &'a self,
        sequence: &'a str,
        namespace: &'a str,
        steps: &'a [SequenceStep],
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, SequenceResult<()>> {
        async move {
            for step in steps {
                match step {
                    SequenceStep::Sleep(secs) => {
                        debug!(sequence, seconds = secs, "Sleeping");
                        self.sleep(*secs).await;
                    }
                    SequenceStep::Service {
                        domain,
                        service,
                        namespace: step_ns,
                        loop_step,
                        data,
                    } => {
                        let ns = step_ns.as_deref().unwrap_or(namespace);
                        let data = Value::Object(data.clone().into_iter().collect());
                        let (times, interval) = loop_step
                            .as_ref()
                            .map(|l| (l.times, l.interval))
                            .unwrap_or((1, 0.0));
                        for i in 0..times {
                            debug!(sequence, namespace = ns, domain = %domain, service = %service, "Calling service");
                            self.services.call(ns, domain, service, data.clone()).await?;
                            if i + 1 < times && interval > 0.0 {
                                self.sleep(interval).await;
                            }
                        }
                    }
                    SequenceStep::WaitState(wait) => {
                        let ns = wait.namespace.as_deref().unwrap_or(namespace);
                        match wait_for_state(&self.state, &self.bus, &self.clock, ns, wait).await {
                            Ok(()) => {}
                            Err(e @ SequenceError::Timeout { .. }) => {
                                warn!(sequence, error = %e, "wait_state timed out, continuing");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    SequenceStep::Sequence {
                        target,
                        namespace: step_ns,
                    } => {
                        let ns = step_ns.as_deref().unwrap_or(namespace);
                        match target {
                            SequenceRef::Inline(inner) => {
                                self.do_steps(sequence, ns, inner, stack).await?;
                            }
                            SequenceRef::Named(name) => {
                                let nested = sequence_entity(name);
                                if stack.contains(&nested) {
                                    return Err(SequenceError::Recursive(nested));
                                }
                                let (inner, _, _) = self.load(&nested)?;
                                stack.push(nested);
                                self.do_steps(sequence, ns, &inner, stack).await?;
                                stack.pop();
                            }
                        }
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn sleep(&self, secs: f64) {
        let until = self.clock.now() + seconds(secs);
        self.clock.sleep_until(until).await;
    }
}

fn upgrade(weak: &Weak<Sequences>) -> Result<Arc<Sequences>, ServiceError> {
    weak.upgrade()
        .ok_or_else(|| ServiceError::CallFailed("sequences are shutting down".into()))
}

async fn run_service(weak: Weak<Sequences>, call: ServiceCall) -> ad_service_registry::ServiceResult {
    let sequences = upgrade(&weak)?;
    let namespace = call
        .data
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or(ad_core::DEFAULT)
        .to_string();
    let target = match call.data.get("entity_id") {
        Some(Value::String(name)) => SequenceRef::Named(name.clone()),
        Some(Value::Array(steps)) => SequenceRef::Inline(
            parse_steps(steps).map_err(|e| ServiceError::InvalidData(e.to_string()))?,
        ),
        _ => {
            warn!("entity_id not given in sequence/run call");
            return Err(ServiceError::InvalidData("entity_id is required".into()));
        }
    };
    let handle = sequences
        .run_sequence(SERVICE_CALLER, &namespace, target)
        .await
        .map_err(|e| ServiceError::CallFailed(e.to_string()))?;
    Ok(Some(json!({ "entity_id": handle.entity_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_clock::SystemClock;
    use ad_core::{Writeback, DEFAULT};
    use ad_event_bus::EventBus;
    use ad_plugin::PluginManager;
    use ad_service_registry::ServiceRegistry;
    use ad_state_store::StateStore;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        sequences: SharedSequences,
        state: SharedStateStore,
        calls: Arc<AtomicUsize>,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::new());
        let plugins = Arc::new(PluginManager::new());
        let clock: SharedClock = Arc::new(SystemClock);
        let state = Arc::new(StateStore::new(bus.clone(), plugins.clone(), clock.clone()));
        state.init_namespace(DEFAULT, Writeback::None).await.unwrap();
        state.init_namespace(RULES, Writeback::None).await.unwrap();

        let services = Arc::new(ServiceRegistry::new(plugins));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        services.register(DEFAULT, "light", "turn_on", move |_call| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });

        let sequences = Arc::new(Sequences::new(state.clone(), services, bus, clock));
        sequences.register_services();
        Fixture {
            sequences,
            state,
            calls,
        }
    }

    fn config(name: &str, steps: Value) -> SequenceConfig {
        let value = json!({ "steps": steps });
        SequenceConfig::from_value(name, &value, PathBuf::from("apps.yaml")).unwrap()
    }

    fn state_of(f: &Fixture, entity_id: &str) -> Option<Value> {
        f.state.get_entity(RULES, entity_id).map(|e| e.state)
    }

    #[tokio::test]
    async fn test_named_sequence_runs_and_returns_idle() {
        let f = fixture().await;
        let seq = config(
            "lights",
            json!([{"light/turn_on": {"entity_id": "light.hall", "loop_step": {"times": 3, "interval": 0.01}}}]),
        );
        f.sequences.update_sequence_entities([&seq]).await.unwrap();
        assert_eq!(state_of(&f, "sequence.lights"), Some(json!(IDLE)));

        let handle = f
            .sequences
            .run_sequence("hall_app", DEFAULT, SequenceRef::Named("lights".into()))
            .await
            .unwrap();
        handle.wait().await;

        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        assert_eq!(state_of(&f, "sequence.lights"), Some(json!(IDLE)));
        assert!(f.sequences.callers("lights").contains("hall_app"));
    }

    #[tokio::test]
    async fn test_inline_wait_timeout_continues_and_cleans_up() {
        let f = fixture().await;
        let steps = parse_steps(
            json!([
                {"wait_state": {"entity_id": "sensor.x", "state": "done", "timeout": 0.1}},
                {"light/turn_on": {}}
            ])
            .as_array()
            .unwrap(),
        )
        .unwrap();

        let handle = f
            .sequences
            .run_sequence("app", DEFAULT, SequenceRef::Inline(steps))
            .await
            .unwrap();
        let entity_id = handle.entity_id.clone();
        assert_eq!(state_of(&f, &entity_id), Some(json!(ACTIVE)));
        handle.wait().await;

        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(!f.state.entity_exists(RULES, &entity_id));
    }

    #[tokio::test]
    async fn test_wait_state_released_by_change() {
        let f = fixture().await;
        let seq = config(
            "door",
            json!([
                {"wait_state": {"entity_id": "sensor.door", "state": "open", "timeout": 5}},
                {"light/turn_on": {}}
            ]),
        );
        f.sequences.update_sequence_entities([&seq]).await.unwrap();
        let handle = f
            .sequences
            .run_sequence("app", DEFAULT, SequenceRef::Named("sequence.door".into()))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        f.state
            .set_state(DEFAULT, "sensor.door", StateUpdate::state("open"), true)
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), handle.wait())
            .await
            .unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let f = fixture().await;
        let seq = config("slow", json!([{"sleep": 30}, {"light/turn_on": {}}]));
        f.sequences.update_sequence_entities([&seq]).await.unwrap();
        let handle = f
            .sequences
            .run_sequence("app", DEFAULT, SequenceRef::Named("slow".into()))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(f.sequences.is_running("slow"));
        assert_eq!(state_of(&f, "sequence.slow"), Some(json!(ACTIVE)));

        assert!(f.sequences.cancel_sequence("sequence.slow").await);
        tokio::time::timeout(std::time::Duration::from_secs(2), handle.wait())
            .await
            .unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state_of(&f, "sequence.slow"), Some(json!(IDLE)));
        assert!(!f.sequences.is_running("slow"));
    }

    #[tokio::test]
    async fn test_self_reference_is_rejected() {
        let f = fixture().await;
        let seq = config("again", json!([{"light/turn_on": {}}, {"sequence": "sequence.again"}]));
        f.sequences.update_sequence_entities([&seq]).await.unwrap();
        let handle = f
            .sequences
            .run_sequence("app", DEFAULT, SequenceRef::Named("again".into()))
            .await
            .unwrap();
        handle.wait().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&f, "sequence.again"), Some(json!(IDLE)));
    }

    #[tokio::test]
    async fn test_run_through_service() {
        let f = fixture().await;
        let seq = config("svc", json!([{"light/turn_on": {}}]));
        f.sequences.update_sequence_entities([&seq]).await.unwrap();

        let result = f
            .sequences
            .services
            .call(RULES, "sequence", "run", json!({"entity_id": "sequence.svc"}))
            .await
            .unwrap();
        assert_eq!(result, Some(json!({"entity_id": "sequence.svc"})));

        for _ in 0..50 {
            if f.calls.load(Ordering::SeqCst) == 1 && !f.sequences.is_running("svc") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.sequences.callers("svc").is_empty());
    }

    #[tokio::test]
    async fn test_remove_sequence() {
        let f = fixture().await;
        let seq = config("gone", json!([{"sleep": 1}]));
        f.sequences.update_sequence_entities([&seq]).await.unwrap();
        f.sequences.remove_sequences(["gone"]).await.unwrap();
        assert!(!f.sequences.sequence_exists("gone"));
    }
}
