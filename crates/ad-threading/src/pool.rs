//! Worker slots
//!
//! Each slot is a tokio task draining an unbounded FIFO. Synchronous
//! callbacks go to the blocking pool and the slot waits for them, so work
//! on one slot never overlaps. Async callbacks are awaited in place.

use crate::{ThreadError, ThreadResult, WorkKind};
use ad_callbacks::{Invocation, Pinning};
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pool sizing and pinning defaults
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub threads: usize,
    /// Apps pin to a slot unless they opt out
    pub pin_apps: bool,
    /// Slots available for round-robin app pinning
    pub pin_threads: usize,
    pub slow_callback_warning: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: 10,
            pin_apps: true,
            pin_threads: 10,
            slow_callback_warning: Duration::from_secs(10),
        }
    }
}

/// One unit of work
pub struct WorkItem {
    pub app: String,
    pub kind: WorkKind,
    /// Shown as the slot's current callback
    pub name: String,
    pub pinning: Pinning,
    pub invocation: Invocation,
    done: Option<oneshot::Sender<anyhow::Result<()>>>,
}

impl WorkItem {
    pub fn new(
        app: impl Into<String>,
        kind: WorkKind,
        name: impl Into<String>,
        invocation: Invocation,
    ) -> Self {
        Self {
            app: app.into(),
            kind,
            name: name.into(),
            pinning: Pinning::default(),
            invocation,
            done: None,
        }
    }

    pub fn pinning(mut self, pinning: Pinning) -> Self {
        self.pinning = pinning;
        self
    }
}

/// Point-in-time view of a slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub id: usize,
    pub q: usize,
    /// Running callback, `idle` when none
    pub callback: String,
    pub last_callback: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct AppPin {
    pin_app: bool,
    slot: Option<usize>,
}

#[derive(Default)]
struct SlotState {
    q: AtomicUsize,
    current: Mutex<Option<String>>,
    last: Mutex<Option<String>>,
}

impl SlotState {
    fn set_current(&self, name: Option<String>) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = current.take() {
            *self
                .last
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(previous);
        }
        *current = name;
    }
}

struct Slot {
    id: usize,
    tx: mpsc::UnboundedSender<WorkItem>,
    state: Arc<SlotState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded set of FIFO executors with per-app pinning
pub struct WorkerPool {
    slots: RwLock<Vec<Arc<Slot>>>,
    apps: DashMap<String, AppPin>,
    next_pin: AtomicUsize,
    next_free: AtomicUsize,
    config: PoolConfig,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn execute(invocation: Invocation) -> anyhow::Result<()> {
    match invocation {
        Invocation::Blocking(f) => match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "callback panicked: {}",
                panic_message(e.into_panic())
            )),
            Err(e) => Err(anyhow::anyhow!("callback task failed: {e}")),
        },
        Invocation::Async(fut) => match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "callback panicked: {}",
                panic_message(payload)
            )),
        },
    }
}

async fn run_slot(
    id: usize,
    state: Arc<SlotState>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    slow: Duration,
) {
    while let Some(item) = rx.recv().await {
        let label = format!("{}.{}", item.app, item.name);
        state.set_current(Some(label.clone()));
        let started = Instant::now();

        let result = execute(item.invocation).await;

        let elapsed = started.elapsed();
        if elapsed > slow {
            warn!(
                slot = id,
                callback = %label,
                elapsed_ms = elapsed.as_millis() as u64,
                "Callback took longer than {}s",
                slow.as_secs_f64()
            );
        }
        if let Err(e) = &result {
            error!(
                slot = id,
                app = %item.app,
                kind = %item.kind,
                callback = %label,
                "Error in callback: {e:#}"
            );
        }

        state.q.fetch_sub(1, Ordering::SeqCst);
        state.set_current(None);
        if let Some(done) = item.done {
            let _ = done.send(result);
        }
    }
    debug!(slot = id, "Worker slot stopped");
}

impl WorkerPool {
    /// Create the pool and start its slots; must run inside a tokio runtime
    pub fn new(config: PoolConfig) -> Self {
        let pool = Self {
            slots: RwLock::new(Vec::new()),
            apps: DashMap::new(),
            next_pin: AtomicUsize::new(0),
            next_free: AtomicUsize::new(0),
            config,
        };
        pool.grow(pool.config.threads.max(1));
        info!(threads = pool.size(), pin_apps = pool.config.pin_apps, "Worker pool started");
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Slot>>> {
        self.slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add slots until there are `total`; never shrinks
    pub fn grow(&self, total: usize) -> usize {
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while slots.len() < total {
            let id = slots.len();
            let (tx, rx) = mpsc::unbounded_channel();
            let state = Arc::new(SlotState::default());
            let handle = tokio::spawn(run_slot(
                id,
                state.clone(),
                rx,
                self.config.slow_callback_warning,
            ));
            slots.push(Arc::new(Slot {
                id,
                tx,
                state,
                handle: Mutex::new(Some(handle)),
            }));
            debug!(slot = id, "Added worker slot");
        }
        slots.len()
    }

    /// Reject slot numbers outside the pool
    pub fn validate_pin(&self, slot: usize) -> ThreadResult<()> {
        let size = self.size();
        if slot >= size {
            return Err(ThreadError::PinOutOfRange { pin: slot, size });
        }
        Ok(())
    }

    /// Record an app's pinning, returning its default slot when pinned
    ///
    /// Pinned apps without an explicit slot get one round-robin across the
    /// first `pin_threads` slots.
    pub fn register_app(
        &self,
        app: &str,
        pin_app: Option<bool>,
        pin_thread: Option<usize>,
    ) -> ThreadResult<Option<usize>> {
        if let Some(slot) = pin_thread {
            self.validate_pin(slot)?;
        }
        let pin_app = pin_app.unwrap_or(self.config.pin_apps);
        let slot = match (pin_app, pin_thread) {
            (_, Some(slot)) => Some(slot),
            (true, None) => {
                let span = self.config.pin_threads.clamp(1, self.size().max(1));
                Some(self.next_pin.fetch_add(1, Ordering::SeqCst) % span)
            }
            (false, None) => None,
        };
        self.apps.insert(app.to_string(), AppPin { pin_app, slot });
        debug!(app, ?slot, pin_app, "Registered app pinning");
        Ok(slot)
    }

    pub fn unregister_app(&self, app: &str) {
        self.apps.remove(app);
    }

    pub fn app_slot(&self, app: &str) -> Option<usize> {
        self.apps.get(app).and_then(|p| p.slot)
    }

    fn hash_slot(app: &str, size: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        app.hash(&mut hasher);
        (hasher.finish() % size.max(1) as u64) as usize
    }

    /// Pick the slot for a callback
    pub fn route(&self, app: &str, pinning: Pinning) -> ThreadResult<usize> {
        let size = self.size();
        if let Some(slot) = pinning.pin_thread {
            self.validate_pin(slot)?;
            return Ok(slot);
        }
        let registered = self.apps.get(app).map(|p| *p);
        let pin = pinning
            .pin
            .unwrap_or_else(|| registered.map_or(self.config.pin_apps, |p| p.pin_app));
        if pin {
            Ok(registered
                .and_then(|p| p.slot)
                .filter(|s| *s < size)
                .unwrap_or_else(|| Self::hash_slot(app, size)))
        } else {
            Ok(self.next_free.fetch_add(1, Ordering::SeqCst) % size.max(1))
        }
    }

    fn enqueue(&self, slot: usize, item: WorkItem) -> ThreadResult<()> {
        let slots = self.read();
        let target = slots.get(slot).ok_or(ThreadError::PinOutOfRange {
            pin: slot,
            size: slots.len(),
        })?;
        target.state.q.fetch_add(1, Ordering::SeqCst);
        if target.tx.send(item).is_err() {
            target.state.q.fetch_sub(1, Ordering::SeqCst);
            return Err(ThreadError::Closed(target.id));
        }
        Ok(())
    }

    /// Queue work on its routed slot
    pub fn dispatch(&self, item: WorkItem) -> ThreadResult<usize> {
        let slot = self.route(&item.app, item.pinning)?;
        self.enqueue(slot, item)?;
        Ok(slot)
    }

    /// Queue work and get its outcome once it has run
    pub fn dispatch_with_result(
        &self,
        mut item: WorkItem,
    ) -> ThreadResult<oneshot::Receiver<anyhow::Result<()>>> {
        let (tx, rx) = oneshot::channel();
        item.done = Some(tx);
        self.dispatch(item)?;
        Ok(rx)
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.read()
            .iter()
            .map(|slot| {
                let current = slot
                    .state
                    .current
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                let last = slot
                    .state
                    .last
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                SlotStatus {
                    id: slot.id,
                    q: slot.state.q.load(Ordering::SeqCst),
                    callback: current.unwrap_or_else(|| "idle".to_string()),
                    last_callback: last,
                }
            })
            .collect()
    }

    pub fn queue_size(&self, slot: usize) -> usize {
        self.read()
            .get(slot)
            .map(|s| s.state.q.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_queued(&self) -> usize {
        self.read()
            .iter()
            .map(|s| s.state.q.load(Ordering::SeqCst))
            .sum()
    }

    /// Stop accepting work and wait for queued work to drain
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<Slot>> = std::mem::take(
            &mut *self
                .slots
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let mut handles = Vec::with_capacity(slots.len());
        for slot in slots {
            let handle = slot
                .handle
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            handles.extend(handle);
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("Worker pool stopped");
    }
}

/// Thread-safe wrapper for WorkerPool
pub type SharedWorkerPool = Arc<WorkerPool>;
