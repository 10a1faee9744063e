//! Worker pool and dispatcher
//!
//! - [`WorkerPool`] - N FIFO slots, pin routing, sync and async execution
//! - [`QueueMonitor`] - throttled starvation warnings driven by the utility loop

mod monitor;
mod pool;

pub use monitor::QueueMonitor;
pub use pool::{PoolConfig, SharedWorkerPool, SlotStatus, WorkItem, WorkerPool};

use ad_callbacks::CallbackKind;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for pool operations
pub type ThreadResult<T> = Result<T, ThreadError>;

#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("pin_thread {pin} out of range, pool has {size} slots")]
    PinOutOfRange { pin: usize, size: usize },

    #[error("worker slot {0} is not accepting work")]
    Closed(usize),
}

/// What a unit of work was queued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkKind {
    State,
    Event,
    Log,
    Schedule,
    Init,
}

impl From<CallbackKind> for WorkKind {
    fn from(kind: CallbackKind) -> Self {
        match kind {
            CallbackKind::State => WorkKind::State,
            CallbackKind::Event => WorkKind::Event,
            CallbackKind::Log => WorkKind::Log,
            CallbackKind::Schedule => WorkKind::Schedule,
        }
    }
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkKind::State => "state",
            WorkKind::Event => "event",
            WorkKind::Log => "log",
            WorkKind::Schedule => "schedule",
            WorkKind::Init => "init",
        })
    }
}
