//! Sequences
//!
//! A sequence is an entity `sequence.<name>` in the `rules` namespace whose
//! attributes hold its steps. Running one spawns a task that walks the steps
//! against the runtime: sleeps on the runtime clock, service calls through the
//! service registry, waits on state changes, and nested sequences. The entity
//! reads `active` while the task runs and `idle` otherwise.
//!
//! # Key Types
//!
//! - [`Sequences`] - owns sequence entities and running tasks
//! - [`SequenceError`] - what can stop a step

mod runner;
mod wait;

pub use runner::{sequence_entity, SequenceHandle, Sequences, SharedSequences, ACTIVE, IDLE, SERVICE_CALLER};

use ad_service_registry::ServiceError;
use ad_state_store::StateError;
use thiserror::Error;

/// Result type for sequence operations
pub type SequenceResult<T> = Result<T, SequenceError>;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("bad sequence '{name}': {reason}")]
    BadSequence { name: String, reason: String },

    #[error("bad step in '{sequence}': {reason}")]
    BadStep { sequence: String, reason: String },

    #[error("unknown sequence '{0}'")]
    NotFound(String),

    #[error("timed out after {seconds}s waiting for {entity_id}")]
    Timeout { entity_id: String, seconds: f64 },

    #[error("sequence '{0}' runs itself")]
    Recursive(String),

    #[error("service call failed: {0}")]
    Service(#[from] ServiceError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

impl From<ad_config::ConfigError> for SequenceError {
    fn from(e: ad_config::ConfigError) -> Self {
        match e {
            ad_config::ConfigError::BadSequence { name, reason } => {
                SequenceError::BadSequence { name, reason }
            }
            other => SequenceError::BadSequence {
                name: String::new(),
                reason: other.to_string(),
            },
        }
    }
}
