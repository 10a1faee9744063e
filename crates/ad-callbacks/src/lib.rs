//! Callback registry for apps
//!
//! - [`Callback`] / [`Invocation`] - sync or async user functions and their bound form
//! - [`StateOptions`], [`EventOptions`], [`LogOptions`] - what a registration matches on
//! - [`CallbackRegistry`] - every app's records behind one lock, plus matching

mod callback;
mod options;
mod registry;

pub use callback::{Callback, CallbackFuture, EventArgs, Invocation, LogArgs, StateArgs, TimerArgs};
pub use options::{Condition, EventOptions, LogLevel, LogOptions, Pinning, StateOptions};
pub use registry::{
    new_handle, CallbackInfo, CallbackKind, CallbackRecord, CallbackRegistry, Dispatch,
    DurationTimer, EventWatch, Listener, LogWatch, Matches, StateWatch, ALL_ATTRIBUTES,
};

use thiserror::Error;

/// Result type for registry operations
pub type CallbackResult<T> = Result<T, CallbackError>;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no callback with handle {0}")]
    NotFound(String),

    #[error("callback {handle} belongs to app '{owner}', not '{app}'")]
    NotOwner {
        handle: String,
        owner: String,
        app: String,
    },

    #[error("callback {handle} is a {actual} callback, not {expected}")]
    WrongKind {
        handle: String,
        expected: CallbackKind,
        actual: CallbackKind,
    },
}

/// Thread-safe wrapper for CallbackRegistry
pub type SharedCallbackRegistry = std::sync::Arc<CallbackRegistry>;
