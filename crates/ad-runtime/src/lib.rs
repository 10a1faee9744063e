//! Automation runtime
//!
//! Ties the subsystems together. The [`Kernel`] holds the shared services
//! (bus, state, scheduler, callbacks, workers, sequences); the
//! [`AppManagement`] keeps app objects in step with the config files; the
//! [`AppDaemon`] supervises both and runs the utility loop.
//!
//! # Key Types
//!
//! - [`AppDaemon`] - startup, utility loop, shutdown
//! - [`Adapi`] - what an app uses to talk to the runtime
//! - [`App`] - the trait user apps implement
//! - [`AppRegistry`] - compiled-in app classes by module and class name

pub mod admin;
mod api;
mod app;
mod app_management;
mod appdaemon;
mod error;
mod kernel;
mod router;
mod services;

pub use api::{Adapi, ERROR_LOG, MAIN_LOG};
pub use app::{downcast_app, App, AppFactory, AppRegistry, AppStatus, AsAny};
pub use app_management::{AppManagement, ManagedApp};
pub use appdaemon::{AppDaemon, MEMORY_PLUGIN};
pub use error::{ApiError, ApiResult, AppError, AppResult, RuntimeError, RuntimeResult};
pub use kernel::Kernel;
pub use router::EventRouter;

// Types apps need in their own code
pub use ad_callbacks::{
    Callback, Condition, EventArgs, EventOptions, LogArgs, LogLevel, LogOptions, StateArgs,
    StateOptions, TimerArgs,
};
pub use ad_config::{AppDaemonConfig, SequenceRef};
pub use ad_core::{EntityState, Event, StateUpdate};
pub use ad_dependency::UpdateMode;
pub use ad_scheduler::TimerOptions;
pub use ad_state_store::StateQuery;
