use ad_callbacks::CallbackError;
use ad_clock::SunError;
use ad_config::ConfigError;
use ad_dependency::DependencyError;
use ad_plugin::PluginError;
use ad_scheduler::SchedulerError;
use ad_sequences::SequenceError;
use ad_service_registry::ServiceError;
use ad_state_store::StateError;
use ad_threading::ThreadError;
use thiserror::Error;

/// Result type for app lifecycle operations
pub type AppResult<T> = Result<T, AppError>;

/// Why an app could not be loaded, started or stopped
#[derive(Debug, Error)]
pub enum AppError {
    #[error("class '{class}' not found in module '{module}'")]
    ClassNotFound { module: String, class: String },

    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("class '{class}' in module '{module}' could not be constructed: {reason}")]
    ClassSignature {
        module: String,
        class: String,
        reason: String,
    },

    #[error("app '{app}' failed to initialize: {source:#}")]
    Initialize {
        app: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("app '{app}' asked for thread {pin} but only {threads} exist")]
    PinOutOfRange {
        app: String,
        pin: usize,
        threads: usize,
    },

    #[error("app '{app}' depends on '{dependency}', which is not running")]
    DependencyNotRunning { app: String, dependency: String },

    #[error("app '{app}' depends on global module '{module}', which is not loaded")]
    GlobalNotLoaded { app: String, module: String },

    #[error("no app named '{0}'")]
    UnknownApp(String),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for the per-app API
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors returned to apps by [`crate::Adapi`]
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),

    #[error(transparent)]
    Thread(#[from] ThreadError),

    #[error("unknown namespace '{0}'")]
    NamespaceNotFound(String),

    #[error("no timer with handle {0}")]
    TimerNotFound(String),

    #[error("handle {handle} belongs to app '{owner}'")]
    NotOwner { handle: String, owner: String },

    #[error("service must be given as 'domain/service', got '{0}'")]
    BadServiceName(String),

    #[error("the runtime has shut down")]
    Stopped,
}

/// Result type for building and running the supervisor
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Failures while constructing or starting the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Sun(#[from] SunError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    App(#[from] AppError),

    #[error("plugin '{name}' has unknown type '{plugin_type}'")]
    UnknownPluginType { name: String, plugin_type: String },
}
