//! Configuration for the automation runtime
//!
//! - [`AppDaemonConfig`] - the runtime config in `appdaemon.yaml`
//! - [`AllAppConfig`] / [`AppConfigFiles`] - app, global module and sequence declarations
//! - [`YamlLoader`] - YAML with `!include`, `!secret` and `!env_var`

pub mod app;
pub mod appdaemon;
pub mod error;
pub mod loader;
pub mod secrets;
pub mod sequence;

pub use app::{AllAppConfig, AppConfig, AppConfigFiles, GlobalModule, DEFAULT_PRIORITY};
pub use appdaemon::{AppDaemonConfig, NamespaceConfig, PluginConfig, CONFIG_FILE};
pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use secrets::Secrets;
pub use sequence::{LoopStep, MAX_STEP_SECONDS, SequenceConfig, SequenceRef, SequenceStep, WaitState};
