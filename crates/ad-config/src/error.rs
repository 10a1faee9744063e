use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not valid YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no secret named '{key}'")]
    SecretNotFound { key: String },

    #[error("cannot include '{path}': {reason}")]
    InvalidIncludePath { path: String, reason: String },

    /// A file includes itself, directly or through others
    #[error("{path} includes itself")]
    CircularInclude { path: PathBuf },

    #[error("${var} is not set")]
    EnvVarNotFound { var: String },

    #[error("{key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// Cross-field checks on the runtime config
    #[error("invalid runtime config: {message}")]
    ValidationFailed { message: String },

    #[error("app '{name}': {reason}")]
    BadAppConfig { name: String, reason: String },

    #[error("sequence '{name}': {reason}")]
    BadSequence { name: String, reason: String },
}
