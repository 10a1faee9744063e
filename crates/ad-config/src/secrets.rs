//! `secrets.yaml`: values substituted by the `!secret` tag
//!
//! Values keep their YAML type, so `port: !secret port` yields a number when
//! the secret is a number.

use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SECRETS_FILE: &str = "secrets.yaml";

#[derive(Debug, Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, Value>,
    source: Option<PathBuf>,
}

impl Secrets {
    /// Read `secrets.yaml` from `config_dir`; no file means no secrets
    pub fn load(config_dir: &Path) -> ConfigResult<Self> {
        let file = config_dir.join(SECRETS_FILE);
        let content = match std::fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %file.display(), "No secrets file");
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::ReadFile { path: file, source }),
        };

        let values = match serde_yaml::from_str::<Option<BTreeMap<String, Value>>>(&content) {
            Ok(values) => values.unwrap_or_default(),
            Err(source) => return Err(ConfigError::ParseYaml { path: file, source }),
        };
        debug!(count = values.len(), path = %file.display(), "Read secrets");
        Ok(Self {
            values,
            source: Some(file),
        })
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            source: None,
        }
    }

    pub fn get(&self, key: &str) -> ConfigResult<&Value> {
        self.values.get(key).ok_or_else(|| ConfigError::SecretNotFound {
            key: key.to_string(),
        })
    }

    /// The file these came from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
