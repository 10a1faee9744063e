//! YAML files with tags
//!
//! Tags understood inside `appdaemon.yaml` and app config files:
//! - `!include path` pulls in another YAML file, relative to the including one
//! - `!include_dir_named dir` maps each YAML file in `dir` by its stem
//! - `!secret key` substitutes a value from `secrets.yaml`
//! - `!env_var VAR` substitutes an environment variable
//!
//! Unknown tags are dropped and their inner value kept, so app args can
//! carry arbitrary tagged data without failing the load.

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::Secrets;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

enum Tag {
    Include,
    IncludeDirNamed,
    Secret,
    EnvVar,
    Other,
}

impl Tag {
    fn of(tagged: &TaggedValue) -> Self {
        if tagged.tag == "include" {
            Tag::Include
        } else if tagged.tag == "include_dir_named" {
            Tag::IncludeDirNamed
        } else if tagged.tag == "secret" {
            Tag::Secret
        } else if tagged.tag == "env_var" {
            Tag::EnvVar
        } else {
            Tag::Other
        }
    }
}

pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Secrets,
    /// Files currently being expanded, innermost last
    open: Vec<PathBuf>,
}

impl YamlLoader {
    /// Loader rooted at `config_dir`, reading `secrets.yaml` from it
    pub fn new(config_dir: impl Into<PathBuf>) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self::with_secrets(config_dir, secrets))
    }

    pub fn with_secrets(config_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets,
            open: Vec::new(),
        }
    }

    /// Parse `path` (relative to the config dir) and expand its tags
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        if self.open.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        debug!(path = %path.display(), "Reading YAML");
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.open.push(path.clone());
        let loaded = self.load_string(&text, &path);
        self.open.pop();
        loaded
    }

    /// Parse `text` as if read from `origin`
    pub fn load_string(&mut self, text: &str, origin: &Path) -> ConfigResult<Value> {
        let parsed = serde_yaml::from_str(text).map_err(|source| ConfigError::ParseYaml {
            path: origin.to_path_buf(),
            source,
        })?;
        self.expand(parsed, origin)
    }

    fn expand(&mut self, value: Value, origin: &Path) -> ConfigResult<Value> {
        Ok(match value {
            Value::Tagged(tagged) => self.expand_tag(*tagged, origin)?,
            Value::Sequence(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.expand(item, origin)?);
                }
                Value::Sequence(out)
            }
            Value::Mapping(entries) => {
                let mut out = Mapping::with_capacity(entries.len());
                for (k, v) in entries {
                    let k = self.expand(k, origin)?;
                    let v = self.expand(v, origin)?;
                    out.insert(k, v);
                }
                Value::Mapping(out)
            }
            scalar => scalar,
        })
    }

    fn expand_tag(&mut self, tagged: TaggedValue, origin: &Path) -> ConfigResult<Value> {
        trace!(tag = %tagged.tag, "Expanding tag");
        match Tag::of(&tagged) {
            Tag::Include => {
                let target = self.relative_to(origin, &tagged.value)?;
                self.load_file(target)
            }
            Tag::IncludeDirNamed => {
                let dir = self.relative_to(origin, &tagged.value)?;
                self.include_dir_named(&dir)
            }
            Tag::Secret => {
                let key = plain_string("!secret", tagged.value)?;
                let value = self.secrets.get(&key)?.clone();
                debug!(key = %key, "Substituted secret");
                Ok(value)
            }
            Tag::EnvVar => {
                let var = plain_string("!env_var", tagged.value)?;
                std::env::var(&var)
                    .map(Value::String)
                    .map_err(|_| ConfigError::EnvVarNotFound { var })
            }
            Tag::Other => self.expand(tagged.value, origin),
        }
    }

    fn include_dir_named(&mut self, dir: &Path) -> ConfigResult<Value> {
        let listing = std::fs::read_dir(dir).map_err(|e| ConfigError::InvalidIncludePath {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = listing
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| is_yaml(p))
            .collect();
        files.sort();

        let mut named = Mapping::new();
        for file in files {
            let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let stem = stem.to_string();
            named.insert(Value::String(stem), self.load_file(&file)?);
        }
        Ok(Value::Mapping(named))
    }

    /// Tag paths resolve against the directory of the file holding the tag
    fn relative_to(&self, origin: &Path, value: &Value) -> ConfigResult<PathBuf> {
        let Some(raw) = value.as_str() else {
            return Err(ConfigError::InvalidIncludePath {
                path: format!("{value:?}"),
                reason: "expected a path string".to_string(),
            });
        };
        let base = origin.parent().unwrap_or(&self.config_dir);
        Ok(base.join(raw))
    }

    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }
}

fn plain_string(tag: &str, value: Value) -> ConfigResult<String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(ConfigError::InvalidValue {
            key: tag.to_string(),
            reason: format!("expected a string, got {other:?}"),
        }),
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

/// Load one file from `config_dir` with tags expanded
pub fn load_yaml(config_dir: impl Into<PathBuf>, file: impl AsRef<Path>) -> ConfigResult<Value> {
    YamlLoader::new(config_dir)?.load_file(file)
}
