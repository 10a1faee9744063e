//! Runtime configuration, the `appdaemon:` section of `appdaemon.yaml`

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use ad_core::Writeback;
use chrono::NaiveDateTime;
use chrono_tz::Tz;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the runtime config file inside the config directory
pub const CONFIG_FILE: &str = "appdaemon.yaml";

/// Directories never scanned for apps, on top of the configured ones
pub const DEFAULT_EXCLUDE_DIRS: [&str; 3] = ["__pycache__", "build", ".venv"];

const STARTTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub writeback: Writeback,
}

/// One entry under `plugins:`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(rename = "type")]
    pub plugin_type: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Backend specific settings
    #[serde(default, flatten)]
    pub extra: IndexMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppDaemonConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,

    /// IANA zone name, e.g. `Europe/London`
    pub time_zone: String,

    #[serde(default)]
    pub plugins: IndexMap<String, PluginConfig>,

    /// Relative paths are resolved against the config directory
    #[serde(default)]
    pub app_dir: Option<PathBuf>,

    #[serde(default = "default_total_threads")]
    pub total_threads: usize,

    #[serde(default = "default_true")]
    pub pin_apps: bool,

    /// Slots available for pinned apps; all of them unless set
    #[serde(default)]
    pub pin_threads: Option<usize>,

    #[serde(default = "default_module_extension")]
    pub module_extension: String,

    #[serde(default = "default_package_marker")]
    pub package_marker: String,

    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Seconds between utility loop passes
    #[serde(default = "default_utility_delay")]
    pub utility_delay: u64,

    #[serde(default = "default_qsize_warning_threshold")]
    pub qsize_warning_threshold: usize,

    #[serde(default = "default_qsize_warning_step")]
    pub qsize_warning_step: u32,

    #[serde(default = "default_qsize_warning_iterations")]
    pub qsize_warning_iterations: u32,

    /// Seconds a callback may run before a warning is logged
    #[serde(default = "default_thread_duration_warning_threshold")]
    pub thread_duration_warning_threshold: f64,

    #[serde(default)]
    pub production_mode: bool,

    #[serde(default = "default_true")]
    pub missing_app_warnings: bool,

    /// Seconds to wait for each app's `terminate` during shutdown
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout: u64,

    #[serde(default)]
    pub disable_apps: bool,

    #[serde(default)]
    pub namespaces: IndexMap<String, NamespaceConfig>,

    /// Virtual clock start, `YYYY-MM-DD HH:MM:SS` local time
    #[serde(default)]
    pub starttime: Option<String>,

    /// Stop once the clock passes this local time
    #[serde(default)]
    pub endtime: Option<String>,

    /// Virtual seconds per real second
    #[serde(default = "default_timewarp")]
    pub timewarp: f64,

    #[serde(skip)]
    pub config_dir: PathBuf,
}

fn default_namespace() -> String {
    ad_core::DEFAULT.to_string()
}

fn default_total_threads() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_module_extension() -> String {
    "py".to_string()
}

fn default_package_marker() -> String {
    "__init__.py".to_string()
}

fn default_utility_delay() -> u64 {
    1
}

fn default_qsize_warning_threshold() -> usize {
    50
}

fn default_qsize_warning_step() -> u32 {
    60
}

fn default_qsize_warning_iterations() -> u32 {
    10
}

fn default_thread_duration_warning_threshold() -> f64 {
    10.0
}

fn default_terminate_timeout() -> u64 {
    10
}

fn default_timewarp() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct ConfigFile {
    appdaemon: AppDaemonConfig,
}

impl AppDaemonConfig {
    /// Load `appdaemon.yaml` from `config_dir` and validate it
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let mut loader = YamlLoader::new(config_dir)?;
        let value = loader.load_file(CONFIG_FILE)?;
        let mut config = Self::from_value(value, &config_dir.join(CONFIG_FILE))?;
        config.config_dir = config_dir.to_path_buf();
        config.validate()?;
        info!(
            config_dir = %config_dir.display(),
            time_zone = %config.time_zone,
            threads = config.total_threads,
            "Loaded runtime configuration"
        );
        Ok(config)
    }

    /// Build from an already loaded document holding an `appdaemon:` key
    pub fn from_value(value: serde_yaml::Value, path: &Path) -> ConfigResult<Self> {
        let file: ConfigFile =
            serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(file.appdaemon)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(invalid("latitude", "must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(invalid("longitude", "must be between -180 and 180"));
        }
        self.tz()?;
        if self.total_threads == 0 {
            return Err(invalid("total_threads", "must be at least 1"));
        }
        if self.pin_threads() > self.total_threads {
            return Err(invalid("pin_threads", "cannot exceed total_threads"));
        }
        if self.utility_delay == 0 {
            return Err(invalid("utility_delay", "must be at least 1 second"));
        }
        if self.timewarp <= 0.0 {
            return Err(invalid("timewarp", "must be positive"));
        }
        self.starttime()?;
        self.endtime()?;
        for (name, plugin) in &self.plugins {
            if plugin.namespace.is_empty() {
                return Err(ConfigError::ValidationFailed {
                    message: format!("plugin '{name}' has an empty namespace"),
                });
            }
        }
        debug!("Runtime configuration validated");
        Ok(())
    }

    pub fn tz(&self) -> ConfigResult<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|e| invalid("time_zone", &e.to_string()))
    }

    pub fn pin_threads(&self) -> usize {
        self.pin_threads.unwrap_or(self.total_threads)
    }

    pub fn app_dir(&self) -> PathBuf {
        match &self.app_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.config_dir.join(dir),
            None => self.config_dir.join("apps"),
        }
    }

    /// Configured exclusions plus the built-in ones
    pub fn exclude_dirs(&self) -> Vec<String> {
        let mut dirs = self.exclude_dirs.clone();
        for d in DEFAULT_EXCLUDE_DIRS {
            if !dirs.iter().any(|x| x == d) {
                dirs.push(d.to_string());
            }
        }
        dirs
    }

    pub fn utility_delay(&self) -> Duration {
        Duration::from_secs(self.utility_delay)
    }

    pub fn thread_duration_warning(&self) -> Duration {
        Duration::from_secs_f64(self.thread_duration_warning_threshold.max(0.0))
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout)
    }

    /// Where persistent namespaces are written
    pub fn namespace_dir(&self) -> PathBuf {
        self.config_dir.join("namespaces")
    }

    pub fn starttime(&self) -> ConfigResult<Option<NaiveDateTime>> {
        parse_local("starttime", self.starttime.as_deref())
    }

    pub fn endtime(&self) -> ConfigResult<Option<NaiveDateTime>> {
        parse_local("endtime", self.endtime.as_deref())
    }
}

fn parse_local(key: &str, raw: Option<&str>) -> ConfigResult<Option<NaiveDateTime>> {
    raw.map(|s| {
        NaiveDateTime::parse_from_str(s, STARTTIME_FORMAT)
            .map_err(|e| invalid(key, &format!("'{s}': {e}")))
    })
    .transpose()
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
