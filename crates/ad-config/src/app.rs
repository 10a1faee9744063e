//! App config files
//!
//! Every YAML file under the app directory maps names to app entries. Two
//! keys are special: `global_modules` names modules every app implicitly
//! depends on, and `sequence` declares sequences. An entry with
//! `global: true` declares a global module rather than an app.

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use crate::secrets::Secrets;
use crate::sequence::SequenceConfig;
use ad_core::Kwargs;
use ad_dependency::{collect_files, FileCheck, Graph, LoadingActions};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const GLOBAL_MODULES_KEY: &str = "global_modules";
pub const SEQUENCE_KEY: &str = "sequence";

pub const DEFAULT_PRIORITY: f64 = 50.0;

const APP_KEYS: [&str; 11] = [
    "module",
    "class",
    "dependencies",
    "global_dependencies",
    "disable",
    "priority",
    "pin_app",
    "pin_thread",
    "log",
    "log_level",
    "global",
];

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub name: String,
    pub module: String,
    pub class: String,
    /// Other apps that must be running first
    pub dependencies: BTreeSet<String>,
    /// Global modules this app uses
    pub global_dependencies: BTreeSet<String>,
    pub disable: bool,
    /// Lower starts earlier
    pub priority: f64,
    pub pin_app: Option<bool>,
    pub pin_thread: Option<usize>,
    pub log: Option<String>,
    pub log_level: Option<String>,
    /// Everything else in the entry
    pub args: Kwargs,
    pub config_path: PathBuf,
}

/// Entry marked `global: true`
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalModule {
    pub name: String,
    pub module: String,
    pub dependencies: BTreeSet<String>,
    pub global_dependencies: BTreeSet<String>,
    pub disable: bool,
    pub priority: f64,
    pub config_path: PathBuf,
}

/// A string is a one-element set
fn name_set(name: &str, key: &str, value: Option<&Value>) -> ConfigResult<BTreeSet<String>> {
    match value {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::String(s)) => Ok(BTreeSet::from([s.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| bad_app(name, &format!("{key} must be strings")))
            })
            .collect(),
        Some(_) => Err(bad_app(name, &format!("{key} must be a string or a list"))),
    }
}

fn bad_app(name: &str, reason: &str) -> ConfigError {
    ConfigError::BadAppConfig {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn string_field(name: &str, map: &Map<String, Value>, key: &str) -> ConfigResult<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(bad_app(name, &format!("{key} must be a string"))),
    }
}

fn bool_field(name: &str, map: &Map<String, Value>, key: &str) -> ConfigResult<Option<bool>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(bad_app(name, &format!("{key} must be true or false"))),
    }
}

fn priority_field(name: &str, map: &Map<String, Value>) -> ConfigResult<f64> {
    match map.get("priority") {
        None | Some(Value::Null) => Ok(DEFAULT_PRIORITY),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| bad_app(name, "priority must be a number")),
    }
}

impl AppConfig {
    pub fn from_map(name: &str, map: &Map<String, Value>, config_path: &Path) -> ConfigResult<Self> {
        let module = string_field(name, map, "module")?
            .ok_or_else(|| bad_app(name, "missing module"))?;
        let class =
            string_field(name, map, "class")?.ok_or_else(|| bad_app(name, "missing class"))?;
        let pin_thread = match map.get("pin_thread") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| bad_app(name, "pin_thread must be a non-negative integer"))?
                    as usize,
            ),
        };
        let args = map
            .iter()
            .filter(|(k, _)| !APP_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            name: name.to_string(),
            module,
            class,
            dependencies: name_set(name, "dependencies", map.get("dependencies"))?,
            global_dependencies: name_set(
                name,
                "global_dependencies",
                map.get("global_dependencies"),
            )?,
            disable: bool_field(name, map, "disable")?.unwrap_or(false),
            priority: priority_field(name, map)?,
            pin_app: bool_field(name, map, "pin_app")?,
            pin_thread,
            log: string_field(name, map, "log")?,
            log_level: string_field(name, map, "log_level")?,
            args,
            config_path: config_path.to_path_buf(),
        })
    }
}

impl GlobalModule {
    pub fn from_map(name: &str, map: &Map<String, Value>, config_path: &Path) -> ConfigResult<Self> {
        Ok(Self {
            name: name.to_string(),
            module: string_field(name, map, "module")?
                .ok_or_else(|| bad_app(name, "missing module"))?,
            dependencies: name_set(name, "dependencies", map.get("dependencies"))?,
            global_dependencies: name_set(
                name,
                "global_dependencies",
                map.get("global_dependencies"),
            )?,
            disable: bool_field(name, map, "disable")?.unwrap_or(false),
            priority: priority_field(name, map)?,
            config_path: config_path.to_path_buf(),
        })
    }
}

/// Every app, global module and sequence across all config files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllAppConfig {
    pub apps: IndexMap<String, AppConfig>,
    pub globals: IndexMap<String, GlobalModule>,
    pub global_modules: BTreeSet<String>,
    pub sequences: IndexMap<String, SequenceConfig>,
}

impl AllAppConfig {
    /// Parse one config file's document
    pub fn from_value(value: &serde_yaml::Value, config_path: &Path) -> ConfigResult<Self> {
        let json = serde_json::to_value(value).map_err(|e| ConfigError::ValidationFailed {
            message: format!("{}: {e}", config_path.display()),
        })?;
        let mut all = Self::default();
        let map = match json {
            Value::Null => return Ok(all),
            Value::Object(map) => map,
            _ => {
                return Err(ConfigError::ValidationFailed {
                    message: format!("{} must be a mapping", config_path.display()),
                })
            }
        };

        for (name, entry) in &map {
            match name.as_str() {
                GLOBAL_MODULES_KEY => {
                    all.global_modules
                        .extend(name_set(name, GLOBAL_MODULES_KEY, Some(entry))?);
                }
                SEQUENCE_KEY => {
                    let Some(sequences) = entry.as_object() else {
                        return Err(bad_app(name, "sequence must map names to sequences"));
                    };
                    for (seq_name, seq) in sequences {
                        all.sequences.insert(
                            seq_name.clone(),
                            SequenceConfig::from_value(seq_name, seq, config_path.to_path_buf())?,
                        );
                    }
                }
                _ => {
                    let Some(fields) = entry.as_object() else {
                        return Err(bad_app(name, "entry must be a mapping"));
                    };
                    if fields.get("global").and_then(Value::as_bool).unwrap_or(false) {
                        let global = GlobalModule::from_map(name, fields, config_path)?;
                        all.global_modules.insert(global.module.clone());
                        all.globals.insert(name.clone(), global);
                    } else {
                        all.apps
                            .insert(name.clone(), AppConfig::from_map(name, fields, config_path)?);
                    }
                }
            }
        }
        Ok(all)
    }

    /// Fold another file in; later definitions win
    pub fn merge(&mut self, other: AllAppConfig) {
        for (name, app) in other.apps {
            if let Some(previous) = self.apps.get(&name) {
                warn!(
                    app = %name,
                    first = %previous.config_path.display(),
                    second = %app.config_path.display(),
                    "App defined more than once, using the later definition"
                );
            }
            self.apps.insert(name, app);
        }
        self.globals.extend(other.globals);
        self.global_modules.extend(other.global_modules);
        self.sequences.extend(other.sequences);
    }

    pub fn app_names(&self) -> BTreeSet<String> {
        self.apps.keys().cloned().collect()
    }

    pub fn active_apps(&self) -> impl Iterator<Item = &AppConfig> {
        self.apps.values().filter(|a| !a.disable)
    }

    pub fn active_app_count(&self) -> usize {
        self.active_apps().count()
    }

    pub fn apps_from_file(&self, path: &Path) -> BTreeSet<String> {
        self.apps
            .values()
            .filter(|a| a.config_path == path)
            .map(|a| a.name.clone())
            .collect()
    }

    /// App to the apps it depends on, active apps only
    pub fn dependency_graph(&self) -> Graph {
        self.active_apps()
            .map(|a| (a.name.clone(), a.dependencies.iter().cloned()))
            .collect()
    }

    pub fn priorities(&self) -> BTreeMap<String, f64> {
        self.active_apps()
            .map(|a| (a.name.clone(), a.priority))
            .collect()
    }

    /// Active apps whose module, or one of whose global modules, is in `modules`
    pub fn apps_using_modules(&self, modules: &BTreeSet<String>) -> BTreeSet<String> {
        self.active_apps()
            .filter(|a| {
                modules.contains(&a.module)
                    || a.global_dependencies.iter().any(|g| modules.contains(g))
            })
            .map(|a| a.name.clone())
            .collect()
    }

    /// Apps to start, reload and stop to get from `self` to `new`
    ///
    /// Disabling an app stops it; re-enabling starts it.
    pub fn app_changes(&self, new: &AllAppConfig) -> LoadingActions {
        let old_apps: BTreeMap<&String, &AppConfig> =
            self.active_apps().map(|a| (&a.name, a)).collect();
        let new_apps: BTreeMap<&String, &AppConfig> =
            new.active_apps().map(|a| (&a.name, a)).collect();
        diff(&old_apps, &new_apps)
    }

    pub fn sequence_changes(&self, new: &AllAppConfig) -> LoadingActions {
        let old: BTreeMap<&String, &SequenceConfig> = self.sequences.iter().collect();
        let new: BTreeMap<&String, &SequenceConfig> = new.sequences.iter().collect();
        diff(&old, &new)
    }
}

fn diff<T: PartialEq>(
    old: &BTreeMap<&String, &T>,
    new: &BTreeMap<&String, &T>,
) -> LoadingActions {
    let mut actions = LoadingActions::default();
    for (name, cfg) in new {
        match old.get(name) {
            None => {
                actions.init.insert((*name).clone());
            }
            Some(previous) if previous != cfg => {
                actions.reload.insert((*name).clone());
            }
            Some(_) => {}
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            actions.term.insert((*name).clone());
        }
    }
    actions
}

/// App config files under the app directory, re-read as they change
///
/// A file that fails to load keeps its last good contents in force.
#[derive(Debug)]
pub struct AppConfigFiles {
    config_dir: PathBuf,
    app_dir: PathBuf,
    exclude_dirs: Vec<String>,
    secrets: Secrets,
    pub files: FileCheck,
    loaded: BTreeMap<PathBuf, AllAppConfig>,
    failed: BTreeSet<PathBuf>,
}

impl AppConfigFiles {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        exclude_dirs: Vec<String>,
    ) -> ConfigResult<Self> {
        let config_dir = config_dir.into();
        let secrets = Secrets::load(&config_dir)?;
        Ok(Self {
            config_dir,
            app_dir: app_dir.into(),
            exclude_dirs,
            secrets,
            files: FileCheck::new(),
            loaded: BTreeMap::new(),
            failed: BTreeSet::new(),
        })
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// Rescan the app directory, re-reading new and modified files
    ///
    /// Returns true when any file was added, changed or removed.
    pub fn scan(&mut self) -> bool {
        let mut paths = collect_files(&self.app_dir, "yaml", &self.exclude_dirs);
        paths.extend(collect_files(&self.app_dir, "yml", &self.exclude_dirs));
        self.files.update(paths);
        if !self.files.there_were_changes() {
            return false;
        }
        self.files.log_changes("app config", &self.app_dir);

        for path in &self.files.deleted {
            self.loaded.remove(path);
            self.failed.remove(path);
        }
        let changed: Vec<PathBuf> = self
            .files
            .new
            .iter()
            .chain(self.files.modified.iter())
            .cloned()
            .collect();
        for path in changed {
            let mut loader = YamlLoader::with_secrets(&self.config_dir, self.secrets.clone());
            let result = loader
                .load_file(&path)
                .and_then(|value| AllAppConfig::from_value(&value, &path));
            match result {
                Ok(config) => {
                    debug!(
                        path = %path.display(),
                        apps = config.apps.len(),
                        sequences = config.sequences.len(),
                        "Read app config file"
                    );
                    self.failed.remove(&path);
                    self.loaded.insert(path, config);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unable to read app config file, keeping previous contents");
                    self.failed.insert(path);
                }
            }
        }
        info!(files = self.loaded.len(), failed = self.failed.len(), "App config files scanned");
        true
    }

    /// Every loaded file merged in path order
    pub fn merged(&self) -> AllAppConfig {
        let mut all = AllAppConfig::default();
        for config in self.loaded.values() {
            all.merge(config.clone());
        }
        all
    }

    pub fn failed(&self) -> &BTreeSet<PathBuf> {
        &self.failed
    }

    /// Force a file to be re-read on the next scan
    pub fn touch(&mut self, path: &Path) {
        self.files.touch(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(yaml: &str) -> ConfigResult<AllAppConfig> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        AllAppConfig::from_value(&value, Path::new("/apps/apps.yaml"))
    }

    #[test]
    fn test_parse_apps_globals_and_sequences() {
        let all = parse(
            r#"
global_modules: helpers
hall:
  module: lights
  class: HallLights
  dependencies: base
  priority: 10
  pin_thread: 2
  brightness: 200
base:
  module: base
  class: Base
  disable: false
shared:
  module: shared
  global: true
sequence:
  morning:
    steps:
      - sleep: 1
"#,
        )
        .unwrap();

        let hall = &all.apps["hall"];
        assert_eq!(hall.dependencies, BTreeSet::from(["base".to_string()]));
        assert_eq!(hall.priority, 10.0);
        assert_eq!(hall.pin_thread, Some(2));
        assert_eq!(hall.args.get("brightness"), Some(&serde_json::json!(200)));
        assert!(!hall.args.contains_key("module"));
        assert_eq!(all.apps["base"].priority, DEFAULT_PRIORITY);
        assert_eq!(
            all.global_modules,
            BTreeSet::from(["helpers".to_string(), "shared".to_string()])
        );
        assert!(all.globals.contains_key("shared"));
        assert!(all.sequences.contains_key("morning"));

        let graph = all.dependency_graph();
        assert_eq!(graph.topo_sort().unwrap(), vec!["base", "hall"]);
    }

    #[test]
    fn test_missing_class_is_bad_config() {
        assert!(matches!(
            parse("hall:\n  module: lights\n"),
            Err(ConfigError::BadAppConfig { name, .. }) if name == "hall"
        ));
    }

    #[test]
    fn test_changes_between_configs() {
        let old = parse(
            "a: {module: a, class: A}\nb: {module: b, class: B}\nc: {module: c, class: C}\n",
        )
        .unwrap();
        let new = parse(
            "a: {module: a, class: A}\nb: {module: b, class: B, speed: 2}\nc: {module: c, class: C, disable: true}\nd: {module: d, class: D}\n",
        )
        .unwrap();

        let actions = old.app_changes(&new);
        assert_eq!(actions.init, BTreeSet::from(["d".to_string()]));
        assert_eq!(actions.reload, BTreeSet::from(["b".to_string()]));
        assert_eq!(actions.term, BTreeSet::from(["c".to_string()]));
        assert_eq!(new.active_app_count(), 3);
    }

    #[test]
    fn test_apps_using_modules() {
        let all = parse(
            "a: {module: lights, class: A}\nb: {module: heat, class: B, global_dependencies: [helpers]}\nc: {module: other, class: C}\n",
        )
        .unwrap();
        let modules = BTreeSet::from(["lights".to_string(), "helpers".to_string()]);
        assert_eq!(
            all.apps_using_modules(&modules),
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn test_files_keep_last_good_contents() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("apps");
        fs::create_dir_all(&apps).unwrap();
        let file = apps.join("apps.yaml");
        fs::write(&file, "hall: {module: lights, class: Hall}\n").unwrap();

        let mut files = AppConfigFiles::new(dir.path(), &apps, Vec::new()).unwrap();
        assert!(files.scan());
        assert!(files.merged().apps.contains_key("hall"));
        assert!(!files.scan());

        fs::write(&file, "hall: [not, a, mapping]\n").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        fs::OpenOptions::new()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert!(files.scan());
        assert!(files.failed().contains(&file));
        assert!(files.merged().apps.contains_key("hall"));
    }

    #[test]
    fn test_later_file_wins() {
        let mut first = parse("hall: {module: lights, class: Hall}\n").unwrap();
        let second = parse("hall: {module: lights2, class: Hall}\n").unwrap();
        first.merge(second);
        assert_eq!(first.apps["hall"].module, "lights2");
    }
}
