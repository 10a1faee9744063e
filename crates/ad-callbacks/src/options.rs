//! Registration options
//!
//! Only a fixed set of keys takes part in matching; everything the app wants
//! echoed back to its callback goes in `kwargs`.

use ad_core::Kwargs;
use chrono::Duration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A constant to compare against, or a predicate
#[derive(Clone)]
pub enum Condition {
    Equals(Value),
    Predicate(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl Condition {
    pub fn equals(value: impl Into<Value>) -> Self {
        Condition::Equals(value.into())
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Condition::Predicate(Arc::new(f))
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Condition::Equals(expected) => expected == value,
            Condition::Predicate(f) => f(value),
        }
    }

    /// Value shown by introspection calls
    pub fn describe(&self) -> Value {
        match self {
            Condition::Equals(v) => v.clone(),
            Condition::Predicate(_) => Value::String("<predicate>".into()),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Equals(v) => write!(f, "Equals({v})"),
            Condition::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl From<Value> for Condition {
    fn from(value: Value) -> Self {
        Condition::Equals(value)
    }
}

impl From<&str> for Condition {
    fn from(value: &str) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<String> for Condition {
    fn from(value: String) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<bool> for Condition {
    fn from(value: bool) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<i32> for Condition {
    fn from(value: i32) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<i64> for Condition {
    fn from(value: i64) -> Self {
        Condition::Equals(Value::from(value))
    }
}

impl From<f64> for Condition {
    fn from(value: f64) -> Self {
        Condition::Equals(Value::from(value))
    }
}

/// Where a callback's work runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pinning {
    /// Override the app's `pin_app` setting for this callback
    pub pin: Option<bool>,
    /// Run on this exact slot
    pub pin_thread: Option<usize>,
}

/// Options for `listen_state`
#[derive(Debug, Clone, Default)]
pub struct StateOptions {
    pub namespace: Option<String>,
    /// Defaults to `state`; `all` passes whole records
    pub attribute: Option<String>,
    pub old: Option<Condition>,
    pub new: Option<Condition>,
    pub duration: Option<Duration>,
    pub immediate: bool,
    pub oneshot: bool,
    pub timeout: Option<Duration>,
    pub pinning: Pinning,
    pub kwargs: Kwargs,
}

impl StateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn old(mut self, condition: impl Into<Condition>) -> Self {
        self.old = Some(condition.into());
        self
    }

    pub fn new_state(mut self, condition: impl Into<Condition>) -> Self {
        self.new = Some(condition.into());
        self
    }

    pub fn duration(mut self, seconds: i64) -> Self {
        self.duration = Some(Duration::seconds(seconds));
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    pub fn timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(Duration::seconds(seconds));
        self
    }

    pub fn pin(mut self, pin: bool) -> Self {
        self.pinning.pin = Some(pin);
        self
    }

    pub fn pin_thread(mut self, slot: usize) -> Self {
        self.pinning.pin_thread = Some(slot);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Options for `listen_event`
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub namespace: Option<String>,
    /// Matched against keys of the event data; absent keys don't reject
    pub filters: IndexMap<String, Condition>,
    pub oneshot: bool,
    pub timeout: Option<Duration>,
    pub pinning: Pinning,
    pub kwargs: Kwargs,
}

impl EventOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn filter(mut self, key: impl Into<String>, condition: impl Into<Condition>) -> Self {
        self.filters.insert(key.into(), condition.into());
        self
    }

    pub fn oneshot(mut self) -> Self {
        self.oneshot = true;
        self
    }

    pub fn timeout(mut self, seconds: i64) -> Self {
        self.timeout = Some(Duration::seconds(seconds));
        self
    }

    pub fn pin(mut self, pin: bool) -> Self {
        self.pinning.pin = Some(pin);
        self
    }

    pub fn pin_thread(mut self, slot: usize) -> Self {
        self.pinning.pin_thread = Some(slot);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

/// Severity of an app log line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Options for `listen_log`
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Lowest level delivered
    pub level: LogLevel,
    /// Restrict to one log (`main_log`, `error_log`)
    pub log_type: Option<String>,
    pub pinning: Pinning,
    pub kwargs: Kwargs,
}

impl LogOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn log_type(mut self, log_type: impl Into<String>) -> Self {
        self.log_type = Some(log_type.into());
        self
    }

    pub fn pin_thread(mut self, slot: usize) -> Self {
        self.pinning.pin_thread = Some(slot);
        self
    }
}
