//! Entity state record held by the namespaced state store

use std::fmt;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use indexmap::IndexMap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::EntityId;

/// When an entity was last written
///
/// Entities created with `add_entity` have never been changed and serialize
/// as the literal string `"never"`; everything else serializes as RFC 3339.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LastChanged {
    #[default]
    Never,
    At(DateTime<Utc>),
}

impl LastChanged {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            LastChanged::Never => None,
            LastChanged::At(at) => Some(*at),
        }
    }
}

impl fmt::Display for LastChanged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastChanged::Never => f.write_str("never"),
            LastChanged::At(at) => f.write_str(&at.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        }
    }
}

impl Serialize for LastChanged {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LastChanged {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref() {
            None | Some("never") | Some("") => Ok(LastChanged::Never),
            Some(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| LastChanged::At(dt.with_timezone(&Utc)))
                .map_err(de::Error::custom),
        }
    }
}

/// The state of a single entity inside a namespace
///
/// `state` is opaque to the runtime. Plugins may attach additional top-level
/// fields (e.g. `last_updated`, `context`), which are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value
    #[serde(default)]
    pub state: Value,

    /// Ordered attribute mapping
    #[serde(default)]
    pub attributes: IndexMap<String, Value>,

    /// When the state was last written through `set_state`
    #[serde(default)]
    pub last_changed: LastChanged,

    /// Any other top-level fields supplied by a plugin
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl EntityState {
    /// Create a fresh record that has never been changed
    pub fn new(entity_id: EntityId, state: Value, attributes: IndexMap<String, Value>) -> Self {
        Self {
            entity_id,
            state,
            attributes,
            last_changed: LastChanged::Never,
            extra: IndexMap::new(),
        }
    }

    /// Look up an attribute value by key
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Resolve a field name the way state matching does: top-level fields
    /// win over attributes of the same name.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.top_level(name)
            .or_else(|| self.attributes.get(name).cloned())
    }

    /// Return a top-level field of the record, if present
    pub fn top_level(&self, name: &str) -> Option<Value> {
        match name {
            "state" => Some(self.state.clone()),
            "entity_id" => Some(Value::String(self.entity_id.to_string())),
            "last_changed" => Some(Value::String(self.last_changed.to_string())),
            "attributes" => Some(Value::Object(
                self.attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            )),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Serialize the full record
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    /// Merge an update into this record, stamping `last_changed`
    ///
    /// Attributes are merged key by key unless `update.replace` is set, in
    /// which case they are replaced wholesale.
    pub fn apply(&mut self, update: &StateUpdate, now: DateTime<Utc>) {
        if let Some(state) = &update.state {
            self.state = state.clone();
        }
        if let Some(attributes) = &update.attributes {
            if update.replace {
                self.attributes = attributes.clone();
            } else {
                for (k, v) in attributes {
                    self.attributes.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in &update.extra {
            self.extra.insert(k.clone(), v.clone());
        }
        self.last_changed = LastChanged::At(truncate_to_seconds(now));
    }
}

/// A partial write to an entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<IndexMap<String, Value>>,

    /// Replace attributes instead of merging them
    #[serde(default)]
    pub replace: bool,

    /// Extra top-level fields
    #[serde(default, flatten)]
    pub extra: IndexMap<String, Value>,
}

impl StateUpdate {
    pub fn state(value: impl Into<Value>) -> Self {
        Self {
            state: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// Drop sub-second precision
pub fn truncate_to_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}
