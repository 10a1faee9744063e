//! Sequence definitions
//!
//! A step is a single-key mapping. The key picks the step kind:
//!
//! ```yaml
//! sequence:
//!   morning:
//!     namespace: default
//!     steps:
//!       - light/turn_on: {entity_id: light.hall, loop_step: {times: 3, interval: 2}}
//!       - sleep: 5
//!       - wait_state: {entity_id: sensor.door, state: "off", timeout: 60}
//!       - sequence: sequence.evening
//! ```

use crate::error::{ConfigError, ConfigResult};
use ad_core::Kwargs;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

/// Default `wait_state` timeout in seconds
pub const DEFAULT_WAIT_TIMEOUT: f64 = 900.0;

/// Longest sleep, timeout, duration or loop interval a step may ask for
pub const MAX_STEP_SECONDS: f64 = 366.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LoopStep {
    pub times: u32,
    /// Seconds between repetitions
    pub interval: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitState {
    pub entity_id: String,
    /// Required state; any change of the entity satisfies the wait when absent
    pub state: Option<Value>,
    pub attribute: Option<String>,
    /// Seconds the state must hold
    pub duration: Option<f64>,
    pub timeout: f64,
    pub namespace: Option<String>,
}

/// Target of a `sequence:` step
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceRef {
    /// `sequence.<name>` or a bare name
    Named(String),
    Inline(Vec<SequenceStep>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequenceStep {
    /// Seconds
    Sleep(f64),
    WaitState(WaitState),
    Service {
        domain: String,
        service: String,
        namespace: Option<String>,
        loop_step: Option<LoopStep>,
        data: Kwargs,
    },
    Sequence {
        target: SequenceRef,
        namespace: Option<String>,
    },
}

fn bad_step(step: &Value, reason: impl Into<String>) -> ConfigError {
    ConfigError::BadSequence {
        name: step.to_string(),
        reason: reason.into(),
    }
}

fn seconds(step: &Value, v: &Value) -> ConfigResult<f64> {
    let secs = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match secs {
        Some(s) if (0.0..=MAX_STEP_SECONDS).contains(&s) => Ok(s),
        _ => Err(bad_step(
            step,
            format!("'{v}' is not a number of seconds up to {MAX_STEP_SECONDS}"),
        )),
    }
}

fn opt_string(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

impl SequenceStep {
    /// Parse one step from its single-key mapping
    pub fn parse(step: &Value) -> ConfigResult<Self> {
        let Some(map) = step.as_object() else {
            return Err(bad_step(step, "step must be a mapping"));
        };
        if map.len() != 1 {
            return Err(bad_step(step, "step must have exactly one key"));
        }
        let Some((key, body)) = map.iter().next() else {
            return Err(bad_step(step, "empty step"));
        };

        match key.as_str() {
            "sleep" => Ok(SequenceStep::Sleep(seconds(step, body)?)),
            "wait_state" => {
                let Some(args) = body.as_object() else {
                    return Err(bad_step(step, "wait_state needs a mapping"));
                };
                let entity_id = opt_string(args, "entity_id")
                    .ok_or_else(|| bad_step(step, "wait_state needs an entity_id"))?;
                let duration = args.get("duration").map(|d| seconds(step, d)).transpose()?;
                let timeout = args
                    .get("timeout")
                    .map(|t| seconds(step, t))
                    .transpose()?
                    .unwrap_or(DEFAULT_WAIT_TIMEOUT);
                Ok(SequenceStep::WaitState(WaitState {
                    entity_id,
                    state: args.get("state").cloned(),
                    attribute: opt_string(args, "attribute"),
                    duration,
                    timeout,
                    namespace: opt_string(args, "namespace"),
                }))
            }
            "sequence" => {
                let (target, namespace) = match body {
                    Value::String(name) => (SequenceRef::Named(name.clone()), None),
                    Value::Array(steps) => (SequenceRef::Inline(parse_steps(steps)?), None),
                    Value::Object(args) => {
                        let target = match args.get("sequence") {
                            Some(Value::String(name)) => SequenceRef::Named(name.clone()),
                            Some(Value::Array(steps)) => SequenceRef::Inline(parse_steps(steps)?),
                            _ => return Err(bad_step(step, "sequence step needs a target")),
                        };
                        (target, opt_string(args, "namespace"))
                    }
                    _ => return Err(bad_step(step, "sequence step needs a name or steps")),
                };
                Ok(SequenceStep::Sequence { target, namespace })
            }
            service_key => {
                let Some((domain, service)) = service_key.split_once('/') else {
                    return Err(bad_step(step, format!("unknown step '{service_key}'")));
                };
                if domain.is_empty() || service.is_empty() {
                    return Err(bad_step(step, "service must be domain/service"));
                }
                let mut data: Kwargs = match body {
                    Value::Object(args) => args.clone().into_iter().collect(),
                    Value::Null => Kwargs::new(),
                    _ => return Err(bad_step(step, "service parameters must be a mapping")),
                };
                let namespace = data
                    .shift_remove("namespace")
                    .and_then(|v| v.as_str().map(str::to_string));
                let loop_step = match data.shift_remove("loop_step") {
                    Some(Value::Object(l)) => Some(LoopStep {
                        times: l.get("times").and_then(Value::as_u64).unwrap_or(1) as u32,
                        interval: l
                            .get("interval")
                            .map(|i| seconds(step, i))
                            .transpose()?
                            .unwrap_or(0.0),
                    }),
                    Some(_) => return Err(bad_step(step, "loop_step must be a mapping")),
                    None => None,
                };
                Ok(SequenceStep::Service {
                    domain: domain.to_string(),
                    service: service.to_string(),
                    namespace,
                    loop_step,
                    data,
                })
            }
        }
    }

    /// The single-key mapping this step was parsed from
    pub fn to_value(&self) -> Value {
        match self {
            SequenceStep::Sleep(secs) => json!({ "sleep": secs }),
            SequenceStep::WaitState(w) => {
                let mut args = Map::new();
                args.insert("entity_id".into(), json!(w.entity_id));
                if let Some(state) = &w.state {
                    args.insert("state".into(), state.clone());
                }
                if let Some(attribute) = &w.attribute {
                    args.insert("attribute".into(), json!(attribute));
                }
                if let Some(duration) = w.duration {
                    args.insert("duration".into(), json!(duration));
                }
                args.insert("timeout".into(), json!(w.timeout));
                if let Some(ns) = &w.namespace {
                    args.insert("namespace".into(), json!(ns));
                }
                json!({ "wait_state": args })
            }
            SequenceStep::Service {
                domain,
                service,
                namespace,
                loop_step,
                data,
            } => {
                let mut args: Map<String, Value> = data.clone().into_iter().collect();
                if let Some(ns) = namespace {
                    args.insert("namespace".into(), json!(ns));
                }
                if let Some(l) = loop_step {
                    args.insert(
                        "loop_step".into(),
                        json!({ "times": l.times, "interval": l.interval }),
                    );
                }
                let mut step = Map::new();
                step.insert(format!("{domain}/{service}"), Value::Object(args));
                Value::Object(step)
            }
            SequenceStep::Sequence { target, namespace } => {
                let target = match target {
                    SequenceRef::Named(name) => json!(name),
                    SequenceRef::Inline(steps) => steps_to_value(steps),
                };
                match namespace {
                    Some(ns) => json!({ "sequence": { "sequence": target, "namespace": ns } }),
                    None => json!({ "sequence": target }),
                }
            }
        }
    }
}

pub fn parse_steps(steps: &[Value]) -> ConfigResult<Vec<SequenceStep>> {
    steps.iter().map(SequenceStep::parse).collect()
}

pub fn steps_to_value(steps: &[SequenceStep]) -> Value {
    Value::Array(steps.iter().map(SequenceStep::to_value).collect())
}

/// One entry under the `sequence:` key of an app config file
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceConfig {
    pub name: String,
    /// Display name; defaults to `name`
    pub friendly_name: Option<String>,
    pub namespace: String,
    pub looping: bool,
    /// Reload apps that ran this sequence when the definition changes
    pub hot_reload: bool,
    pub steps: Vec<SequenceStep>,
    pub config_path: PathBuf,
}

impl SequenceConfig {
    pub fn from_value(name: &str, value: &Value, config_path: PathBuf) -> ConfigResult<Self> {
        let bad = |reason: &str| ConfigError::BadSequence {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let map = value.as_object().ok_or_else(|| bad("must be a mapping"))?;
        for key in map.keys() {
            if !matches!(
                key.as_str(),
                "steps" | "name" | "namespace" | "loop" | "hot_reload"
            ) {
                return Err(bad(&format!("unknown key '{key}'")));
            }
        }
        let steps = map
            .get("steps")
            .and_then(Value::as_array)
            .ok_or_else(|| bad("steps must be a list"))?;

        Ok(Self {
            name: name.to_string(),
            friendly_name: opt_string(map, "name"),
            namespace: opt_string(map, "namespace").unwrap_or_else(|| ad_core::DEFAULT.to_string()),
            looping: map.get("loop").and_then(Value::as_bool).unwrap_or(false),
            hot_reload: map.get("hot_reload").and_then(Value::as_bool).unwrap_or(false),
            steps: parse_steps(steps)?,
            config_path,
        })
    }

    /// Entity id in the `rules` namespace
    pub fn entity_id(&self) -> String {
        format!("sequence.{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_each_step_kind() {
        let steps = json!([
            {"light/turn_on": {"entity_id": "light.hall", "namespace": "house", "loop_step": {"times": 3, "interval": 2}}},
            {"sleep": 5},
            {"wait_state": {"entity_id": "sensor.door", "state": "off", "timeout": 60}},
            {"sequence": "sequence.evening"},
        ]);
        let parsed = parse_steps(steps.as_array().unwrap()).unwrap();

        match &parsed[0] {
            SequenceStep::Service { domain, service, namespace, loop_step, data } => {
                assert_eq!((domain.as_str(), service.as_str()), ("light", "turn_on"));
                assert_eq!(namespace.as_deref(), Some("house"));
                assert_eq!(loop_step, &Some(LoopStep { times: 3, interval: 2.0 }));
                assert_eq!(data.get("entity_id"), Some(&json!("light.hall")));
                assert!(!data.contains_key("loop_step"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parsed[1], SequenceStep::Sleep(5.0));
        match &parsed[2] {
            SequenceStep::WaitState(w) => {
                assert_eq!(w.entity_id, "sensor.door");
                assert_eq!(w.state, Some(json!("off")));
                assert_eq!(w.timeout, 60.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            parsed[3],
            SequenceStep::Sequence {
                target: SequenceRef::Named("sequence.evening".into()),
                namespace: None
            }
        );

        // Written back out, the steps parse to the same thing
        let again = parse_steps(steps_to_value(&parsed).as_array().unwrap()).unwrap();
        assert_eq!(again, parsed);
    }

    #[test]
    fn test_wait_state_default_timeout() {
        let step = SequenceStep::parse(&json!({"wait_state": {"entity_id": "sensor.x"}})).unwrap();
        match step {
            SequenceStep::WaitState(w) => {
                assert_eq!(w.timeout, DEFAULT_WAIT_TIMEOUT);
                assert!(w.state.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bad_steps() {
        for bad in [
            json!("sleep"),
            json!({"sleep": 1, "extra": 2}),
            json!({"sleep": -1}),
            json!({"sleep": 1e300}),
            json!({"sleep": "NaN"}),
            json!({"wait_state": {"entity_id": "sensor.x", "timeout": 1e20}}),
            json!({"wait_state": {"entity_id": "sensor.x", "duration": "inf"}}),
            json!({"light/turn_on": {"loop_step": {"times": 2, "interval": 1e19}}}),
            json!({"turn_on": {}}),
            json!({"wait_state": {"state": "on"}}),
            json!({"light/turn_on": 5}),
        ] {
            assert!(
                matches!(SequenceStep::parse(&bad), Err(ConfigError::BadSequence { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_sequence_config() {
        let value = json!({"name": "Morning", "loop": true, "steps": [{"sleep": 1}]});
        let seq = SequenceConfig::from_value("morning", &value, PathBuf::from("apps.yaml")).unwrap();
        assert_eq!(seq.entity_id(), "sequence.morning");
        assert_eq!(seq.namespace, "default");
        assert!(seq.looping);
        assert_eq!(seq.friendly_name.as_deref(), Some("Morning"));

        let extra = json!({"steps": [], "speed": 3});
        assert!(SequenceConfig::from_value("x", &extra, PathBuf::new()).is_err());
    }
}
