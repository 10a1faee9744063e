//! The callback registry
//!
//! One lock guards every record. It is held while records are matched and
//! bound to their arguments, never while user code runs: matching returns
//! [`Dispatch`] values that the caller hands to the worker pool afterwards.
//! Records are kept in registration order, which is the order in which
//! matches for a single event are returned.

use crate::callback::{Callback, EventArgs, Invocation, LogArgs, StateArgs};
use crate::options::{Condition, EventOptions, LogLevel, LogOptions, Pinning, StateOptions};
use crate::{CallbackError, CallbackResult};
use ad_core::events::{is_system_event, LogEventData, StateChangedData};
use ad_core::{EntityState, Event, Kwargs, GLOBAL};
use chrono::Duration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, trace, warn};

/// Attribute value that passes whole records to state callbacks
pub const ALL_ATTRIBUTES: &str = "all";

/// What a record listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackKind {
    State,
    Event,
    Log,
    Schedule,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallbackKind::State => "state",
            CallbackKind::Event => "event",
            CallbackKind::Log => "log",
            CallbackKind::Schedule => "schedule",
        })
    }
}

/// Generate a fresh handle
pub fn new_handle() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A state listener
#[derive(Debug)]
pub struct StateWatch {
    /// `None`, a domain, or a full entity id
    pub entity: Option<String>,
    pub attribute: String,
    pub old: Option<Condition>,
    pub new: Option<Condition>,
    pub duration: Option<Duration>,
    pub immediate: bool,
    pub oneshot: bool,
    pub kwargs: Kwargs,
    pub callback: Callback<StateArgs>,
    pending: Option<PendingDuration>,
    /// Timed out while a duration timer was armed; fires once more then goes
    expired: bool,
}

#[derive(Debug, Clone)]
struct PendingDuration {
    timer: String,
    args: StateArgs,
}

impl StateWatch {
    fn selects(&self, entity_id: &str) -> bool {
        match self.entity.as_deref() {
            None => true,
            Some(selector) if selector.contains('.') => selector == entity_id,
            Some(domain) => entity_id
                .split_once('.')
                .map(|(d, _)| d == domain)
                .unwrap_or(false),
        }
    }

    fn extract(&self, state: Option<&EntityState>) -> Value {
        match state {
            None => Value::Null,
            Some(s) if self.attribute == ALL_ATTRIBUTES => s.to_value(),
            Some(s) => s.lookup(&self.attribute).unwrap_or(Value::Null),
        }
    }

    fn conditions_hold(&self, old: &Value, new: &Value) -> bool {
        self.old.as_ref().map_or(true, |c| c.matches(old))
            && self.new.as_ref().map_or(true, |c| c.matches(new))
    }
}

/// An event listener
#[derive(Debug)]
pub struct EventWatch {
    /// `None` matches every non-system event
    pub event: Option<String>,
    pub filters: IndexMap<String, Condition>,
    pub oneshot: bool,
    pub kwargs: Kwargs,
    pub callback: Callback<EventArgs>,
}

impl EventWatch {
    fn selects(&self, event: &Event) -> bool {
        let event_type = event.event_type.as_str();
        let type_ok = match self.event.as_deref() {
            None => !is_system_event(event_type),
            Some(wanted) => wanted == event_type,
        };
        type_ok
            && self
                .filters
                .iter()
                .all(|(key, cond)| event.data.get(key).map_or(true, |v| cond.matches(v)))
    }
}

/// A log listener
#[derive(Debug)]
pub struct LogWatch {
    pub level: LogLevel,
    pub log_type: Option<String>,
    pub kwargs: Kwargs,
    pub callback: Callback<LogArgs>,
}

#[derive(Debug)]
pub enum Listener {
    State(StateWatch),
    Event(EventWatch),
    Log(LogWatch),
}

impl Listener {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Listener::State(_) => CallbackKind::State,
            Listener::Event(_) => CallbackKind::Event,
            Listener::Log(_) => CallbackKind::Log,
        }
    }
}

/// A registered callback
#[derive(Debug)]
pub struct CallbackRecord {
    pub handle: String,
    pub app: String,
    pub namespace: String,
    pub pinning: Pinning,
    pub listener: Listener,
    /// Scheduler entry that expires this record
    pub timeout_timer: Option<String>,
}

impl CallbackRecord {
    pub fn kind(&self) -> CallbackKind {
        self.listener.kind()
    }

    /// Scheduler entries that die with this record
    pub fn timers(&self) -> Vec<String> {
        let mut timers: Vec<String> = self.timeout_timer.iter().cloned().collect();
        if let Listener::State(watch) = &self.listener {
            if let Some(pending) = &watch.pending {
                timers.push(pending.timer.clone());
            }
        }
        timers
    }
}

/// Introspection view of a record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackInfo {
    pub handle: String,
    pub app: String,
    pub kind: CallbackKind,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub kwargs: Kwargs,
}

/// A bound callback, ready for the worker pool
#[derive(Debug)]
pub struct Dispatch {
    pub handle: String,
    pub app: String,
    pub kind: CallbackKind,
    pub pinning: Pinning,
    pub invocation: Invocation,
}

/// A `duration` timer the caller must arm in the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct DurationTimer {
    pub timer: String,
    pub listener: String,
    pub app: String,
    /// Where the entity that started the timer lives
    pub namespace: String,
    pub entity_id: String,
    pub fire_in: Duration,
}

/// Outcome of matching one event
#[derive(Debug, Default)]
pub struct Matches {
    /// In registration order
    pub dispatch: Vec<Dispatch>,
    pub arm: Vec<DurationTimer>,
    /// Scheduler entries that must be cancelled
    pub cancel_timers: Vec<String>,
}

impl Matches {
    pub fn is_empty(&self) -> bool {
        self.dispatch.is_empty() && self.arm.is_empty() && self.cancel_timers.is_empty()
    }
}

fn namespace_matches(registered: &str, published: &str) -> bool {
    registered == published || registered == GLOBAL || published == GLOBAL
}

/// Registry of state, event and log callbacks for every app
#[derive(Default)]
pub struct CallbackRegistry {
    records: Mutex<IndexMap<String, CallbackRecord>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, CallbackRecord>> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn insert(&self, record: CallbackRecord) -> String {
        let handle = record.handle.clone();
        trace!(app = %record.app, handle = %handle, kind = %record.kind(), "Registering callback");
        self.lock().insert(handle.clone(), record);
        handle
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn add_state(
        &self,
        app: &str,
        namespace: &str,
        entity: Option<&str>,
        options: StateOptions,
        callback: Callback<StateArgs>,
    ) -> String {
        let watch = StateWatch {
            entity: entity.map(str::to_string),
            attribute: options.attribute.unwrap_or_else(|| "state".to_string()),
            old: options.old,
            new: options.new,
            duration: options.duration,
            immediate: options.immediate,
            oneshot: options.oneshot,
            kwargs: options.kwargs,
            callback,
            pending: None,
            expired: false,
        };
        self.insert(CallbackRecord {
            handle: new_handle(),
            app: app.to_string(),
            namespace: namespace.to_string(),
            pinning: options.pinning,
            listener: Listener::State(watch),
            timeout_timer: None,
        })
    }

    pub fn add_event(
        &self,
        app: &str,
        namespace: &str,
        event: Option<&str>,
        options: EventOptions,
        callback: Callback<EventArgs>,
    ) -> String {
        let watch = EventWatch {
            event: event.map(str::to_string),
            filters: options.filters,
            oneshot: options.oneshot,
            kwargs: options.kwargs,
            callback,
        };
        self.insert(CallbackRecord {
            handle: new_handle(),
            app: app.to_string(),
            namespace: namespace.to_string(),
            pinning: options.pinning,
            listener: Listener::Event(watch),
            timeout_timer: None,
        })
    }

    pub fn add_log(&self, app: &str, options: LogOptions, callback: Callback<LogArgs>) -> String {
        let watch = LogWatch {
            level: options.level,
            log_type: options.log_type,
            kwargs: options.kwargs,
            callback,
        };
        self.insert(CallbackRecord {
            handle: new_handle(),
            app: app.to_string(),
            namespace: ad_core::ADMIN.to_string(),
            pinning: options.pinning,
            listener: Listener::Log(watch),
            timeout_timer: None,
        })
    }

    /// Remember the scheduler entry that expires `handle`
    pub fn set_timeout_timer(&self, handle: &str, timer: String) -> bool {
        match self.lock().get_mut(handle) {
            Some(record) => {
                record.timeout_timer = Some(timer);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Cancel one of `app`'s callbacks
    ///
    /// `kind` restricts the handle to one listener type. The removed record
    /// is returned so its timers can be cancelled.
    #[instrument(skip(self))]
    pub fn cancel(
        &self,
        app: &str,
        handle: &str,
        kind: Option<CallbackKind>,
    ) -> CallbackResult<CallbackRecord> {
        let mut records = self.lock();
        let record = records
            .get(handle)
            .ok_or_else(|| CallbackError::NotFound(handle.to_string()))?;
        if record.app != app {
            return Err(CallbackError::NotOwner {
                handle: handle.to_string(),
                owner: record.app.clone(),
                app: app.to_string(),
            });
        }
        if let Some(expected) = kind {
            if record.kind() != expected {
                return Err(CallbackError::WrongKind {
                    handle: handle.to_string(),
                    expected,
                    actual: record.kind(),
                });
            }
        }
        let removed = records
            .shift_remove(handle)
            .ok_or_else(|| CallbackError::NotFound(handle.to_string()))?;
        debug!("Callback cancelled");
        Ok(removed)
    }

    /// Remove every record an app owns
    pub fn clear_app(&self, app: &str) -> Vec<CallbackRecord> {
        let mut records = self.lock();
        let handles: Vec<String> = records
            .values()
            .filter(|r| r.app == app)
            .map(|r| r.handle.clone())
            .collect();
        let removed: Vec<CallbackRecord> = handles
            .iter()
            .filter_map(|h| records.shift_remove(h))
            .collect();
        if !removed.is_empty() {
            debug!(app, count = removed.len(), "Cleared app callbacks");
        }
        removed
    }

    /// A listener's `timeout` elapsed
    ///
    /// A state listener with an armed `duration` timer is kept until that
    /// timer fires, but stops matching new changes. Returns true when the
    /// record was removed outright.
    pub fn expire(&self, handle: &str) -> bool {
        let mut records = self.lock();
        let keep = match records.get_mut(handle) {
            None => return false,
            Some(record) => {
                record.timeout_timer = None;
                match &mut record.listener {
                    Listener::State(watch) if watch.pending.is_some() => {
                        watch.expired = true;
                        true
                    }
                    _ => false,
                }
            }
        };
        if keep {
            debug!(handle, "Listener timed out with a pending duration timer");
            return false;
        }
        debug!(handle, "Listener timed out");
        records.shift_remove(handle).is_some()
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn contains(&self, handle: &str) -> bool {
        self.lock().contains_key(handle)
    }

    pub fn owner(&self, handle: &str) -> Option<String> {
        self.lock().get(handle).map(|r| r.app.clone())
    }

    pub fn info(&self, handle: &str) -> Option<CallbackInfo> {
        let records = self.lock();
        let record = records.get(handle)?;
        let mut info = CallbackInfo {
            handle: record.handle.clone(),
            app: record.app.clone(),
            kind: record.kind(),
            namespace: record.namespace.clone(),
            entity: None,
            attribute: None,
            event: None,
            kwargs: Kwargs::new(),
        };
        match &record.listener {
            Listener::State(watch) => {
                info.entity = watch.entity.clone();
                info.attribute = Some(watch.attribute.clone());
                info.kwargs = watch.kwargs.clone();
                if let Some(old) = &watch.old {
                    info.kwargs.insert("old".into(), old.describe());
                }
                if let Some(new) = &watch.new {
                    info.kwargs.insert("new".into(), new.describe());
                }
                if let Some(duration) = watch.duration {
                    info.kwargs
                        .insert("duration".into(), Value::from(duration.num_seconds()));
                }
                if watch.oneshot {
                    info.kwargs.insert("oneshot".into(), Value::Bool(true));
                }
            }
            Listener::Event(watch) => {
                info.event = watch.event.clone();
                info.kwargs = watch.kwargs.clone();
                for (key, cond) in &watch.filters {
                    info.kwargs.insert(key.clone(), cond.describe());
                }
            }
            Listener::Log(watch) => {
                info.kwargs = watch.kwargs.clone();
                info.kwargs
                    .insert("level".into(), Value::from(watch.level.as_str()));
            }
        }
        Some(info)
    }

    /// Handles owned by an app, in registration order
    pub fn handles(&self, app: &str) -> Vec<String> {
        self.lock()
            .values()
            .filter(|r| r.app == app)
            .map(|r| r.handle.clone())
            .collect()
    }

    /// Number of records, optionally restricted to one app and kind
    pub fn count(&self, app: Option<&str>, kind: Option<CallbackKind>) -> usize {
        self.lock()
            .values()
            .filter(|r| app.map_or(true, |a| r.app == a))
            .filter(|r| kind.map_or(true, |k| r.kind() == k))
            .count()
    }

    /// Whether an app listens to logs; its own log lines are then not
    /// published, which would otherwise loop
    pub fn has_log_callback(&self, app: &str) -> bool {
        self.lock()
            .values()
            .any(|r| r.app == app && matches!(r.listener, Listener::Log(_)))
    }

    // ------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------

    /// Match a `state_changed` published in `namespace`
    pub fn match_state(&self, namespace: &str, change: &StateChangedData) -> Matches {
        let mut out = Matches::default();
        let mut fired = Vec::new();
        let mut records = self.lock();

        for record in records.values_mut() {
            if !namespace_matches(&record.namespace, namespace) {
                continue;
            }
            let Listener::State(watch) = &mut record.listener else {
                continue;
            };
            if watch.expired || !watch.selects(&change.entity_id) {
                continue;
            }

            let old = watch.extract(change.old_state.as_ref());
            let new = watch.extract(change.new_state.as_ref());
            let args = StateArgs {
                entity_id: change.entity_id.clone(),
                attribute: watch.attribute.clone(),
                old,
                new,
                kwargs: watch.kwargs.clone(),
            };

            if watch.attribute == ALL_ATTRIBUTES {
                out.dispatch.push(Dispatch {
                    handle: record.handle.clone(),
                    app: record.app.clone(),
                    kind: CallbackKind::State,
                    pinning: record.pinning,
                    invocation: watch.callback.bind(args),
                });
                if watch.oneshot {
                    fired.push(record.handle.clone());
                }
                continue;
            }

            if args.new == args.old {
                continue;
            }

            // Any change re-evaluates a pending duration from scratch
            if let Some(pending) = watch.pending.take() {
                trace!(handle = %record.handle, "Cancelling pending duration timer");
                out.cancel_timers.push(pending.timer);
            }

            if !watch.conditions_hold(&args.old, &args.new) {
                continue;
            }

            match watch.duration {
                Some(duration) => {
                    let timer = new_handle();
                    out.arm.push(DurationTimer {
                        timer: timer.clone(),
                        listener: record.handle.clone(),
                        app: record.app.clone(),
                        namespace: namespace.to_string(),
                        entity_id: args.entity_id.clone(),
                        fire_in: duration,
                    });
                    watch.pending = Some(PendingDuration { timer, args });
                }
                None => {
                    out.dispatch.push(Dispatch {
                        handle: record.handle.clone(),
                        app: record.app.clone(),
                        kind: CallbackKind::State,
                        pinning: record.pinning,
                        invocation: watch.callback.bind(args),
                    });
                    if watch.oneshot {
                        fired.push(record.handle.clone());
                    }
                }
            }
        }

        remove_fired(&mut records, fired, &mut out.cancel_timers);
        out
    }

    /// Evaluate `immediate` for a freshly registered state listener
    ///
    /// Only listeners on a single entity that currently exists qualify. When
    /// `new` is given the current value must satisfy it.
    pub fn immediate(&self, handle: &str, current: Option<&EntityState>) -> Matches {
        let mut out = Matches::default();
        let Some(current) = current else {
            return out;
        };
        let mut records = self.lock();
        let Some(record) = records.get_mut(handle) else {
            return out;
        };
        let Listener::State(watch) = &mut record.listener else {
            return out;
        };
        let single_entity = watch
            .entity
            .as_deref()
            .map_or(false, |e| e.contains('.'));
        if !watch.immediate || !single_entity {
            return out;
        }

        let value = watch.extract(Some(current));
        if let Some(cond) = &watch.new {
            if !cond.matches(&value) {
                return out;
            }
        }
        let args = StateArgs {
            entity_id: current.entity_id.to_string(),
            attribute: watch.attribute.clone(),
            old: Value::Null,
            new: value,
            kwargs: watch.kwargs.clone(),
        };

        let mut fired = Vec::new();
        match watch.duration {
            Some(duration) => {
                let timer = new_handle();
                out.arm.push(DurationTimer {
                    timer: timer.clone(),
                    listener: record.handle.clone(),
                    app: record.app.clone(),
                    namespace: record.namespace.clone(),
                    entity_id: args.entity_id.clone(),
                    fire_in: duration,
                });
                watch.pending = Some(PendingDuration { timer, args });
            }
            None => {
                out.dispatch.push(Dispatch {
                    handle: record.handle.clone(),
                    app: record.app.clone(),
                    kind: CallbackKind::State,
                    pinning: record.pinning,
                    invocation: watch.callback.bind(args),
                });
                if watch.oneshot {
                    fired.push(record.handle.clone());
                }
            }
        }
        remove_fired(&mut records, fired, &mut out.cancel_timers);
        out
    }

    /// A `duration` timer fired
    ///
    /// The listener must still be registered, the timer must be the one it is
    /// waiting on, and the entity's current value must still satisfy `new`.
    pub fn fire_duration(
        &self,
        listener: &str,
        timer: &str,
        current: Option<&EntityState>,
    ) -> Matches {
        let mut out = Matches::default();
        let mut records = self.lock();
        let Some(record) = records.get_mut(listener) else {
            trace!(listener, "Duration fired for a cancelled listener");
            return out;
        };
        let Listener::State(watch) = &mut record.listener else {
            return out;
        };
        if watch.pending.as_ref().map(|p| p.timer.as_str()) != Some(timer) {
            return out;
        }
        let Some(pending) = watch.pending.take() else {
            return out;
        };

        let still_holds = watch
            .new
            .as_ref()
            .map_or(true, |cond| cond.matches(&watch.extract(current)));
        let done = watch.oneshot || watch.expired;
        if still_holds {
            out.dispatch.push(Dispatch {
                handle: record.handle.clone(),
                app: record.app.clone(),
                kind: CallbackKind::State,
                pinning: record.pinning,
                invocation: watch.callback.bind(pending.args),
            });
        } else {
            debug!(listener, "State no longer satisfied when duration elapsed");
        }

        if (still_holds && done) || watch.expired {
            remove_fired(&mut records, vec![listener.to_string()], &mut out.cancel_timers);
        }
        out
    }

    /// Match any event other than `state_changed`
    pub fn match_event(&self, event: &Event) -> Matches {
        let mut out = Matches::default();
        let mut fired = Vec::new();
        let mut records = self.lock();

        for record in records.values() {
            if !namespace_matches(&record.namespace, &event.namespace) {
                continue;
            }
            let Listener::Event(watch) = &record.listener else {
                continue;
            };
            if !watch.selects(event) {
                continue;
            }
            let args = EventArgs {
                event_type: event.event_type.as_str().to_string(),
                data: event.data.clone(),
                kwargs: watch.kwargs.clone(),
            };
            out.dispatch.push(Dispatch {
                handle: record.handle.clone(),
                app: record.app.clone(),
                kind: CallbackKind::Event,
                pinning: record.pinning,
                invocation: watch.callback.bind(args),
            });
            if watch.oneshot {
                fired.push(record.handle.clone());
            }
        }

        remove_fired(&mut records, fired, &mut out.cancel_timers);
        out
    }

    /// Match an app log line
    pub fn match_log(&self, line: &LogEventData) -> Matches {
        let mut out = Matches::default();
        let level = line.level.parse::<LogLevel>().unwrap_or_else(|e| {
            warn!(error = %e, "Log line with unknown level");
            LogLevel::Info
        });
        let records = self.lock();

        for record in records.values() {
            let Listener::Log(watch) = &record.listener else {
                continue;
            };
            if level < watch.level {
                continue;
            }
            if watch
                .log_type
                .as_deref()
                .map_or(false, |t| t != line.log_type)
            {
                continue;
            }
            let args = LogArgs {
                app_name: line.app_name.clone(),
                ts: line.ts,
                level: line.level.clone(),
                log_type: line.log_type.clone(),
                message: line.message.clone(),
                kwargs: watch.kwargs.clone(),
            };
            out.dispatch.push(Dispatch {
                handle: record.handle.clone(),
                app: record.app.clone(),
                kind: CallbackKind::Log,
                pinning: record.pinning,
                invocation: watch.callback.bind(args),
            });
        }
        out
    }
}

fn remove_fired(
    records: &mut IndexMap<String, CallbackRecord>,
    fired: Vec<String>,
    cancel_timers: &mut Vec<String>,
) {
    for handle in fired {
        if let Some(record) = records.shift_remove(&handle) {
            trace!(handle = %handle, "Removing oneshot callback");
            cancel_timers.extend(record.timeout_timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_core::{EntityId, DEFAULT};
    use serde_json::json;
    use std::sync::{Arc, Mutex as StdMutex};

    type Seen = Arc<StdMutex<Vec<StateArgs>>>;

    fn recording() -> (Callback<StateArgs>, Seen) {
        let seen: Seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = Callback::sync(move |args: StateArgs| {
            sink.lock().unwrap().push(args);
            Ok(())
        });
        (cb, seen)
    }

    fn run(matches: Matches) {
        for d in matches.dispatch {
            match d.invocation {
                Invocation::Blocking(f) => f().unwrap(),
                Invocation::Async(_) => panic!("tests use sync callbacks"),
            }
        }
    }

    fn entity(id: &str, state: &str) -> EntityState {
        EntityState::new(id.parse::<EntityId>().unwrap(), json!(state), IndexMap::new())
    }

    fn change(id: &str, old: Option<&str>, new: Option<&str>) -> StateChangedData {
        StateChangedData {
            entity_id: id.to_string(),
            old_state: old.map(|s| entity(id, s)),
            new_state: new.map(|s| entity(id, s)),
        }
    }

    #[test]
    fn test_selector_forms() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state("app", DEFAULT, None, StateOptions::new(), cb.clone());
        registry.add_state("app", DEFAULT, Some("light"), StateOptions::new(), cb.clone());
        registry.add_state("app", DEFAULT, Some("light.hall"), StateOptions::new(), cb);

        run(registry.match_state(DEFAULT, &change("light.hall", Some("off"), Some("on"))));
        assert_eq!(seen.lock().unwrap().len(), 3);

        run(registry.match_state(DEFAULT, &change("switch.fan", Some("off"), Some("on"))));
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_unchanged_value_is_ignored() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state("app", DEFAULT, Some("light.hall"), StateOptions::new(), cb);

        run(registry.match_state(DEFAULT, &change("light.hall", Some("on"), Some("on"))));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_old_new_conditions_and_attribute_lookup() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state(
            "app",
            DEFAULT,
            Some("light.hall"),
            StateOptions::new()
                .attribute("brightness")
                .new_state(Condition::predicate(|v| v.as_i64().unwrap_or(0) > 100)),
            cb,
        );

        let mut old = entity("light.hall", "on");
        old.attributes.insert("brightness".into(), json!(50));
        let mut new = old.clone();
        new.attributes.insert("brightness".into(), json!(200));
        let data = StateChangedData {
            entity_id: "light.hall".into(),
            old_state: Some(old),
            new_state: Some(new),
        };
        run(registry.match_state(DEFAULT, &data));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old, json!(50));
        assert_eq!(seen[0].new, json!(200));
        assert_eq!(seen[0].attribute, "brightness");
    }

    #[test]
    fn test_missing_side_is_null() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state("app", DEFAULT, Some("sensor.x"), StateOptions::new(), cb);

        run(registry.match_state(DEFAULT, &change("sensor.x", None, Some("1"))));
        assert_eq!(seen.lock().unwrap()[0].old, Value::Null);
    }

    #[test]
    fn test_all_attribute_passes_records_even_without_change() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state(
            "app",
            DEFAULT,
            Some("light.hall"),
            StateOptions::new().attribute(ALL_ATTRIBUTES),
            cb,
        );

        run(registry.match_state(DEFAULT, &change("light.hall", Some("on"), Some("on"))));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].new["state"], json!("on"));
        assert_eq!(seen[0].new["entity_id"], json!("light.hall"));
    }

    #[test]
    fn test_oneshot_removed_after_first_fire() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        let handle = registry.add_state(
            "app",
            DEFAULT,
            Some("light.hall"),
            StateOptions::new().oneshot(),
            cb,
        );
        registry.set_timeout_timer(&handle, "timeout-1".into());

        let first = registry.match_state(DEFAULT, &change("light.hall", Some("off"), Some("on")));
        assert_eq!(first.cancel_timers, vec!["timeout-1".to_string()]);
        run(first);
        run(registry.match_state(DEFAULT, &change("light.hall", Some("on"), Some("off"))));

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!registry.contains(&handle));
    }

    #[test]
    fn test_namespace_rules() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state("app", "mqtt", None, StateOptions::new(), cb.clone());
        registry.add_state("app", GLOBAL, None, StateOptions::new(), cb);

        run(registry.match_state(DEFAULT, &change("light.a", Some("off"), Some("on"))));
        assert_eq!(seen.lock().unwrap().len(), 1);

        run(registry.match_state("mqtt", &change("light.a", Some("on"), Some("off"))));
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_duration_arms_and_retraction_cancels() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        registry.add_state(
            "app",
            DEFAULT,
            Some("binary_sensor.door"),
            StateOptions::new().new_state("open").duration(60),
            cb,
        );

        let opened = registry.match_state(
            DEFAULT,
            &change("binary_sensor.door", Some("closed"), Some("open")),
        );
        assert!(opened.dispatch.is_empty());
        assert_eq!(opened.arm.len(), 1);
        assert_eq!(opened.arm[0].fire_in, Duration::seconds(60));
        let timer = opened.arm[0].timer.clone();

        let closed = registry.match_state(
            DEFAULT,
            &change("binary_sensor.door", Some("open"), Some("closed")),
        );
        assert_eq!(closed.cancel_timers, vec![timer.clone()]);
        assert!(closed.arm.is_empty());

        let late = registry.fire_duration(
            &opened.arm[0].listener,
            &timer,
            Some(&entity("binary_sensor.door", "closed")),
        );
        assert!(late.dispatch.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duration_fires_with_captured_values() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        let handle = registry.add_state(
            "app",
            DEFAULT,
            Some("binary_sensor.door"),
            StateOptions::new().new_state("open").duration(60).oneshot(),
            cb,
        );

        let opened = registry.match_state(
            DEFAULT,
            &change("binary_sensor.door", Some("closed"), Some("open")),
        );
        let timer = opened.arm[0].timer.clone();

        run(registry.fire_duration(
            &handle,
            &timer,
            Some(&entity("binary_sensor.door", "open")),
        ));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old, json!("closed"));
        assert_eq!(seen[0].new, json!("open"));
        assert!(!registry.contains(&handle));
    }

    #[test]
    fn test_timeout_keeps_armed_duration() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        let handle = registry.add_state(
            "app",
            DEFAULT,
            Some("binary_sensor.door"),
            StateOptions::new().new_state("open").duration(60),
            cb,
        );
        let opened = registry.match_state(
            DEFAULT,
            &change("binary_sensor.door", Some("closed"), Some("open")),
        );

        assert!(!registry.expire(&handle));
        assert!(registry.contains(&handle));

        // Expired listeners stop matching
        let ignored = registry.match_state(
            DEFAULT,
            &change("binary_sensor.door", Some("open"), Some("closed")),
        );
        assert!(ignored.is_empty());

        run(registry.fire_duration(
            &handle,
            &opened.arm[0].timer,
            Some(&entity("binary_sensor.door", "open")),
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!registry.contains(&handle));
    }

    #[test]
    fn test_immediate_requires_existing_matching_entity() {
        let registry = CallbackRegistry::new();
        let (cb, seen) = recording();
        let handle = registry.add_state(
            "app",
            DEFAULT,
            Some("light.a"),
            StateOptions::new().new_state("on").immediate(),
            cb,
        );

        assert!(registry.immediate(&handle, None).is_empty());
        assert!(registry
            .immediate(&handle, Some(&entity("light.a", "off")))
            .is_empty());

        run(registry.immediate(&handle, Some(&entity("light.a", "on"))));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].old, Value::Null);
        assert_eq!(seen[0].new, json!("on"));
    }

    #[test]
    fn test_cancel_ownership_kind_and_idempotence() {
        let registry = CallbackRegistry::new();
        let (cb, _) = recording();
        let handle = registry.add_state("a", DEFAULT, None, StateOptions::new(), cb);

        assert!(matches!(
            registry.cancel("b", &handle, None),
            Err(CallbackError::NotOwner { .. })
        ));
        assert!(matches!(
            registry.cancel("a", &handle, Some(CallbackKind::Event)),
            Err(CallbackError::WrongKind { .. })
        ));
        assert!(registry.cancel("a", &handle, Some(CallbackKind::State)).is_ok());
        assert!(matches!(
            registry.cancel("a", &handle, None),
            Err(CallbackError::NotFound(_))
        ));
    }

    #[test]
    fn test_event_matching_and_filters() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(StdMutex::new(Vec::<String>::new()));
        let sink = hits.clone();
        let cb = Callback::sync(move |args: EventArgs| {
            sink.lock().unwrap().push(args.event_type);
            Ok(())
        });

        registry.add_event("app", DEFAULT, None, EventOptions::new(), cb.clone());
        registry.add_event(
            "app",
            DEFAULT,
            Some("button"),
            EventOptions::new().filter("id", "front"),
            cb.clone(),
        );
        registry.add_event("app", GLOBAL, Some("button"), EventOptions::new().oneshot(), cb);

        let run_events = |m: Matches| {
            for d in m.dispatch {
                if let Invocation::Blocking(f) = d.invocation {
                    f().unwrap();
                }
            }
        };

        run_events(registry.match_event(&Event::new(DEFAULT, "button", json!({"id": "back"}))));
        assert_eq!(hits.lock().unwrap().len(), 2);

        run_events(registry.match_event(&Event::new(DEFAULT, "button", json!({"id": "front"}))));
        assert_eq!(hits.lock().unwrap().len(), 4);

        run_events(registry.match_event(&Event::new(DEFAULT, "__AD_ENTITY_ADDED", json!({}))));
        assert_eq!(hits.lock().unwrap().len(), 4);
        assert_eq!(registry.count(Some("app"), Some(CallbackKind::Event)), 2);
    }

    #[test]
    fn test_log_level_threshold() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(StdMutex::new(0));
        let sink = hits.clone();
        registry.add_log(
            "watcher",
            LogOptions::new().level(LogLevel::Warning),
            Callback::sync(move |_: LogArgs| {
                *sink.lock().unwrap() += 1;
                Ok(())
            }),
        );
        assert!(registry.has_log_callback("watcher"));

        let line = |level: &str| LogEventData {
            app_name: "other".into(),
            ts: chrono::Utc::now(),
            level: level.into(),
            log_type: "main_log".into(),
            message: "hello".into(),
        };
        for m in [registry.match_log(&line("INFO")), registry.match_log(&line("ERROR"))] {
            for d in m.dispatch {
                if let Invocation::Blocking(f) = d.invocation {
                    f().unwrap();
                }
            }
        }
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_clear_app_returns_timers() {
        let registry = CallbackRegistry::new();
        let (cb, _) = recording();
        let h = registry.add_state("a", DEFAULT, None, StateOptions::new(), cb.clone());
        registry.set_timeout_timer(&h, "t1".into());
        registry.add_state("b", DEFAULT, None, StateOptions::new(), cb);

        let removed = registry.clear_app("a");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].timers(), vec!["t1".to_string()]);
        assert_eq!(registry.count(None, None), 1);
    }
}
