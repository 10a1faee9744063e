//! `wait_state` steps

use crate::{SequenceError, SequenceResult};
use ad_clock::SharedClock;
use ad_config::{WaitState, MAX_STEP_SECONDS};
use ad_core::events::{StateChangedData, STATE_CHANGED};
use ad_core::EntityState;
use ad_event_bus::EventBus;
use ad_state_store::StateStore;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

fn observed(record: &EntityState, wait: &WaitState) -> Option<Value> {
    match wait.attribute.as_deref() {
        None => Some(record.state.clone()),
        Some(attribute) => record.lookup(attribute),
    }
}

/// Whether `record` satisfies the wait; with no target state only a change counts
fn satisfied(record: Option<&EntityState>, wait: &WaitState, changed: bool) -> bool {
    match (&wait.state, record) {
        (None, _) => changed,
        (Some(target), Some(record)) => observed(record, wait).as_ref() == Some(target),
        (Some(_), None) => false,
    }
}

/// Step seconds as a delta; out-of-range input (only possible for steps
/// built in code) is clamped to `0..=MAX_STEP_SECONDS`
pub(crate) fn seconds(secs: f64) -> Duration {
    let secs = if secs.is_nan() { 0.0 } else { secs.clamp(0.0, MAX_STEP_SECONDS) };
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

/// Block until the entity matches for `duration`, or fail after `timeout`
pub(crate) async fn wait_for_state(
    state: &StateStore,
    bus: &EventBus,
    clock: &SharedClock,
    namespace: &str,
    wait: &WaitState,
) -> SequenceResult<()> {
    // Subscribe before the first check so no change slips through
    let mut changes = bus.subscribe(STATE_CHANGED);
    let start = clock.now();
    let deadline = start + seconds(wait.timeout);
    let hold = wait.duration.map(seconds);

    let current = state.get_entity(namespace, &wait.entity_id);
    let mut held_since: Option<DateTime<Utc>> =
        satisfied(current.as_ref(), wait, false).then_some(start);

    loop {
        let now = clock.now();
        if let Some(since) = held_since {
            match hold {
                None => break,
                Some(hold) if now >= since + hold => break,
                Some(_) => {}
            }
        }
        if now >= deadline {
            return Err(SequenceError::Timeout {
                entity_id: wait.entity_id.clone(),
                seconds: wait.timeout,
            });
        }

        let wake = match (held_since, hold) {
            (Some(since), Some(hold)) => deadline.min(since + hold),
            _ => deadline,
        };

        tokio::select! {
            _ = clock.sleep_until(wake) => {}
            received = changes.recv() => match received {
                Ok(event) => {
                    if event.namespace != namespace {
                        continue;
                    }
                    let Ok(data) = serde_json::from_value::<StateChangedData>(event.data) else {
                        continue;
                    };
                    if data.entity_id != wait.entity_id {
                        continue;
                    }
                    trace!(entity_id = %data.entity_id, "Observed change while waiting");
                    held_since = if satisfied(data.new_state.as_ref(), wait, true) {
                        held_since.or(Some(clock.now()))
                    } else {
                        None
                    };
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "Missed state changes while waiting, re-reading entity");
                    let current = state.get_entity(namespace, &wait.entity_id);
                    if !satisfied(current.as_ref(), wait, false) {
                        held_since = None;
                    } else if held_since.is_none() {
                        held_since = Some(clock.now());
                    }
                }
                Err(RecvError::Closed) => {
                    clock.sleep_until(deadline).await;
                }
            }
        }
    }
    debug!(entity_id = %wait.entity_id, "Wait satisfied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_seconds_stay_in_range() {
        assert_eq!(seconds(1.5), Duration::milliseconds(1500));
        assert_eq!(seconds(-3.0), Duration::zero());
        assert_eq!(seconds(f64::NAN), Duration::zero());
        let cap = Duration::milliseconds((MAX_STEP_SECONDS * 1000.0) as i64);
        assert_eq!(seconds(1e300), cap);
        assert_eq!(seconds(f64::INFINITY), cap);
    }
}
