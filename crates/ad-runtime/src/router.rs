//! Bus listener that turns events into callback dispatches

use crate::kernel::Kernel;
use ad_core::events::{LogEventData, StateChangedData, LOG_EVENT, STATE_CHANGED};
use ad_core::{Event, ADMIN};
use ad_event_bus::EventListener;
use std::sync::Weak;
use tracing::{trace, warn};

/// Matches every fired event against the callback registry
///
/// Runs inside `EventBus::fire`, so all callbacks for one event are queued
/// before the next event is looked at.
pub struct EventRouter {
    kernel: Weak<Kernel>,
}

impl EventRouter {
    pub fn new(kernel: Weak<Kernel>) -> Self {
        Self { kernel }
    }
}

impl EventListener for EventRouter {
    fn on_event(&self, event: &Event) {
        let Some(kernel) = self.kernel.upgrade() else {
            return;
        };

        if event.event_type == STATE_CHANGED {
            // Admin entities are the runtime's own bookkeeping
            if event.namespace == ADMIN {
                return;
            }
            match serde_json::from_value::<StateChangedData>(event.data.clone()) {
                Ok(change) => {
                    trace!(namespace = %event.namespace, entity_id = %change.entity_id, "Routing state change");
                    kernel.route(kernel.callbacks.match_state(&event.namespace, &change));
                }
                Err(e) => warn!(namespace = %event.namespace, error = %e, "Malformed state_changed event"),
            }
            return;
        }

        if event.event_type == LOG_EVENT && event.namespace == ADMIN {
            match serde_json::from_value::<LogEventData>(event.data.clone()) {
                Ok(line) => kernel.route(kernel.callbacks.match_log(&line)),
                Err(e) => warn!(error = %e, "Malformed log event"),
            }
        }
        kernel.route(kernel.callbacks.match_event(event));
    }
}
