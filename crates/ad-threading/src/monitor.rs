//! Starvation check
//!
//! Once the total backlog passes the threshold, non-empty slots are reported
//! after `iterations` consecutive busy ticks and then once every `step` ticks
//! while the backlog persists.

use crate::{SlotStatus, WorkerPool};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct QueueMonitor {
    threshold: usize,
    step: u32,
    iterations: u32,
    warning_step: u32,
    warning_iterations: u32,
}

impl QueueMonitor {
    pub fn new(threshold: usize, step: u32, iterations: u32) -> Self {
        Self {
            threshold,
            step: step.max(1),
            iterations,
            warning_step: 0,
            warning_iterations: 0,
        }
    }

    /// Run one tick, returning the slots that were reported
    pub fn check(&mut self, pool: &WorkerPool) -> Vec<SlotStatus> {
        self.observe(pool.status())
    }

    fn observe(&mut self, status: Vec<SlotStatus>) -> Vec<SlotStatus> {
        let total: usize = status.iter().map(|s| s.q).sum();
        if total <= self.threshold {
            self.warning_step = 0;
            self.warning_iterations = 0;
            return Vec::new();
        }

        let mut reported = Vec::new();
        let due = (self.warning_step == 0 && self.warning_iterations >= self.iterations)
            || self.warning_iterations == self.iterations;
        if due {
            for slot in status.into_iter().filter(|s| s.q > 0) {
                warn!(
                    slot = slot.id,
                    q = slot.q,
                    callback = %slot.callback,
                    "Queue size for thread-{} is {}, callback is '{}'",
                    slot.id,
                    slot.q,
                    slot.callback
                );
                reported.push(slot);
            }
            self.warning_step = 0;
        }
        self.warning_step += 1;
        self.warning_iterations += 1;
        if self.warning_step >= self.step {
            self.warning_step = 0;
        }
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy(q: usize) -> Vec<SlotStatus> {
        vec![
            SlotStatus {
                id: 0,
                q,
                callback: "app.cb".into(),
                last_callback: None,
            },
            SlotStatus {
                id: 1,
                q: 0,
                callback: "idle".into(),
                last_callback: None,
            },
        ]
    }

    #[test]
    fn test_quiet_below_threshold() {
        let mut monitor = QueueMonitor::new(10, 5, 0);
        for _ in 0..20 {
            assert!(monitor.observe(busy(10)).is_empty());
        }
    }

    #[test]
    fn test_throttled_after_iterations() {
        let mut monitor = QueueMonitor::new(10, 3, 2);
        let warned: Vec<usize> = (0..10)
            .map(|_| monitor.observe(busy(50)).len())
            .collect();
        // First report on the third busy tick, then every third tick
        assert_eq!(warned, vec![0, 0, 1, 0, 0, 1, 0, 0, 1, 0]);

        // Backlog clears and the counters reset
        assert!(monitor.observe(busy(0)).is_empty());
        assert!(monitor.observe(busy(50)).is_empty());
    }
}
