//! Clock abstraction for supporting both wall time and virtual time

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Single source of time for the runtime
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as fractional seconds since the epoch
    fn now_ts(&self) -> f64 {
        let now = self.now();
        now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
    }

    /// Resolve once `now() >= instant`
    async fn sleep_until(&self, instant: DateTime<Utc>);

    /// False for clocks that only move when driven explicitly
    fn is_realtime(&self) -> bool;
}

/// Thread-safe handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, instant: DateTime<Utc>) {
        let delta = instant - Utc::now();
        if let Ok(delay) = delta.to_std() {
            tokio::time::sleep(delay).await;
        }
    }

    fn is_realtime(&self) -> bool {
        true
    }
}

/// A controllable clock
///
/// Time only advances through [`VirtualClock::advance`] or [`VirtualClock::set`].
/// Sleepers are woken whenever the clock moves.
#[derive(Clone)]
pub struct VirtualClock {
    nanos: Arc<AtomicI64>,
    moved: Arc<Notify>,
}

impl VirtualClock {
    /// Create a virtual clock starting at a specific time
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(to_nanos(time))),
            moved: Arc::new(Notify::new()),
        }
    }

    /// Create a virtual clock starting at the current wall time
    pub fn starting_now() -> Self {
        Self::at(Utc::now())
    }

    /// Set the current time
    pub fn set(&self, time: DateTime<Utc>) {
        self.nanos.store(to_nanos(time), Ordering::SeqCst);
        self.moved.notify_waiters();
    }

    /// Advance time by a duration
    pub fn advance(&self, duration: Duration) {
        let step = duration.num_nanoseconds().unwrap_or(i64::MAX);
        self.nanos.fetch_add(step, Ordering::SeqCst);
        self.moved.notify_waiters();
    }

    /// Advance time by seconds
    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }
}

fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }

    async fn sleep_until(&self, instant: DateTime<Utc>) {
        loop {
            let moved = self.moved.notified();
            if self.now() >= instant {
                return;
            }
            moved.await;
        }
    }

    fn is_realtime(&self) -> bool {
        false
    }
}
