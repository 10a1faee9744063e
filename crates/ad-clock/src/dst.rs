//! Daylight saving detection in the configured time zone

use chrono::{DateTime, Duration, Offset, TimeZone, Utc};
use chrono_tz::{OffsetComponents, Tz};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Whether `tz` observes daylight saving at `at`
pub fn is_dst(tz: Tz, at: DateTime<Utc>) -> bool {
    tz.offset_from_utc_datetime(&at.naive_utc()).dst_offset() != Duration::zero()
}

/// Total UTC offset of `tz` at `at`, in seconds
pub fn utc_offset_seconds(tz: Tz, at: DateTime<Utc>) -> i32 {
    tz.offset_from_utc_datetime(&at.naive_utc())
        .fix()
        .local_minus_utc()
}

/// First instant after `after` (within `horizon`) at which the UTC offset changes
///
/// Hour-granular scan followed by a bisection down to one second.
pub fn next_transition(tz: Tz, after: DateTime<Utc>, horizon: Duration) -> Option<DateTime<Utc>> {
    let base = utc_offset_seconds(tz, after);
    let end = after + horizon;
    let mut lo = after;
    loop {
        let hi = lo + Duration::hours(1);
        if hi > end {
            return None;
        }
        if utc_offset_seconds(tz, hi) != base {
            return Some(bisect(tz, lo, hi, base));
        }
        lo = hi;
    }
}

fn bisect(tz: Tz, mut lo: DateTime<Utc>, mut hi: DateTime<Utc>, base: i32) -> DateTime<Utc> {
    while hi - lo > Duration::seconds(1) {
        let mid = lo + (hi - lo) / 2;
        if utc_offset_seconds(tz, mid) == base {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Remembers the last observed DST flag and reports flips
///
/// The utility loop polls [`DstTracker::observe`] each cycle; a `true` return
/// means timers anchored to a local time of day need recomputing.
#[derive(Debug)]
pub struct DstTracker {
    tz: Tz,
    in_dst: AtomicBool,
}

impl DstTracker {
    pub fn new(tz: Tz, now: DateTime<Utc>) -> Self {
        Self {
            tz,
            in_dst: AtomicBool::new(is_dst(tz, now)),
        }
    }

    pub fn time_zone(&self) -> Tz {
        self.tz
    }

    /// Record the flag at `now`, returning whether it changed since last time
    pub fn observe(&self, now: DateTime<Utc>) -> bool {
        let current = is_dst(self.tz, now);
        let previous = self.in_dst.swap(current, Ordering::SeqCst);
        if previous != current {
            debug!(tz = %self.tz, dst = current, "Daylight saving flag changed");
            true
        } else {
            false
        }
    }
}
