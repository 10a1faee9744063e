//! The timer set
//!
//! Entries live in a map keyed by id; a `BTreeMap` keyed by
//! `(timestamp, sequence)` keeps them ordered for [`Scheduler::tick`].
//! Sun-anchored entries leave the ordered index after firing (`inactive`)
//! and come back when the matching sun transition reseats them.

use crate::timespec::{localize, next_time_of_day, resolve_sun, TimeSpec};
use crate::{SchedulerError, SchedulerResult};
use ad_callbacks::{new_handle, Callback, Pinning, TimerArgs};
use ad_clock::{DstTracker, SharedClock, SunCalculator, SunEvent};
use ad_core::Kwargs;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, warn};

/// What happens when an entry comes due
#[derive(Debug, Clone)]
pub enum ScheduleAction {
    /// A user timer callback
    Timer(Callback<TimerArgs>),
    /// A state listener's `duration` elapsed
    StateDuration {
        listener: String,
        namespace: String,
        entity_id: String,
    },
    /// A listener's `timeout` elapsed
    ListenerTimeout { listener: String },
}

/// Options shared by every scheduling call
#[derive(Debug, Clone, Default)]
pub struct TimerOptions {
    /// Fixed offset; sun calls only, exclusive with `random_*`
    pub offset: Option<Duration>,
    pub random_start: Option<i64>,
    pub random_end: Option<i64>,
    pub pinning: Pinning,
    pub kwargs: Kwargs,
}

impl TimerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(mut self, seconds: i64) -> Self {
        self.offset = Some(Duration::seconds(seconds));
        self
    }

    pub fn random(mut self, start: i64, end: i64) -> Self {
        self.random_start = Some(start);
        self.random_end = Some(end);
        self
    }

    pub fn pin_thread(mut self, slot: usize) -> Self {
        self.pinning.pin_thread = Some(slot);
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    fn jitter_bounds(&self) -> Option<(i64, i64)> {
        match (self.random_start, self.random_end) {
            (None, None) => None,
            (start, end) => {
                let (a, b) = (start.unwrap_or(0), end.unwrap_or(0));
                Some((a.min(b), a.max(b)))
            }
        }
    }
}

/// One scheduled timer
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: String,
    pub app: String,
    /// Un-jittered time of the next occurrence
    pub basetime: DateTime<Utc>,
    /// When the entry actually fires
    pub timestamp: DateTime<Utc>,
    /// Jitter drawn for this occurrence
    pub offset: Duration,
    pub interval: Option<Duration>,
    /// Sun event and fixed offset for sun-anchored entries
    pub sun: Option<(SunEvent, Duration)>,
    pub inactive: bool,
    pub random: Option<(i64, i64)>,
    /// Local time of day the entry is pinned to, for DST recomputation
    pub anchor: Option<NaiveTime>,
    /// Delay from creation to first fire, reused by `reset`
    pub basetime_interval: Duration,
    pub action: ScheduleAction,
    pub kwargs: Kwargs,
    pub pinning: Pinning,
    seq: u64,
}

impl ScheduleEntry {
    pub fn is_sun(&self) -> bool {
        self.sun.is_some()
    }

    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.seq)
    }
}

/// An entry that came due
#[derive(Debug, Clone)]
pub struct Fired {
    pub id: String,
    pub app: String,
    pub timestamp: DateTime<Utc>,
    pub action: ScheduleAction,
    pub kwargs: Kwargs,
    pub pinning: Pinning,
}

/// `info_timer` result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerInfo {
    pub timestamp: DateTime<Utc>,
    /// Repeat interval in seconds, 0 for one-shot timers
    pub interval: i64,
    pub kwargs: Kwargs,
}

/// Request to insert an entry
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub id: Option<String>,
    pub app: String,
    pub basetime: DateTime<Utc>,
    pub interval: Option<Duration>,
    pub sun: Option<(SunEvent, Duration)>,
    pub anchor: Option<NaiveTime>,
    pub action: ScheduleAction,
    pub options: TimerOptions,
}

impl ScheduleRequest {
    pub fn at(app: impl Into<String>, basetime: DateTime<Utc>, action: ScheduleAction) -> Self {
        Self {
            id: None,
            app: app.into(),
            basetime,
            interval: None,
            sun: None,
            anchor: None,
            action,
            options: TimerOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn anchored(mut self, t: NaiveTime) -> Self {
        self.anchor = Some(t);
        self
    }

    pub fn options(mut self, options: TimerOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, ScheduleEntry>,
    order: BTreeMap<(DateTime<Utc>, u64), String>,
    next_seq: u64,
}

impl Inner {
    fn index(&mut self, entry: &mut ScheduleEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(entry.key(), entry.id.clone());
    }

    fn unindex(&mut self, entry: &ScheduleEntry) {
        self.order.remove(&entry.key());
    }
}

fn draw_jitter(bounds: Option<(i64, i64)>) -> Duration {
    match bounds {
        Some((start, end)) if start < end => {
            Duration::seconds(rand::thread_rng().gen_range(start..=end))
        }
        Some((start, _)) => Duration::seconds(start),
        None => Duration::zero(),
    }
}

/// Ordered set of timer entries for every app
pub struct Scheduler {
    inner: Mutex<Inner>,
    clock: SharedClock,
    sun: SunCalculator,
    dst: DstTracker,
}

impl Scheduler {
    pub fn new(clock: SharedClock, sun: SunCalculator, tz: Tz) -> Self {
        let dst = DstTracker::new(tz, clock.now());
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            sun,
            dst,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn time_zone(&self) -> Tz {
        self.dst.time_zone()
    }

    pub fn sun(&self) -> &SunCalculator {
        &self.sun
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Insert an entry, returning its id
    #[instrument(skip(self, request), fields(app = %request.app))]
    pub fn insert(&self, request: ScheduleRequest) -> SchedulerResult<String> {
        let now = self.now();
        let random = request.options.jitter_bounds();
        if request.sun.is_some() && random.is_some() && request.options.offset.is_some() {
            return Err(SchedulerError::OffsetWithRandom);
        }

        let offset = draw_jitter(random);
        let timestamp = request.basetime + offset;
        let id = request.id.unwrap_or_else(new_handle);
        let mut entry = ScheduleEntry {
            id: id.clone(),
            app: request.app,
            basetime: request.basetime,
            timestamp,
            offset,
            interval: request.interval,
            sun: request.sun,
            inactive: false,
            random,
            anchor: request.anchor,
            basetime_interval: timestamp - now,
            action: request.action,
            kwargs: request.options.kwargs,
            pinning: request.options.pinning,
            seq: 0,
        };

        debug!(id = %id, timestamp = %timestamp, "Scheduling entry");
        let mut inner = self.lock();
        if let Some(previous) = inner.entries.remove(&id) {
            inner.unindex(&previous);
        }
        inner.index(&mut entry);
        inner.entries.insert(id.clone(), entry);
        Ok(id)
    }

    fn timer(app: &str, basetime: DateTime<Utc>, callback: Callback<TimerArgs>) -> ScheduleRequest {
        ScheduleRequest::at(app, basetime, ScheduleAction::Timer(callback))
    }

    /// Run once after `seconds`
    pub fn run_in(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        seconds: f64,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let delay = Duration::milliseconds((seconds * 1000.0).round() as i64);
        self.insert(Self::timer(app, self.now() + delay, callback).options(options))
    }

    /// Run once at an absolute time; a time already past is rejected
    pub fn run_at(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        at: &TimeSpec,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let now = self.now();
        if let TimeSpec::Sun { event, offset } = *at {
            return self.run_at_sun(app, callback, event, offset, options, false);
        }
        let when = at.resolve(now, self.time_zone(), &self.sun)?;
        if when < now {
            return Err(SchedulerError::InvalidTime(format!(
                "{when} is in the past"
            )));
        }
        self.insert(Self::timer(app, when, callback).options(options))
    }

    /// Run once at the next occurrence of a time of day (today or tomorrow)
    pub fn run_once(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        at: &TimeSpec,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        match *at {
            TimeSpec::TimeOfDay(t) => {
                let when = next_time_of_day(self.time_zone(), self.now(), t);
                self.insert(Self::timer(app, when, callback).anchored(t).options(options))
            }
            _ => self.run_at(app, callback, at, options),
        }
    }

    /// Run every day at a time of day, or at a sun event
    pub fn run_daily(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        at: &TimeSpec,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let now = self.now();
        match *at {
            TimeSpec::Sun { event, offset } => {
                self.run_at_sun(app, callback, event, offset, options, true)
            }
            TimeSpec::TimeOfDay(t) => {
                let when = next_time_of_day(self.time_zone(), now, t);
                self.insert(
                    Self::timer(app, when, callback)
                        .every(Duration::days(1))
                        .anchored(t)
                        .options(options),
                )
            }
            _ => {
                let start = at.resolve(now, self.time_zone(), &self.sun)?;
                self.run_every_from(app, callback, start, Duration::days(1), options)
            }
        }
    }

    pub fn run_hourly(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        start: Option<&TimeSpec>,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        self.run_every(app, callback, start, Duration::hours(1), options)
    }

    pub fn run_minutely(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        start: Option<&TimeSpec>,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        self.run_every(app, callback, start, Duration::minutes(1), options)
    }

    /// Repeat every `interval`, first firing at `start` or the first period
    /// boundary after now
    pub fn run_every(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        start: Option<&TimeSpec>,
        interval: Duration,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        if interval <= Duration::zero() {
            return Err(SchedulerError::InvalidTime(
                "interval must be positive".to_string(),
            ));
        }
        let now = self.now();
        let start = match start {
            None => now + interval,
            Some(spec) if spec.is_sun() => {
                return Err(SchedulerError::InvalidTime(
                    "run_every cannot start at a sun event".to_string(),
                ))
            }
            Some(spec) => spec.resolve(now, self.time_zone(), &self.sun)?,
        };
        self.run_every_from(app, callback, start, interval, options)
    }

    fn run_every_from(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        mut start: DateTime<Utc>,
        interval: Duration,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let now = self.now();
        if start < now {
            let behind = (now - start).num_milliseconds();
            let step = interval.num_milliseconds().max(1);
            let periods = (behind + step - 1) / step;
            start += Duration::milliseconds(periods * step);
        }
        self.insert(Self::timer(app, start, callback).every(interval).options(options))
    }

    pub fn run_at_sunrise(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let offset = options.offset.unwrap_or_else(Duration::zero);
        self.run_at_sun(app, callback, SunEvent::Rising, offset, options, true)
    }

    pub fn run_at_sunset(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        options: TimerOptions,
    ) -> SchedulerResult<String> {
        let offset = options.offset.unwrap_or_else(Duration::zero);
        self.run_at_sun(app, callback, SunEvent::Setting, offset, options, true)
    }

    fn run_at_sun(
        &self,
        app: &str,
        callback: Callback<TimerArgs>,
        event: SunEvent,
        offset: Duration,
        options: TimerOptions,
        repeat: bool,
    ) -> SchedulerResult<String> {
        let when = resolve_sun(&self.sun, event, offset, self.now())?;
        let mut request = Self::timer(app, when, callback).options(options);
        request.sun = Some((event, offset));
        if !repeat {
            // A one-off sun timer is an ordinary timer at the resolved instant
            request.sun = None;
        }
        self.insert(request)
    }

    // ------------------------------------------------------------------
    // Cancellation and introspection
    // ------------------------------------------------------------------

    /// Remove an entry, even if it is already due
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(id) {
            Some(entry) => {
                if !entry.inactive {
                    inner.unindex(&entry);
                }
                trace!(id, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove every entry owned by an app
    pub fn cancel_app(&self, app: &str) -> usize {
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.app == app)
            .map(|e| e.id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = inner.entries.remove(id) {
                if !entry.inactive {
                    inner.unindex(&entry);
                }
            }
        }
        if !ids.is_empty() {
            debug!(app, count = ids.len(), "Cancelled app timers");
        }
        ids.len()
    }

    pub fn timer_running(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    pub fn owner(&self, id: &str) -> Option<String> {
        self.lock().entries.get(id).map(|e| e.app.clone())
    }

    pub fn info(&self, id: &str) -> Option<TimerInfo> {
        self.lock().entries.get(id).map(|e| TimerInfo {
            timestamp: e.timestamp,
            interval: e.interval.map(|i| i.num_seconds()).unwrap_or(0),
            kwargs: e.kwargs.clone(),
        })
    }

    pub fn entry(&self, id: &str) -> Option<ScheduleEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// Entries in firing order, inactive sun entries last
    pub fn entries(&self, app: Option<&str>) -> Vec<ScheduleEntry> {
        let inner = self.lock();
        let out: Vec<ScheduleEntry> = inner
            .order
            .values()
            .filter_map(|id| inner.entries.get(id))
            .chain(inner.entries.values().filter(|e| e.inactive))
            .filter(|e| app.map_or(true, |a| e.app == a))
            .cloned()
            .collect();
        out
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest active timestamp
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.lock().order.keys().next().map(|(ts, _)| *ts)
    }

    /// Restart a timer as if it had just been created
    pub fn reset(&self, id: &str) -> SchedulerResult<()> {
        let now = self.now();
        let mut inner = self.lock();
        let mut entry = inner
            .entries
            .remove(id)
            .ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        if entry.is_sun() {
            inner.entries.insert(id.to_string(), entry);
            return Err(SchedulerError::SunTimerReset(id.to_string()));
        }
        inner.unindex(&entry);
        entry.timestamp = now + entry.basetime_interval;
        entry.basetime = entry.timestamp - entry.offset;
        debug!(id, timestamp = %entry.timestamp, "Timer reset");
        inner.index(&mut entry);
        inner.entries.insert(id.to_string(), entry);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Pop every entry due at `now`, in timestamp order
    ///
    /// One-shot entries are deleted, sun entries go inactive, repeating
    /// entries move forward by their interval with fresh jitter.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Fired> {
        let mut inner = self.lock();
        let due: Vec<((DateTime<Utc>, u64), String)> = inner
            .order
            .range(..=(now, u64::MAX))
            .map(|(k, id)| (*k, id.clone()))
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for (key, id) in due {
            inner.order.remove(&key);
            let Some(mut entry) = inner.entries.remove(&id) else {
                continue;
            };
            fired.push(Fired {
                id: entry.id.clone(),
                app: entry.app.clone(),
                timestamp: entry.timestamp,
                action: entry.action.clone(),
                kwargs: entry.kwargs.clone(),
                pinning: entry.pinning,
            });

            if entry.is_sun() {
                entry.inactive = true;
                inner.entries.insert(id, entry);
            } else if let Some(interval) = entry.interval {
                entry.basetime += interval;
                entry.offset = draw_jitter(entry.random);
                entry.timestamp = entry.basetime + entry.offset;
                inner.index(&mut entry);
                inner.entries.insert(id, entry);
            }
        }
        fired
    }

    /// Reactivate sun entries after the sun crossed the horizon
    ///
    /// `event` is the side that just elapsed: `Rising` when the sun came up.
    pub fn reseat_sun(&self, event: SunEvent) -> usize {
        let now = self.now();
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.inactive && e.sun.map(|(ev, _)| ev) == Some(event))
            .map(|e| e.id.clone())
            .collect();

        let mut count = 0;
        for id in ids {
            let Some(mut entry) = inner.entries.remove(&id) else {
                continue;
            };
            let Some((ev, offset)) = entry.sun else {
                continue;
            };
            match resolve_sun(&self.sun, ev, offset, now) {
                Ok(basetime) => {
                    entry.basetime = basetime;
                    entry.offset = draw_jitter(entry.random);
                    entry.timestamp = basetime + entry.offset;
                    entry.inactive = false;
                    trace!(id = %id, timestamp = %entry.timestamp, "Reseated sun entry");
                    inner.index(&mut entry);
                    count += 1;
                }
                Err(e) => warn!(id = %id, error = %e, "Could not reseat sun entry"),
            }
            inner.entries.insert(id, entry);
        }
        if count > 0 {
            debug!(%event, count, "Reseated sun entries");
        }
        count
    }

    /// Check for a DST flip and recompute time-of-day anchored entries
    pub fn check_dst(&self, now: DateTime<Utc>) -> bool {
        if !self.dst.observe(now) {
            return false;
        }
        info!("Daylight Savings Time transition detected");
        let tz = self.time_zone();
        let mut inner = self.lock();
        let ids: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.anchor.is_some() && !e.inactive)
            .map(|e| e.id.clone())
            .collect();
        for id in ids {
            let Some(mut entry) = inner.entries.remove(&id) else {
                continue;
            };
            inner.unindex(&entry);
            if let Some(anchor) = entry.anchor {
                let date = entry.basetime.with_timezone(&tz).date_naive();
                entry.basetime = localize(tz, date.and_time(anchor));
                entry.timestamp = entry.basetime + entry.offset;
                trace!(id = %id, timestamp = %entry.timestamp, "Recomputed anchored entry");
            }
            inner.index(&mut entry);
            inner.entries.insert(id, entry);
        }
        true
    }
}

/// Thread-safe wrapper for Scheduler
pub type SharedScheduler = std::sync::Arc<Scheduler>;
