//! Timer scheduling for apps
//!
//! - [`TimeSpec`] - the time strings scheduling calls accept
//! - [`Scheduler`] - ordered timer entries, sun reseating and DST handling
//!
//! The scheduler never runs callbacks itself. The runtime's loop calls
//! [`Scheduler::tick`] and hands each [`Fired`] entry to the worker pool.

mod scheduler;
mod timespec;

pub use scheduler::{
    Fired, ScheduleAction, ScheduleEntry, ScheduleRequest, Scheduler, SharedScheduler, TimerInfo,
    TimerOptions,
};
pub use timespec::{localize, next_time_of_day, parse_hms, resolve_sun, TimeSpec};

use ad_clock::SunError;
use thiserror::Error;

/// Result type for scheduling operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid time: {0}")]
    InvalidTime(String),

    #[error("unable to parse time '{0}'")]
    Parse(String),

    #[error("sun calculation failed: {0}")]
    Sun(#[from] SunError),

    #[error("no timer with handle {0}")]
    NotFound(String),

    #[error("timer {0} is sun-anchored and cannot be reset")]
    SunTimerReset(String),

    #[error("offset and random_start/random_end cannot be combined")]
    OffsetWithRandom,
}
