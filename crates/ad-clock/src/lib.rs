//! Time sources for the runtime
//!
//! - [`Clock`] - the single source of "now" for every subsystem
//! - [`SystemClock`] - wall time
//! - [`VirtualClock`] - test/timewarp clock that only moves when told to
//! - [`SunCalculator`] - next sunrise/sunset for a fixed position
//! - [`dst`] - daylight saving transitions in the configured time zone

mod clock;
pub mod dst;
mod sun;

pub use clock::{Clock, SharedClock, SystemClock, VirtualClock};
pub use dst::DstTracker;
pub use sun::{SunCalculator, SunError, SunEvent};

pub use chrono_tz::Tz;
