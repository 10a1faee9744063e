//! Sunrise/sunset for a fixed geographic position

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sunrise::{Coordinates, SolarDay, SolarEvent};
use thiserror::Error;

/// Sun calculation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SunError {
    #[error("invalid coordinates: latitude={latitude}, longitude={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("no {event} within a year of {after}")]
    NoEvent {
        event: SunEvent,
        after: DateTime<Utc>,
    },
}

/// Which horizon crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SunEvent {
    Rising,
    Setting,
}

impl SunEvent {
    fn solar_event(self) -> SolarEvent {
        match self {
            SunEvent::Rising => SolarEvent::Sunrise,
            SunEvent::Setting => SolarEvent::Sunset,
        }
    }
}

impl std::fmt::Display for SunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SunEvent::Rising => f.write_str("sunrise"),
            SunEvent::Setting => f.write_str("sunset"),
        }
    }
}

/// Longest gap searched for the next event (covers polar day/night)
const SEARCH_DAYS: i64 = 370;

/// Computes sun events from latitude, longitude and elevation
#[derive(Debug, Clone, Copy)]
pub struct SunCalculator {
    latitude: f64,
    longitude: f64,
    elevation: f64,
}

impl SunCalculator {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Result<Self, SunError> {
        Coordinates::new(latitude, longitude)
            .ok_or(SunError::InvalidCoordinates { latitude, longitude })?;
        Ok(Self {
            latitude,
            longitude,
            elevation,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// The event as computed for a given (UTC) calendar date
    fn event_on(&self, date: NaiveDate, event: SunEvent) -> Option<DateTime<Utc>> {
        let coordinates = Coordinates::new(self.latitude, self.longitude)?;
        Some(
            SolarDay::new(coordinates, date)
                .with_altitude(self.elevation)
                .event_time(event.solar_event()),
        )
    }

    /// First occurrence strictly after `after`
    pub fn next(&self, event: SunEvent, after: DateTime<Utc>) -> Result<DateTime<Utc>, SunError> {
        let start = after.date_naive() - Duration::days(1);
        (0..SEARCH_DAYS)
            .filter_map(|offset| self.event_on(start + Duration::days(offset), event))
            .find(|at| *at > after)
            .ok_or(SunError::NoEvent {
                event,
                after,
            })
    }

    /// Most recent occurrence at or before `at`
    pub fn last(&self, event: SunEvent, at: DateTime<Utc>) -> Result<DateTime<Utc>, SunError> {
        let start = at.date_naive() + Duration::days(1);
        (0..SEARCH_DAYS)
            .filter_map(|offset| self.event_on(start - Duration::days(offset), event))
            .find(|t| *t <= at)
            .ok_or(SunError::NoEvent {
                event,
                after: at,
            })
    }

    pub fn next_rising(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SunError> {
        self.next(SunEvent::Rising, after)
    }

    pub fn next_setting(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, SunError> {
        self.next(SunEvent::Setting, after)
    }

    /// The sun is up when it will set before it rises again
    pub fn sun_up(&self, at: DateTime<Utc>) -> Result<bool, SunError> {
        Ok(self.next_setting(at)? < self.next_rising(at)?)
    }
}
