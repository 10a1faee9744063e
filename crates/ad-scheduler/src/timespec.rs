//! Time strings accepted by the scheduling calls
//!
//! ```text
//! HH:MM:SS[.frac]                time of day, local
//! 2024-06-01T08:00:00+02:00      instant (a naive date-time is taken as local)
//! sunrise | sunset               sun-anchored
//! sunset - 00:30:00              sun-anchored with offset (may exceed 24h)
//! now                            current instant
//! now + 00:10:00                 relative
//! ```

use crate::{SchedulerError, SchedulerResult};
use ad_clock::{SunCalculator, SunEvent};
use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    TimeOfDay(NaiveTime),
    Instant(DateTime<Utc>),
    LocalInstant(NaiveDateTime),
    Sun { event: SunEvent, offset: Duration },
    Now,
    NowPlus(Duration),
}

fn sun_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)(sunrise|sunset)\s*(?:([+-])\s*(\S+))?$").ok())
        .as_ref()
}

fn now_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)now\s*\+\s*(\S+)$").ok())
        .as_ref()
}

/// Parse `HH:MM:SS[.frac]` (hours unbounded) or plain seconds into a duration
pub fn parse_hms(s: &str) -> SchedulerResult<Duration> {
    let bad = || SchedulerError::Parse(s.to_string());
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [secs] => (0, 0, *secs),
        [m, secs] => (0, m.parse::<i64>().map_err(|_| bad())?, *secs),
        [h, m, secs] => (
            h.parse::<i64>().map_err(|_| bad())?,
            m.parse::<i64>().map_err(|_| bad())?,
            *secs,
        ),
        _ => return Err(bad()),
    };
    let seconds: f64 = seconds.parse().map_err(|_| bad())?;
    if hours < 0 || minutes < 0 || seconds < 0.0 {
        return Err(bad());
    }
    let millis = (seconds * 1000.0).round() as i64;
    Ok(Duration::hours(hours) + Duration::minutes(minutes) + Duration::milliseconds(millis))
}

impl FromStr for TimeSpec {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("now") {
            return Ok(TimeSpec::Now);
        }
        if let Some(caps) = now_re().and_then(|re| re.captures(s)) {
            return Ok(TimeSpec::NowPlus(parse_hms(&caps[1])?));
        }
        if let Some(caps) = sun_re().and_then(|re| re.captures(s)) {
            let event = if caps[1].eq_ignore_ascii_case("sunrise") {
                SunEvent::Rising
            } else {
                SunEvent::Setting
            };
            let offset = match (caps.get(2), caps.get(3)) {
                (Some(sign), Some(amount)) => {
                    let amount = parse_hms(amount.as_str())?;
                    if sign.as_str() == "-" {
                        -amount
                    } else {
                        amount
                    }
                }
                _ => Duration::zero(),
            };
            return Ok(TimeSpec::Sun { event, offset });
        }
        for format in ["%H:%M:%S%.f", "%H:%M"] {
            if let Ok(t) = NaiveTime::parse_from_str(s, format) {
                return Ok(TimeSpec::TimeOfDay(t));
            }
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(TimeSpec::Instant(dt.with_timezone(&Utc)));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(TimeSpec::LocalInstant(dt));
            }
        }
        Err(SchedulerError::Parse(s.to_string()))
    }
}

impl TimeSpec {
    pub fn is_sun(&self) -> bool {
        matches!(self, TimeSpec::Sun { .. })
    }

    /// The absolute instant this spec names, relative to `now`
    ///
    /// A time of day resolves to today's date in `tz`; a sun spec resolves to
    /// the first occurrence whose offset time is still ahead.
    pub fn resolve(
        &self,
        now: DateTime<Utc>,
        tz: Tz,
        sun: &SunCalculator,
    ) -> SchedulerResult<DateTime<Utc>> {
        Ok(match *self {
            TimeSpec::TimeOfDay(t) => {
                let today = now.with_timezone(&tz).date_naive();
                localize(tz, today.and_time(t))
            }
            TimeSpec::Instant(at) => at,
            TimeSpec::LocalInstant(naive) => localize(tz, naive),
            TimeSpec::Sun { event, offset } => resolve_sun(sun, event, offset, now)?,
            TimeSpec::Now => now,
            TimeSpec::NowPlus(delta) => now + delta,
        })
    }
}

/// First `event + offset` strictly after `now`
pub fn resolve_sun(
    sun: &SunCalculator,
    event: SunEvent,
    offset: Duration,
    now: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    Ok(sun.next(event, now - offset)? + offset)
}

/// Interpret a local wall-clock time, skipping forward over DST gaps
pub fn localize(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Next occurrence of a local time of day strictly after `now`
pub fn next_time_of_day(tz: Tz, now: DateTime<Utc>, t: NaiveTime) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let candidate = localize(tz, today.and_time(t));
    if candidate > now {
        candidate
    } else {
        localize(tz, (today + Duration::days(1)).and_time(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar() {
        assert_eq!(
            "07:30:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::TimeOfDay(NaiveTime::from_hms_opt(7, 30, 0).unwrap())
        );
        assert_eq!(
            "07:30:00.5".parse::<TimeSpec>().unwrap(),
            TimeSpec::TimeOfDay(NaiveTime::from_hms_milli_opt(7, 30, 0, 500).unwrap())
        );
        assert_eq!("now".parse::<TimeSpec>().unwrap(), TimeSpec::Now);
        assert_eq!(
            "now + 00:10:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::NowPlus(Duration::minutes(10))
        );
        assert_eq!(
            "sunrise".parse::<TimeSpec>().unwrap(),
            TimeSpec::Sun {
                event: SunEvent::Rising,
                offset: Duration::zero()
            }
        );
        assert_eq!(
            "sunset - 00:30:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::Sun {
                event: SunEvent::Setting,
                offset: Duration::minutes(-30)
            }
        );
        assert_eq!(
            "sunrise + 25:00:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::Sun {
                event: SunEvent::Rising,
                offset: Duration::hours(25)
            }
        );
        assert!(matches!(
            "2024-06-01T08:00:00+02:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::Instant(_)
        ));
        assert!(matches!(
            "2024-06-01 08:00:00".parse::<TimeSpec>().unwrap(),
            TimeSpec::LocalInstant(_)
        ));
        assert!("teatime".parse::<TimeSpec>().is_err());
    }

    #[test]
    fn test_time_of_day_resolves_in_time_zone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let sun = SunCalculator::new(52.52, 13.40, 0.0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 4, 0, 0).unwrap();

        let at = TimeSpec::TimeOfDay(NaiveTime::from_hms_opt(7, 0, 0).unwrap())
            .resolve(now, tz, &sun)
            .unwrap();
        // CEST is UTC+2
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 6, 1, 5, 0, 0).unwrap());
    }

    #[test]
    fn test_next_time_of_day_rolls_over() {
        let tz = chrono_tz::UTC;
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let t = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        assert_eq!(
            next_time_of_day(tz, now, t),
            Utc.with_ymd_and_hms(2024, 6, 2, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_sun_resolution_with_negative_offset() {
        let sun = SunCalculator::new(51.5074, -0.1278, 0.0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let rising = sun.next_rising(now).unwrap();

        let at = resolve_sun(&sun, SunEvent::Rising, Duration::seconds(-60), now).unwrap();
        assert_eq!(at, rising - Duration::seconds(60));

        // Just after the offset time the following day's rising is used
        let later = resolve_sun(
            &sun,
            SunEvent::Rising,
            Duration::seconds(-60),
            rising - Duration::seconds(30),
        )
        .unwrap();
        assert!(later > rising);
    }

    #[test]
    fn test_localize_skips_gap() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // 01:30 on 2024-03-31 does not exist in London
        let naive = chrono::NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(1, 30, 0)
            .unwrap();
        let at = localize(tz, naive);
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap());
    }
}
