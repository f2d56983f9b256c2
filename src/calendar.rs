//! CF-convention time decoding, down to calendar years.
//!
//! A time coordinate carries `units` such as `days since 1850-01-01` and an
//! optional `calendar` attribute. Only the year of each value is needed by the
//! validator, so sub-daily precision beyond the origin's time of day is not
//! tracked for the idealised calendars.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

#[derive(Error, Debug, PartialEq)]
pub enum CalendarError {
    #[error("Unsupported time units '{0}'")]
    UnsupportedUnits(String),

    #[error("Unsupported calendar '{0}'")]
    UnsupportedCalendar(String),

    #[error("Cannot parse reference date '{0}'")]
    BadOrigin(String),
}

impl Classify for CalendarError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    /// `standard`, `gregorian`, `proleptic_gregorian`; `julian` is folded in
    /// since the drift never moves a value across more than a few days.
    Gregorian,
    NoLeap,
    AllLeap,
    Day360,
}

impl Calendar {
    pub fn from_attribute(name: Option<&str>) -> Result<Self, CalendarError> {
        let Some(name) = name else {
            return Ok(Calendar::Gregorian);
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "standard" | "gregorian" | "proleptic_gregorian" | "julian" => Ok(Calendar::Gregorian),
            "noleap" | "365_day" => Ok(Calendar::NoLeap),
            "all_leap" | "366_day" => Ok(Calendar::AllLeap),
            "360_day" => Ok(Calendar::Day360),
            other => Err(CalendarError::UnsupportedCalendar(other.to_string())),
        }
    }

    fn days_per_year(self) -> Option<f64> {
        match self {
            Calendar::Gregorian => None,
            Calendar::NoLeap => Some(365.0),
            Calendar::AllLeap => Some(366.0),
            Calendar::Day360 => Some(360.0),
        }
    }

    /// Zero-based day of year for a month/day in this calendar.
    fn day_of_year(self, month: u32, day: u32) -> f64 {
        const NOLEAP: [u32; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
        let m = (month.clamp(1, 12) - 1) as usize;
        let before = match self {
            Calendar::Day360 => m as u32 * 30,
            Calendar::AllLeap => NOLEAP[m] + u32::from(m >= 2),
            _ => NOLEAP[m],
        };
        f64::from(before + day.max(1) - 1)
    }
}

/// A decoded `units` + `calendar` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAxis {
    seconds_per_unit: f64,
    origin: NaiveDateTime,
    calendar: Calendar,
}

impl TimeAxis {
    pub fn parse(units: &str, calendar: Option<&str>) -> Result<Self, CalendarError> {
        let calendar = Calendar::from_attribute(calendar)?;
        let unsupported = || CalendarError::UnsupportedUnits(units.to_string());

        let lower = units.trim().to_ascii_lowercase();
        let (unit, origin) = lower.split_once(" since ").ok_or_else(unsupported)?;
        let seconds_per_unit = match unit.trim() {
            "days" | "day" | "d" => 86_400.0,
            "hours" | "hour" | "hrs" | "hr" | "h" => 3_600.0,
            "minutes" | "minute" | "mins" | "min" => 60.0,
            "seconds" | "second" | "secs" | "sec" | "s" => 1.0,
            _ => return Err(unsupported()),
        };

        Ok(Self {
            seconds_per_unit,
            origin: parse_origin(origin.trim())?,
            calendar,
        })
    }

    pub fn calendar(&self) -> Calendar {
        self.calendar
    }

    /// Calendar year of one encoded time value.
    pub fn year_of(&self, value: f64) -> Option<i32> {
        if !value.is_finite() {
            return None;
        }
        let seconds = value * self.seconds_per_unit;
        match self.calendar.days_per_year() {
            None => {
                let millis = (seconds * 1000.0).round();
                if millis.abs() > i64::MAX as f64 {
                    return None;
                }
                let offset = Duration::try_milliseconds(millis as i64)?;
                self.origin.checked_add_signed(offset).map(|t| t.year())
            }
            Some(days_per_year) => {
                let origin_day = self.calendar.day_of_year(self.origin.month(), self.origin.day())
                    + f64::from(self.origin.num_seconds_from_midnight()) / 86_400.0;
                let elapsed_days = origin_day + seconds / 86_400.0;
                let years = (elapsed_days / days_per_year).floor();
                let year = f64::from(self.origin.year()) + years;
                (year.abs() < f64::from(i32::MAX)).then_some(year as i32)
            }
        }
    }

    /// (min, max) years over all finite values.
    pub fn year_range(&self, values: &[f64]) -> Option<(i32, i32)> {
        values
            .iter()
            .filter_map(|v| self.year_of(*v))
            .fold(None, |acc, y| match acc {
                None => Some((y, y)),
                Some((lo, hi)) => Some((lo.min(y), hi.max(y))),
            })
    }
}

/// Parses `YYYY-M-D[( |T)h:m:s[.frac]][ tz]`.
fn parse_origin(text: &str) -> Result<NaiveDateTime, CalendarError> {
    let bad = || CalendarError::BadOrigin(text.to_string());

    let text = text.trim_end_matches(['z', 'Z']);
    let mut parts = text.splitn(2, [' ', 't']);
    let date_part = parts.next().ok_or_else(bad)?;
    let time_part = parts.next().map(str::trim).unwrap_or("");

    let mut ymd = date_part.splitn(3, '-');
    let year: i32 = ymd.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let month: u32 = ymd.next().map_or(Some(1), |s| s.parse().ok()).ok_or_else(bad)?;
    let day: u32 = ymd.next().map_or(Some(1), |s| s.parse().ok()).ok_or_else(bad)?;

    // 360-day origins like 1850-02-30 are not valid Gregorian dates; clamp for storage
    let date = NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .ok_or_else(bad)?;

    let clock = time_part.split_whitespace().next().unwrap_or("");
    let time = if clock.is_empty() {
        NaiveTime::MIN
    } else {
        let mut hms = clock.splitn(3, ':');
        let h: u32 = hms.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let m: u32 = hms.next().map_or(Some(0), |s| s.parse().ok()).ok_or_else(bad)?;
        let s: f64 = hms.next().map_or(Some(0.0), |s| s.parse().ok()).ok_or_else(bad)?;
        NaiveTime::from_hms_opt(h, m, s.floor() as u32).ok_or_else(bad)?
    };
    Ok(NaiveDateTime::new(date, time))
}
