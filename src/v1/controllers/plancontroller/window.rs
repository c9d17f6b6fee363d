//! Parsing and containment checks for `spec.window` (days/start/end/timeZone).
//!
//! The upstream project vendors a bespoke `kured`-derived period-arithmetic
//! library for this. Rather than port that third-party code verbatim, this
//! expresses the same "is `now` inside one of these day/time windows"
//! question directly with `chrono` + `chrono-tz`, which the teacher already
//! depends on for its own schedule evaluation (`triggers::evaluate_schedule`).

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::v1::resources::TimeWindowSpec;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WindowError {
    #[error("spec.window.days contains an unrecognized day: {0:?}")]
    InvalidDay(String),

    #[error("spec.window.startTime is not HH:MM:SS: {0:?}")]
    InvalidStartTime(String),

    #[error("spec.window.endTime is not HH:MM:SS: {0:?}")]
    InvalidEndTime(String),

    #[error("spec.window.timeZone is not a recognized IANA time zone: {0:?}")]
    InvalidTimeZone(String),
}

pub struct ParsedWindow {
    days: Vec<Weekday>,
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl ParsedWindow {
    pub fn parse(spec: &TimeWindowSpec) -> Result<Self, WindowError> {
        let days = spec
            .days
            .iter()
            .map(|d| parse_day(d).ok_or_else(|| WindowError::InvalidDay(d.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let start = NaiveTime::parse_from_str(&spec.start_time, "%H:%M:%S")
            .map_err(|_| WindowError::InvalidStartTime(spec.start_time.clone()))?;
        let end = NaiveTime::parse_from_str(&spec.end_time, "%H:%M:%S")
            .map_err(|_| WindowError::InvalidEndTime(spec.end_time.clone()))?;

        let tz = match &spec.time_zone {
            Some(tz) => tz
                .parse::<Tz>()
                .map_err(|_| WindowError::InvalidTimeZone(tz.clone()))?,
            None => Tz::UTC,
        };

        Ok(Self {
            days,
            start,
            end,
            tz,
        })
    }

    /// Whether `now` falls within one of the configured day/time ranges.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if !self.days.contains(&local.date_naive().weekday()) {
            return false;
        }

        let t = local.time();
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            // window wraps past midnight
            t >= self.start || t <= self.end
        }
    }
}

fn parse_day(token: &str) -> Option<Weekday> {
    match token.to_ascii_lowercase().as_str() {
        "0" | "su" | "sun" | "sunday" => Some(Weekday::Sun),
        "1" | "mo" | "mon" | "monday" => Some(Weekday::Mon),
        "2" | "tu" | "tue" | "tuesday" => Some(Weekday::Tue),
        "3" | "we" | "wed" | "wednesday" => Some(Weekday::Wed),
        "4" | "th" | "thu" | "thursday" => Some(Weekday::Thu),
        "5" | "fr" | "fri" | "friday" => Some(Weekday::Fri),
        "6" | "sa" | "sat" | "saturday" => Some(Weekday::Sat),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window(days: &[&str], start: &str, end: &str) -> TimeWindowSpec {
        TimeWindowSpec {
            days: days.iter().map(|d| d.to_string()).collect(),
            start_time: start.into(),
            end_time: end.into(),
            time_zone: Some("UTC".into()),
        }
    }

    #[test]
    fn test_rejects_unknown_day() {
        let spec = window(&["never"], "02:00:00", "04:00:00");
        assert_eq!(
            ParsedWindow::parse(&spec),
            Err(WindowError::InvalidDay("never".into()))
        );
    }

    #[test]
    fn test_accepts_all_day_spellings() {
        let spec = window(
            &["su", "mo", "tu", "we", "th", "fr", "sa"],
            "02:00:00",
            "04:00:00",
        );
        assert!(ParsedWindow::parse(&spec).is_ok());
    }

    #[test]
    fn test_contains_inside_window() {
        let spec = window(&["mon"], "02:00:00", "04:00:00");
        let parsed = ParsedWindow::parse(&spec).unwrap();

        // 2026-07-27 is a Monday
        let inside = Utc.with_ymd_and_hms(2026, 7, 27, 3, 0, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2026, 7, 27, 5, 0, 0).unwrap();
        let wrong_day = Utc.with_ymd_and_hms(2026, 7, 28, 3, 0, 0).unwrap();

        assert!(parsed.contains(inside));
        assert!(!parsed.contains(outside));
        assert!(!parsed.contains(wrong_day));
    }

    #[test]
    fn test_contains_wraps_past_midnight() {
        let spec = window(&["mon"], "23:00:00", "01:00:00");
        let parsed = ParsedWindow::parse(&spec).unwrap();

        let late_night = Utc.with_ymd_and_hms(2026, 7, 27, 23, 30, 0).unwrap();
        assert!(parsed.contains(late_night));
    }
}
