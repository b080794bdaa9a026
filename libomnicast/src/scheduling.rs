//! Schedule parsing for operator input
//!
//! Turns what an operator types after `--at` into a UTC timestamp.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

use crate::{OmnicastError, Result};

/// Parse a schedule string relative to the current time
///
/// Supports:
/// - `now`
/// - Relative durations: "90s", "30m", "2h", "1d", "1 hour"
/// - Absolute times: RFC 3339 ("2026-11-20T15:00:00Z"), "2026-11-20 15:00" (UTC),
///   or a unix timestamp in seconds
/// - Natural language: "tomorrow", "next monday 10am"
///
/// # Errors
///
/// Returns `InvalidInput` if the string matches none of the formats.
pub fn parse_schedule(input: &str) -> Result<DateTime<Utc>> {
    parse_schedule_at(input, Utc::now())
}

/// [`parse_schedule`] with an explicit reference time
pub fn parse_schedule_at(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(OmnicastError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Some(dt) = parse_absolute(input) {
        return Ok(dt);
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        OmnicastError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

fn parse_absolute(input: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    // Ten or more digits: seconds since the epoch, not a bare duration
    if input.len() >= 10 && input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse::<i64>().ok().and_then(|secs| DateTime::from_timestamp(secs, 0));
    }
    None
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| OmnicastError::InvalidInput(format!("Could not parse duration: {}", e)))?;
    Duration::from_std(std_duration)
        .map_err(|_| OmnicastError::InvalidInput("Duration out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_relative_durations() {
        let now = reference();
        assert_eq!(parse_schedule_at("30m", now).unwrap(), now + Duration::minutes(30));
        assert_eq!(parse_schedule_at("2h", now).unwrap(), now + Duration::hours(2));
        assert_eq!(parse_schedule_at("1 hour", now).unwrap(), now + Duration::hours(1));
        assert_eq!(parse_schedule_at("1d", now).unwrap(), now + Duration::days(1));
    }

    #[test]
    fn test_now() {
        let now = reference();
        assert_eq!(parse_schedule_at("now", now).unwrap(), now);
        assert_eq!(parse_schedule_at(" NOW ", now).unwrap(), now);
    }

    #[test]
    fn test_absolute_formats() {
        let now = reference();
        let expected = Utc.with_ymd_and_hms(2026, 11, 20, 15, 0, 0).unwrap();

        assert_eq!(parse_schedule_at("2026-11-20T15:00:00Z", now).unwrap(), expected);
        assert_eq!(parse_schedule_at("2026-11-20T16:00:00+01:00", now).unwrap(), expected);
        assert_eq!(parse_schedule_at("2026-11-20 15:00", now).unwrap(), expected);
        assert_eq!(
            parse_schedule_at(&expected.timestamp().to_string(), now).unwrap(),
            expected
        );
    }

    #[test]
    fn test_natural_language() {
        let now = reference();
        let tomorrow = parse_schedule_at("tomorrow", now).unwrap();
        let hours = (tomorrow - now).num_hours();
        assert!((12..=36).contains(&hours), "Expected ~24 hours, got {}", hours);
    }

    #[test]
    fn test_parse_schedule_uses_current_time() {
        let scheduled = parse_schedule("30m").unwrap();
        let minutes = (scheduled - Utc::now()).num_minutes();
        assert!((29..=30).contains(&minutes), "Expected ~30 minutes, got {}", minutes);
    }

    #[test]
    fn test_invalid_input() {
        assert!(parse_schedule("").is_err());
        assert!(parse_schedule("   ").is_err());
        assert!(parse_schedule("not a time").is_err());
    }
}
