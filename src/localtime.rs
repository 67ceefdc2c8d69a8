//! Timestamp normalization. Every stored start-time literal passes
//! through here exactly once; downstream code only ever sees the
//! resulting [`NaiveDateTime`].
//!
//! The rule: a zone-naive literal means what it says on the wall clock.
//! `2024-03-08T10:30:00` is half past ten at the establishment, full
//! stop. Routing such a literal through a UTC interpretation and back
//! shifts every appointment by the device offset, so the naive path
//! reads the digit fields directly. Literals that do carry an offset or
//! `Z` marker are converted through the device-local zone, which is
//! assumed to match the establishment's.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use tracing::warn;

use crate::observability;

/// Normalize a stored timestamp literal to local wall-clock time.
///
/// Never fails: a literal that cannot be parsed yields the current
/// instant, logged, so one corrupt record degrades one row instead of
/// blanking the whole day.
pub fn parse_local(raw: &str) -> NaiveDateTime {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return dt.with_timezone(&Local).naive_local();
    }
    match parse_naive_literal(raw) {
        Some(dt) => dt,
        None => {
            warn!(raw = %raw, "unparseable timestamp literal, substituting current time");
            metrics::counter!(observability::PARSE_FALLBACKS).increment(1);
            Local::now().naive_local()
        }
    }
}

/// Field-by-field parse of `YYYY-MM-DD[T| ]HH[:MM[:SS[.frac]]]`.
/// Missing minute and second default to zero; any malformed field is a
/// parse failure, not a guess.
fn parse_naive_literal(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    let (date_part, time_part) = raw.split_once(['T', ' '])?;

    let mut date_fields = date_part.split('-');
    let year: i32 = date_fields.next()?.parse().ok()?;
    let month: u32 = date_fields.next()?.parse().ok()?;
    let day: u32 = date_fields.next()?.parse().ok()?;
    if date_fields.next().is_some() {
        return None;
    }

    let mut time_fields = time_part.split(':');
    let hour: u32 = time_fields.next()?.trim().parse().ok()?;
    let minute: u32 = match time_fields.next() {
        None => 0,
        Some(m) => m.parse().ok()?,
    };
    let second: u32 = match time_fields.next() {
        None => 0,
        // Fractional seconds are stored by some writers; truncate them.
        Some(s) => s.split('.').next()?.parse().ok()?,
    };

    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn naive_literal_is_taken_at_face_value() {
        let dt = parse_local("2024-03-08T10:30:00");
        assert_eq!(dt.date(), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(dt.time().hour(), 10);
        assert_eq!(dt.time().minute(), 30);
        assert_eq!(dt.time().second(), 0);
    }

    #[test]
    fn space_separator_accepted() {
        let dt = parse_local("2024-03-08 07:15:00");
        assert_eq!(dt.time().hour(), 7);
        assert_eq!(dt.time().minute(), 15);
    }

    #[test]
    fn missing_minute_and_second_default_to_zero() {
        let dt = parse_local("2024-03-08T10");
        assert_eq!(dt.time().hour(), 10);
        assert_eq!(dt.time().minute(), 0);
        assert_eq!(dt.time().second(), 0);

        let dt = parse_local("2024-03-08T10:45");
        assert_eq!(dt.time().minute(), 45);
        assert_eq!(dt.time().second(), 0);
    }

    #[test]
    fn fractional_seconds_truncated() {
        let dt = parse_local("2024-03-08T10:30:59.999");
        assert_eq!(dt.time().second(), 59);
    }

    #[test]
    fn offset_aware_literal_goes_through_zone_conversion() {
        let raw = "2024-03-08T10:30:00Z";
        let expected = DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(parse_local(raw), expected);
    }

    #[test]
    fn garbage_falls_back_to_now() {
        let before = Local::now().naive_local();
        let dt = parse_local("not a timestamp");
        let after = Local::now().naive_local();
        assert!(dt >= before - chrono::Duration::seconds(1));
        assert!(dt <= after + chrono::Duration::seconds(1));
    }

    #[test]
    fn out_of_range_fields_fall_back() {
        assert!(parse_naive_literal("2024-13-08T10:00:00").is_none());
        assert!(parse_naive_literal("2024-03-40T10:00:00").is_none());
        assert!(parse_naive_literal("2024-03-08T25:00:00").is_none());
        assert!(parse_naive_literal("2024-03-08T10:61:00").is_none());
    }

    #[test]
    fn malformed_numbers_fall_back() {
        assert!(parse_naive_literal("2024-03-xxT10:00:00").is_none());
        assert!(parse_naive_literal("2024-03-08Tten:00:00").is_none());
        assert!(parse_naive_literal("2024-03-08").is_none()); // no time part
    }
}
