use chrono::{Datelike, Days, NaiveDate};

use crate::model::BlackoutConfig;

// ── Blackout Evaluation ──────────────────────────────────────────

/// Weekday index with 0 = Sunday, matching the persisted convention.
pub fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// A date is blocked when its weekday is in the blocked-weekday set or
/// the calendar day itself is in the blocked-date set. Pure function of
/// its arguments.
pub fn is_blocked(date: NaiveDate, config: &BlackoutConfig) -> bool {
    config.weekdays.contains(&weekday_index(date)) || config.dates.contains(&date)
}

/// First non-blocked date at or after `from`, scanning up to a year
/// ahead. `None` means the configuration blocks everything in range.
pub fn next_open_date(from: NaiveDate, config: &BlackoutConfig) -> Option<NaiveDate> {
    (0..=366)
        .filter_map(|offset| from.checked_add_days(Days::new(offset)))
        .find(|d| !is_blocked(*d, config))
}
