use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::Minute;

#[derive(Debug)]
pub enum ScheduleError {
    NotFound(Ulid),
    /// Insert attempted on a blacked-out date.
    Blocked(NaiveDate),
    /// Remote store refused the write for business reasons. Not retried.
    Rejected(String),
    OpenNotBeforeClose {
        open: Minute,
        close: Minute,
    },
    BreakOutsideHours {
        break_start: Minute,
        break_end: Minute,
    },
    NonPositiveStep(Minute),
    ZeroLanes,
    LimitExceeded(&'static str),
    JournalError(String),
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::NotFound(id) => write!(f, "not found: {id}"),
            ScheduleError::Blocked(date) => write!(f, "date is blocked for bookings: {date}"),
            ScheduleError::Rejected(reason) => write!(f, "rejected by remote store: {reason}"),
            ScheduleError::OpenNotBeforeClose { open, close } => {
                write!(f, "opening time {open} must precede closing time {close}")
            }
            ScheduleError::BreakOutsideHours {
                break_start,
                break_end,
            } => {
                write!(
                    f,
                    "break window [{break_start}, {break_end}) must lie strictly inside opening hours"
                )
            }
            ScheduleError::NonPositiveStep(step) => {
                write!(f, "slot granularity must be positive, got {step}")
            }
            ScheduleError::ZeroLanes => write!(f, "lane capacity must be at least 1"),
            ScheduleError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            ScheduleError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}
