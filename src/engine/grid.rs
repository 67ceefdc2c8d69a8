use crate::engine::ScheduleError;
use crate::limits::MAX_LANE_CAPACITY;
use crate::model::{minutes_to_label, BusinessHours, Minute};

// ── Grid Generation ──────────────────────────────────────────────

/// A break needs both bounds; a lone bound is ignored.
fn break_window(hours: &BusinessHours) -> Option<(Minute, Minute)> {
    match (hours.break_start, hours.break_end) {
        (Some(s), Some(e)) => Some((s, e)),
        _ => None,
    }
}

/// Check a configuration before grid generation. Callers must not
/// invoke [`generate`] on a configuration that fails here; the view
/// path substitutes the default grid instead.
pub fn validate(hours: &BusinessHours) -> Result<(), ScheduleError> {
    if hours.open >= hours.close {
        return Err(ScheduleError::OpenNotBeforeClose {
            open: hours.open,
            close: hours.close,
        });
    }
    if let Some((break_start, break_end)) = break_window(hours)
        && (break_start <= hours.open || break_end >= hours.close || break_start >= break_end)
    {
        return Err(ScheduleError::BreakOutsideHours {
            break_start,
            break_end,
        });
    }
    if hours.step_minutes <= 0 {
        return Err(ScheduleError::NonPositiveStep(hours.step_minutes));
    }
    if hours.lane_capacity == 0 {
        return Err(ScheduleError::ZeroLanes);
    }
    if hours.lane_capacity > MAX_LANE_CAPACITY {
        return Err(ScheduleError::LimitExceeded("lane capacity"));
    }
    Ok(())
}

/// Emit bookable start times from open to close (exclusive) in
/// `step_minutes` increments, skipping the break window. Assumes the
/// configuration passed [`validate`].
pub fn generate(hours: &BusinessHours) -> Vec<String> {
    let brk = break_window(hours);
    let mut slots = Vec::new();
    let mut m = hours.open;
    while m < hours.close {
        let in_break = brk.is_some_and(|(start, end)| m >= start && m < end);
        if !in_break {
            slots.push(minutes_to_label(m));
        }
        m += hours.step_minutes;
    }
    slots
}

/// The hard-coded fallback grid used when the stored configuration is
/// invalid. Keeps the booking screen usable.
pub fn default_grid() -> Vec<String> {
    generate(&BusinessHours::default())
}
