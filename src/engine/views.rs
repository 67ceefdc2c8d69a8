use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use metrics::counter;
use tracing::warn;
use ulid::Ulid;

use crate::cache::{day_key, month_key};
use crate::limits::{DAY_CACHE_TTL, MONTH_CACHE_TTL};
use crate::model::*;
use crate::observability;

use super::blackout::is_blocked;
use super::grid;
use super::lanes::assign_lanes;
use super::{ScheduleError, Scheduler};

/// Grid and capacity for a stored hours row, falling back to the
/// defaults when the row fails validation. A misconfigured
/// establishment keeps a usable booking screen.
fn grid_and_capacity(establishment_id: Ulid, hours: &BusinessHours) -> (Vec<String>, usize) {
    match grid::validate(hours) {
        Ok(()) => (grid::generate(hours), hours.lane_capacity),
        Err(e) => {
            warn!(
                establishment = %establishment_id,
                error = %e,
                "stored hours are invalid, using default grid"
            );
            let fallback = BusinessHours::default();
            (grid::generate(&fallback), fallback.lane_capacity)
        }
    }
}

fn last_day_of_month(first: NaiveDate) -> NaiveDate {
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
    };
    next.and_then(|d| d.pred_opt()).unwrap_or(first)
}

impl Scheduler {
    /// Cached read of `[from, to]`, one cache entry per key. A remote
    /// fetch that fails serves an empty base with the degraded flag;
    /// pending mutations still overlay it.
    async fn fetch_base(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        staff: Option<Ulid>,
        key: &str,
        ttl: Duration,
    ) -> (Vec<Appointment>, bool) {
        let namespace = self.namespace();
        if let Some(hit) = self.cache.get(&namespace, key) {
            return (hit, false);
        }
        match self
            .remote
            .query_appointments(self.establishment_id, from, to, staff)
            .await
        {
            Ok(rows) => {
                let appointments: Vec<Appointment> =
                    rows.iter().map(Appointment::from_row).collect();
                self.cache
                    .set(&namespace, key, appointments.clone(), ttl);
                (appointments, false)
            }
            Err(e) => {
                warn!(
                    establishment = %self.establishment_id,
                    error = %e,
                    "remote fetch failed, serving degraded view"
                );
                (Vec::new(), true)
            }
        }
    }

    /// Apply this establishment's pending appointment ops over a
    /// fetched base, in queue order.
    async fn overlay_pending(&self, appointments: &mut Vec<Appointment>) {
        for m in self.outbox.pending_for(self.establishment_id).await {
            match &m.op {
                MutationOp::Insert(row) => {
                    let appointment = Appointment::from_row(row);
                    if let Some(existing) =
                        appointments.iter_mut().find(|a| a.id == appointment.id)
                    {
                        *existing = appointment;
                    } else {
                        appointments.push(appointment);
                    }
                }
                MutationOp::Update { id, patch } => {
                    if let Some(existing) = appointments.iter_mut().find(|a| a.id == *id) {
                        patch.apply_to(existing);
                    }
                }
                MutationOp::Delete { id } => appointments.retain(|a| a.id != *id),
                MutationOp::SaveBlackout(_) | MutationOp::SaveHours(_) => {}
            }
        }
    }

    /// Assemble one day's timeline: slot grid, lane-placed
    /// appointments, blackout flag. Never fails; when the remote store
    /// is unreachable the view is whatever is cached and pending,
    /// marked degraded.
    pub async fn day_view(&self, date: NaiveDate, staff: Option<Ulid>) -> DayView {
        let (config, config_degraded) = self.effective_config().await;
        let key = day_key(date, staff);
        let (mut appointments, fetch_degraded) = self
            .fetch_base(date, date, staff, &key, DAY_CACHE_TTL)
            .await;
        self.overlay_pending(&mut appointments).await;
        appointments
            .retain(|a| a.date() == date && staff.is_none_or(|s| a.staff_id == Some(s)));

        let blocked = is_blocked(date, &config.blackout);
        let (grid, capacity) = grid_and_capacity(self.establishment_id, &config.hours);
        let (placed, overflows) = assign_lanes(appointments, capacity);
        if overflows > 0 {
            counter!(observability::LANE_OVERFLOWS).increment(overflows as u64);
            warn!(
                establishment = %self.establishment_id,
                %date,
                overflows,
                "appointments exceed lane capacity"
            );
        }

        DayView {
            date,
            blocked,
            grid,
            appointments: placed,
            degraded: config_degraded || fetch_degraded,
        }
    }

    /// Per-day appointment counts and blackout flags for one calendar
    /// month.
    pub async fn month_view(
        &self,
        year: i32,
        month: u32,
        staff: Option<Ulid>,
    ) -> Result<MonthView, ScheduleError> {
        let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
            return Err(ScheduleError::Rejected(format!(
                "invalid month: {year}-{month:02}"
            )));
        };
        let last = last_day_of_month(first);

        let (config, config_degraded) = self.effective_config().await;
        let key = month_key(year, month, staff);
        let (mut appointments, fetch_degraded) = self
            .fetch_base(first, last, staff, &key, MONTH_CACHE_TTL)
            .await;
        self.overlay_pending(&mut appointments).await;
        appointments.retain(|a| {
            let d = a.date();
            d >= first && d <= last && staff.is_none_or(|s| a.staff_id == Some(s))
        });

        let mut days = Vec::with_capacity(31);
        let mut date = first;
        while date <= last {
            days.push(DaySummary {
                date,
                count: appointments.iter().filter(|a| a.date() == date).count(),
                blocked: is_blocked(date, &config.blackout),
            });
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }

        Ok(MonthView {
            year,
            month,
            days,
            degraded: config_degraded || fetch_degraded,
        })
    }

    /// First grid slot with a free lane on `date`, walking the day's
    /// placed appointments. `None` when the day is blocked or every
    /// slot is at capacity.
    pub async fn suggest_slot(&self, date: NaiveDate, staff: Option<Ulid>) -> Option<String> {
        let view = self.day_view(date, staff).await;
        if view.blocked {
            return None;
        }
        let (config, _) = self.effective_config().await;
        let (_, capacity) = grid_and_capacity(self.establishment_id, &config.hours);

        for label in &view.grid {
            let minute = label_to_minutes(label)?;
            let busy = view
                .appointments
                .iter()
                .filter(|p| p.span.contains_minute(minute))
                .count();
            if busy < capacity {
                return Some(label.clone());
            }
        }
        None
    }
}
