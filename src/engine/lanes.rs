use crate::model::{Appointment, Minute, PlacedAppointment};

// ── Lane Packing ─────────────────────────────────────────────────

/// First-fit interval coloring over a fixed number of lanes.
///
/// Appointments are sorted by start minute and each takes the
/// lowest-indexed lane whose previous occupant has ended. When every
/// lane is still occupied the appointment lands on the last lane
/// anyway; the caller renders that as a clipped view. Returns the
/// placements (sorted by start) and the overflow count.
///
/// First-fit is order-stable: an appointment's lane does not change
/// when later-starting appointments are added.
pub fn assign_lanes(
    mut appointments: Vec<Appointment>,
    capacity: usize,
) -> (Vec<PlacedAppointment>, usize) {
    // Capacity below 1 cannot place anything; treat as a single lane.
    let capacity = capacity.max(1);
    appointments.sort_by_key(|a| a.start_minute());

    let mut lane_ends: Vec<Minute> = vec![0; capacity];
    let mut overflows = 0usize;
    let placed = appointments
        .into_iter()
        .map(|appointment| {
            let span = appointment.span();
            let lane = match lane_ends.iter().position(|&end| end <= span.start) {
                Some(lane) => {
                    lane_ends[lane] = span.end;
                    lane
                }
                None => {
                    overflows += 1;
                    capacity - 1
                }
            };
            PlacedAppointment {
                appointment,
                span,
                lane,
            }
        })
        .collect();
    (placed, overflows)
}
