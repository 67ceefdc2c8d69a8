use super::*;

use std::path::PathBuf;

use chrono::NaiveDate;

use crate::establishment::EstablishmentManager;
use crate::limits::{MAX_NAME_LEN, MAX_SERVICES_PER_APPOINTMENT};
use crate::remote::InMemoryRemote;
use crate::replayer;

fn test_data_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("agenda_test_engine").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A manager over a fresh journal dir plus one scheduler on it.
fn setup(
    name: &str,
) -> (
    Arc<InMemoryRemote>,
    Arc<EstablishmentManager>,
    Arc<Scheduler>,
    Ulid,
) {
    let remote = Arc::new(InMemoryRemote::new());
    let manager = EstablishmentManager::open(&test_data_dir(name), remote.clone()).unwrap();
    let est = Ulid::new();
    let scheduler = manager.get_or_create(est).unwrap();
    (remote, manager, scheduler, est)
}

fn service(name: &str) -> ServiceItem {
    ServiceItem { name: name.into() }
}

fn row(est: Ulid, starts_at: &str, end_time: &str) -> AppointmentRow {
    AppointmentRow {
        id: Ulid::new(),
        establishment_id: est,
        staff_id: None,
        client_id: None,
        client_name: Some("Paula".into()),
        starts_at: starts_at.into(),
        end_time: end_time.into(),
        status: AppointmentStatus::Scheduled,
        services: vec![service("corte")],
    }
}

/// Friday 2024-03-08. Weekday index 5 under the Sunday-zero convention.
fn friday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
}

/// Sunday 2024-03-10.
fn sunday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
}

// ══════════════════════════════════════════════════════════════
// Day view assembly
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn day_view_places_remote_rows_on_default_grid() {
    let (remote, _manager, scheduler, est) = setup("day_default_grid");
    remote.seed_appointment(row(est, "2024-03-08T09:00:00", "09:30"));
    remote.seed_appointment(row(est, "2024-03-08T09:15:00", "09:45"));
    remote.seed_appointment(row(est, "2024-03-09T10:00:00", "10:30")); // next day

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 20); // 08:00..17:30 every 30 minutes
    assert_eq!(view.grid[0], "08:00");
    assert_eq!(view.grid[19], "17:30");
    assert_eq!(view.appointments.len(), 2);
    // 09:00 and 09:15 overlap, so the later one takes the next lane
    assert_eq!(view.appointments[0].lane, 0);
    assert_eq!(view.appointments[1].lane, 1);
    assert!(!view.blocked);
    assert!(!view.degraded);
}

#[tokio::test]
async fn day_view_filters_by_staff() {
    let (remote, _manager, scheduler, est) = setup("day_staff_filter");
    let ana = Ulid::new();
    let mut assigned = row(est, "2024-03-08T10:00:00", "10:30");
    assigned.staff_id = Some(ana);
    remote.seed_appointment(assigned.clone());
    remote.seed_appointment(row(est, "2024-03-08T11:00:00", "11:30")); // unassigned

    let hers = scheduler.day_view(friday(), Some(ana)).await;
    assert_eq!(hers.appointments.len(), 1);
    assert_eq!(hers.appointments[0].appointment.id, assigned.id);

    let everyone = scheduler.day_view(friday(), None).await;
    assert_eq!(everyone.appointments.len(), 2);
}

#[tokio::test]
async fn day_view_serves_cached_base_within_ttl() {
    let (remote, _manager, scheduler, est) = setup("day_cache");
    remote.seed_appointment(row(est, "2024-03-08T10:00:00", "10:30"));

    let first = scheduler.day_view(friday(), None).await;
    assert_eq!(first.appointments.len(), 1);
    assert_eq!(remote.query_calls(), 1);

    let second = scheduler.day_view(friday(), None).await;
    assert_eq!(second.appointments.len(), 1);
    assert_eq!(remote.query_calls(), 1); // cache hit, no second fetch
}

#[tokio::test]
async fn day_view_offline_with_cold_cache_degrades() {
    let (remote, _manager, scheduler, _est) = setup("day_degraded");
    remote.set_online(false);

    let view = scheduler.day_view(friday(), None).await;
    assert!(view.degraded);
    assert!(view.appointments.is_empty());
    assert_eq!(view.grid.len(), 20); // default hours still produce a grid
    assert!(!view.blocked);
}

#[tokio::test]
async fn day_view_renders_past_midnight_span() {
    let (remote, _manager, scheduler, est) = setup("day_midnight");
    remote.seed_appointment(row(est, "2024-03-08T23:45:00", "00:30"));

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.appointments.len(), 1);
    // 23:45 = minute 1425; the 00:30 end rolls past midnight to 1470
    assert_eq!(view.appointments[0].span, MinuteSpan::new(1425, 1470));
    assert_eq!(view.appointments[0].span.duration_minutes(), 45);
}

#[tokio::test]
async fn day_view_marks_blackout_date_blocked() {
    let (remote, _manager, scheduler, est) = setup("day_blocked");
    remote.seed_appointment(row(est, "2024-03-10T10:00:00", "10:30"));
    let mut blackout = BlackoutConfig::default();
    blackout.weekdays.insert(0); // Sundays
    scheduler.save_blackout(blackout).await.unwrap();

    let view = scheduler.day_view(sunday(), None).await;
    assert!(view.blocked);
    // Existing bookings on a blocked date still render
    assert_eq!(view.appointments.len(), 1);
}

#[tokio::test]
async fn invalid_stored_hours_fall_back_to_default_grid() {
    let (remote, _manager, scheduler, est) = setup("day_bad_hours");
    // The backend does not validate settings rows; closing before
    // opening must not take the day view down.
    let bad = BusinessHours {
        open: 18 * 60,
        close: 8 * 60,
        ..BusinessHours::default()
    };
    remote.save_hours(est, &bad).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 20);
    assert_eq!(view.grid[0], "08:00");
    assert!(!view.degraded);
}

// ══════════════════════════════════════════════════════════════
// Month view
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn month_view_counts_per_day() {
    let (remote, _manager, scheduler, est) = setup("month_counts");
    remote.seed_appointment(row(est, "2024-03-08T09:00:00", "09:30"));
    remote.seed_appointment(row(est, "2024-03-08T16:00:00", "16:30"));
    remote.seed_appointment(row(est, "2024-03-15T11:00:00", "11:30"));
    let mut blackout = BlackoutConfig::default();
    blackout.weekdays.insert(0);
    scheduler.save_blackout(blackout).await.unwrap();

    let view = scheduler.month_view(2024, 3, None).await.unwrap();
    assert_eq!(view.days.len(), 31);
    assert_eq!(view.days[7].count, 2); // 2024-03-08
    assert_eq!(view.days[14].count, 1); // 2024-03-15
    assert_eq!(view.days[13].count, 0);
    assert!(view.days[2].blocked); // 2024-03-03 is a Sunday
    assert!(view.days[9].blocked); // 2024-03-10
    assert!(!view.days[7].blocked);
    assert!(!view.degraded);
}

#[tokio::test]
async fn month_view_rejects_invalid_month() {
    let (_remote, _manager, scheduler, _est) = setup("month_invalid");
    let result = scheduler.month_view(2024, 13, None).await;
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));
}

#[tokio::test]
async fn pending_insert_counted_in_month_view() {
    let (remote, _manager, scheduler, est) = setup("month_pending");
    remote.set_online(false);
    scheduler
        .insert_appointment(row(est, "2024-03-20T10:00:00", "10:30"))
        .await
        .unwrap();

    let view = scheduler.month_view(2024, 3, None).await.unwrap();
    assert!(view.degraded);
    assert_eq!(view.days[19].count, 1); // 2024-03-20
}

// ══════════════════════════════════════════════════════════════
// Slot suggestion
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_free_slot_on_an_empty_day() {
    let (_remote, _manager, scheduler, _est) = setup("suggest_empty");
    let slot = scheduler.suggest_slot(friday(), None).await;
    assert_eq!(slot.as_deref(), Some("08:00"));
}

#[tokio::test]
async fn suggest_slot_skips_filled_slots() {
    let (remote, _manager, scheduler, est) = setup("suggest_filled");
    let hours = BusinessHours {
        lane_capacity: 1,
        ..BusinessHours::default()
    };
    scheduler.save_hours(hours).await.unwrap();
    remote.seed_appointment(row(est, "2024-03-08T08:00:00", "08:30"));

    let slot = scheduler.suggest_slot(friday(), None).await;
    assert_eq!(slot.as_deref(), Some("08:30"));
}

#[tokio::test]
async fn suggest_slot_declines_blocked_date() {
    let (_remote, _manager, scheduler, _est) = setup("suggest_blocked");
    let mut blackout = BlackoutConfig::default();
    blackout.dates.insert(friday());
    scheduler.save_blackout(blackout).await.unwrap();

    assert_eq!(scheduler.suggest_slot(friday(), None).await, None);
}

// ══════════════════════════════════════════════════════════════
// Mutation validation
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn insert_refuses_foreign_establishment() {
    let (_remote, _manager, scheduler, _est) = setup("foreign_est");
    let other = Ulid::new();
    let result = scheduler
        .insert_appointment(row(other, "2024-03-08T10:00:00", "10:30"))
        .await;
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));
    assert!(scheduler.pending().await.is_empty());
}

#[tokio::test]
async fn insert_refuses_oversized_service_list() {
    let (_remote, _manager, scheduler, est) = setup("service_limit");
    let mut oversized = row(est, "2024-03-08T10:00:00", "10:30");
    oversized.services = (0..=MAX_SERVICES_PER_APPOINTMENT)
        .map(|i| service(&format!("servico {i}")))
        .collect();
    let result = scheduler.insert_appointment(oversized).await;
    assert!(matches!(result, Err(ScheduleError::LimitExceeded(_))));
}

#[tokio::test]
async fn insert_refuses_oversized_client_name() {
    let (_remote, _manager, scheduler, est) = setup("name_limit");
    let mut named = row(est, "2024-03-08T10:00:00", "10:30");
    named.client_name = Some("x".repeat(MAX_NAME_LEN + 1));
    let result = scheduler.insert_appointment(named).await;
    assert!(matches!(result, Err(ScheduleError::LimitExceeded(_))));
}

#[tokio::test]
async fn insert_refused_on_blocked_weekday() {
    let (_remote, _manager, scheduler, est) = setup("blocked_weekday");
    let mut blackout = BlackoutConfig::default();
    blackout.weekdays.insert(0);
    scheduler.save_blackout(blackout).await.unwrap();

    let result = scheduler
        .insert_appointment(row(est, "2024-03-10T10:00:00", "10:30"))
        .await;
    assert!(matches!(result, Err(ScheduleError::Blocked(_))));
    assert!(scheduler.pending().await.is_empty());
}

#[tokio::test]
async fn save_hours_refuses_inverted_hours() {
    let (_remote, _manager, scheduler, _est) = setup("inverted_hours");
    let bad = BusinessHours {
        open: 18 * 60,
        close: 8 * 60,
        ..BusinessHours::default()
    };
    let result = scheduler.save_hours(bad).await;
    assert!(matches!(
        result,
        Err(ScheduleError::OpenNotBeforeClose { .. })
    ));
    assert!(scheduler.pending().await.is_empty());
}

#[tokio::test]
async fn save_blackout_refuses_weekday_out_of_range() {
    let (_remote, _manager, scheduler, _est) = setup("weekday_range");
    let mut blackout = BlackoutConfig::default();
    blackout.weekdays.insert(7);
    let result = scheduler.save_blackout(blackout).await;
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));
}

// ══════════════════════════════════════════════════════════════
// Offline mutation lifecycle
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn offline_insert_is_visible_optimistically() {
    let (remote, _manager, scheduler, est) = setup("offline_insert");
    remote.set_online(false);

    let id = scheduler
        .insert_appointment(row(est, "2024-03-08T10:00:00", "10:30"))
        .await
        .unwrap();
    assert_eq!(scheduler.pending().await.len(), 1);
    assert_eq!(remote.appointment_count(), 0);

    let view = scheduler.day_view(friday(), None).await;
    assert!(view.degraded);
    assert_eq!(view.appointments.len(), 1);
    assert_eq!(view.appointments[0].appointment.id, id);
}

#[tokio::test]
async fn offline_update_overlays_cached_base() {
    let (remote, _manager, scheduler, est) = setup("offline_update");
    let seeded = row(est, "2024-03-08T10:00:00", "10:30");
    remote.seed_appointment(seeded.clone());

    // Warm the config and base caches while online
    let warm = scheduler.day_view(friday(), None).await;
    assert_eq!(warm.appointments[0].appointment.end_time, "10:30");

    remote.set_online(false);
    let patch = AppointmentPatch {
        end_time: Some("11:15".into()),
        ..AppointmentPatch::default()
    };
    scheduler.update_appointment(seeded.id, patch).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert!(!view.degraded); // everything came from local caches and the queue
    assert_eq!(view.appointments[0].appointment.end_time, "11:15");
    assert_eq!(remote.query_calls(), 1);
}

#[tokio::test]
async fn offline_delete_hides_row() {
    let (remote, _manager, scheduler, est) = setup("offline_delete");
    let seeded = row(est, "2024-03-08T10:00:00", "10:30");
    remote.seed_appointment(seeded.clone());
    scheduler.day_view(friday(), None).await;

    remote.set_online(false);
    scheduler.delete_appointment(seeded.id).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert!(view.appointments.is_empty());
    assert_eq!(remote.appointment_count(), 1); // remote copy stays until replay
}

#[tokio::test]
async fn update_then_delete_collapse_to_single_delete() {
    let (remote, manager, scheduler, est) = setup("collapse_delete");
    let seeded = row(est, "2024-03-08T10:00:00", "10:30");
    remote.seed_appointment(seeded.clone());
    remote.set_online(false);

    let patch = AppointmentPatch {
        end_time: Some("11:00".into()),
        ..AppointmentPatch::default()
    };
    scheduler.update_appointment(seeded.id, patch).await.unwrap();
    scheduler.delete_appointment(seeded.id).await.unwrap();

    // The queued update is superseded; only the delete remains
    let pending = scheduler.pending().await;
    assert_eq!(pending.len(), 1);
    assert!(matches!(pending[0].op, MutationOp::Delete { .. }));

    remote.set_online(true);
    let updates_before = remote.update_calls();
    let deletes_before = remote.delete_calls();
    let sent = replayer::replay_round(&manager).await;
    assert_eq!(sent, 1);
    assert_eq!(remote.update_calls(), updates_before); // update never replayed
    assert_eq!(remote.delete_calls(), deletes_before + 1);
    assert_eq!(remote.appointment(seeded.id), None);
    assert!(scheduler.pending().await.is_empty());
}

#[tokio::test]
async fn insert_then_delete_never_reach_remote() {
    let (remote, manager, scheduler, est) = setup("annihilate");
    remote.set_online(false);

    let id = scheduler
        .insert_appointment(row(est, "2024-03-08T10:00:00", "10:30"))
        .await
        .unwrap();
    scheduler.delete_appointment(id).await.unwrap();
    assert!(scheduler.pending().await.is_empty());

    remote.set_online(true);
    assert_eq!(replayer::replay_round(&manager).await, 0);
    assert_eq!(remote.delete_calls(), 0);
    assert_eq!(remote.appointment_count(), 0);
}

#[tokio::test]
async fn optimistic_view_survives_restart() {
    let dir = test_data_dir("view_restart");
    let est = Ulid::new();
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_online(false);

    let id;
    {
        let manager = EstablishmentManager::open(&dir, remote.clone()).unwrap();
        let scheduler = manager.get_or_create(est).unwrap();
        id = scheduler
            .insert_appointment(row(est, "2024-03-08T10:00:00", "10:30"))
            .await
            .unwrap();
    }

    let manager = EstablishmentManager::open(&dir, remote.clone()).unwrap();
    let scheduler = manager.get_or_create(est).unwrap();
    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.appointments.len(), 1);
    assert_eq!(view.appointments[0].appointment.id, id);
}

#[tokio::test]
async fn rejected_insert_surfaces_error_and_event() {
    let (remote, _manager, scheduler, est) = setup("rejected_insert");
    remote.set_rejecting(true);
    let mut events = scheduler.subscribe();

    let result = scheduler
        .insert_appointment(row(est, "2024-03-08T10:00:00", "10:30"))
        .await;
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));
    assert!(scheduler.pending().await.is_empty());

    // Optimistic upsert first, then the rejection notice
    let first = events.recv().await.unwrap();
    assert!(matches!(first, ChangeEvent::Upserted(_)));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, ChangeEvent::MutationRejected { .. }));
}

#[tokio::test]
async fn confirmed_insert_clears_cached_reads() {
    let (remote, _manager, scheduler, est) = setup("confirm_clears");
    remote.seed_appointment(row(est, "2024-03-08T09:00:00", "09:30"));
    assert_eq!(scheduler.day_view(friday(), None).await.appointments.len(), 1);
    assert_eq!(remote.query_calls(), 1);

    scheduler
        .insert_appointment(row(est, "2024-03-08T10:00:00", "10:30"))
        .await
        .unwrap();
    assert!(scheduler.pending().await.is_empty()); // confirmed in the foreground

    // Confirmation dropped the cached read, so the next view refetches
    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(remote.query_calls(), 2);
    assert_eq!(view.appointments.len(), 2);
}

// ══════════════════════════════════════════════════════════════
// Config round trips
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn saved_hours_reshape_the_grid() {
    let (_remote, _manager, scheduler, _est) = setup("hours_grid");
    let hours = BusinessHours {
        open: 9 * 60,
        close: 19 * 60,
        step_minutes: 60,
        ..BusinessHours::default()
    };
    scheduler.save_hours(hours).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 10); // 09:00..18:00 hourly
    assert_eq!(view.grid[0], "09:00");
    assert_eq!(view.grid[9], "18:00");
}

#[tokio::test]
async fn pending_hours_apply_before_confirmation() {
    let (remote, _manager, scheduler, _est) = setup("pending_hours");
    scheduler.day_view(friday(), None).await; // warm the caches while online

    remote.set_online(false);
    let hours = BusinessHours {
        step_minutes: 60,
        ..BusinessHours::default()
    };
    scheduler.save_hours(hours).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 10); // 08:00..17:00 hourly, straight from the queue
    assert!(!view.degraded);
}

#[tokio::test]
async fn rejected_hours_save_reverts_to_remote_config() {
    let (remote, _manager, scheduler, _est) = setup("rejected_hours");
    remote.set_rejecting(true);
    let hours = BusinessHours {
        step_minutes: 60,
        ..BusinessHours::default()
    };
    let result = scheduler.save_hours(hours).await;
    assert!(matches!(result, Err(ScheduleError::Rejected(_))));

    remote.set_rejecting(false);
    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 20); // back on the stored 30-minute grid
    assert!(scheduler.pending().await.is_empty());
}

// ══════════════════════════════════════════════════════════════
// Integration vertical: barbershop Friday
// ══════════════════════════════════════════════════════════════

#[tokio::test]
async fn barbershop_friday_with_an_offline_window() {
    let (remote, manager, scheduler, est) = setup("barbershop");

    // Morning setup: 09:00-19:00, half-hour slots, two chairs, closed
    // on Sundays.
    let hours = BusinessHours {
        open: 9 * 60,
        close: 19 * 60,
        step_minutes: 30,
        lane_capacity: 2,
        ..BusinessHours::default()
    };
    scheduler.save_hours(hours).await.unwrap();
    let mut blackout = BlackoutConfig::default();
    blackout.weekdays.insert(0);
    scheduler.save_blackout(blackout).await.unwrap();

    // First booking goes straight through
    let paula = row(est, "2024-03-08T10:00:00", "10:30");
    let paula_id = scheduler.insert_appointment(paula).await.unwrap();
    assert_eq!(remote.appointment_count(), 1);

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.grid.len(), 20); // (19:00 - 09:00) / 30 minutes
    assert_eq!(view.appointments.len(), 1);
    let queries_warm = remote.query_calls();

    // Connection drops over lunch
    remote.set_online(false);

    // Walk-in while offline, overlapping Paula, takes the second chair
    let mut bruno = row(est, "2024-03-08T10:15:00", "10:45");
    bruno.client_name = Some("Bruno".into());
    let bruno_id = scheduler.insert_appointment(bruno).await.unwrap();

    let view = scheduler.day_view(friday(), None).await;
    assert!(!view.degraded); // cached base plus the queue, nothing missing
    assert_eq!(view.appointments.len(), 2);
    assert_eq!(view.appointments[0].appointment.id, paula_id);
    assert_eq!(view.appointments[0].lane, 0);
    assert_eq!(view.appointments[1].appointment.id, bruno_id);
    assert_eq!(view.appointments[1].lane, 1); // 10:15 overlaps [600, 630)
    assert_eq!(remote.query_calls(), queries_warm);

    // Bruno asks for more time; the change folds into his queued insert
    let patch = AppointmentPatch {
        end_time: Some("11:00".into()),
        ..AppointmentPatch::default()
    };
    scheduler.update_appointment(bruno_id, patch).await.unwrap();
    assert_eq!(scheduler.pending().await.len(), 1);
    assert_eq!(remote.update_calls(), 0);

    let view = scheduler.day_view(friday(), None).await;
    assert_eq!(view.appointments[1].appointment.end_time, "11:00");

    // Sunday request is refused even while offline
    let refused = scheduler
        .insert_appointment(row(est, "2024-03-10T10:00:00", "10:30"))
        .await;
    assert!(matches!(refused, Err(ScheduleError::Blocked(_))));

    // Connection returns; replay flushes the one merged insert
    remote.set_online(true);
    let sent = replayer::replay_round(&manager).await;
    assert_eq!(sent, 1);
    assert!(scheduler.pending().await.is_empty());
    assert_eq!(remote.appointment_count(), 2);
    let stored = remote.appointment(bruno_id).unwrap();
    assert_eq!(stored.end_time, "11:00");

    // Fresh view after the flush: remote and local agree
    let view = scheduler.day_view(friday(), None).await;
    assert!(!view.degraded);
    assert_eq!(view.appointments.len(), 2);
}
