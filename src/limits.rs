use std::time::Duration;

use crate::model::Minute;

/// Max establishments loaded in one process.
pub const MAX_ESTABLISHMENTS: usize = 64;

/// Max pending mutations across all establishments.
pub const MAX_QUEUE_LEN: usize = 10_000;

/// Max cached entries per namespace; the soonest-expiring entry is
/// evicted to admit a new one.
pub const MAX_CACHE_ENTRIES_PER_NAMESPACE: usize = 4_096;

/// Max service line items on a single appointment.
pub const MAX_SERVICES_PER_APPOINTMENT: usize = 32;

/// Max length for client/service name strings.
pub const MAX_NAME_LEN: usize = 256;

/// Max parallel lanes a view will render.
pub const MAX_LANE_CAPACITY: usize = 16;

/// Floor applied when an appointment's stored end time yields a
/// non-positive duration (data-quality defect, not a scheduling failure).
pub const MIN_APPOINTMENT_MINUTES: Minute = 5;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// TTL for cached single-day reads.
pub const DAY_CACHE_TTL: Duration = Duration::from_secs(60);

/// TTL for cached month summaries.
pub const MONTH_CACHE_TTL: Duration = Duration::from_secs(300);

/// How often the replayer attempts to drain the outbox.
pub const REPLAY_PERIOD: Duration = Duration::from_secs(5);

/// How often the janitor sweeps expired cache entries and considers
/// journal compaction.
pub const JANITOR_PERIOD: Duration = Duration::from_secs(30);

/// Journal appends before the janitor rewrites it from the live queue.
pub const JOURNAL_COMPACT_THRESHOLD: u64 = 1024;
