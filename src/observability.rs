use std::net::SocketAddr;

use crate::model::MutationOp;

// ── View-path metrics (request-driven) ──────────────────────────

/// Counter: day/month view cache hits.
pub const CACHE_HITS: &str = "agenda_cache_hits_total";

/// Counter: day/month view cache misses.
pub const CACHE_MISSES: &str = "agenda_cache_misses_total";

/// Counter: timestamp literals that fell back to the current time.
pub const PARSE_FALLBACKS: &str = "agenda_parse_fallbacks_total";

/// Counter: appointments placed past the configured lane capacity.
pub const LANE_OVERFLOWS: &str = "agenda_lane_overflows_total";

/// Counter: mutations accepted and applied to the local view.
pub const MUTATIONS_APPLIED: &str = "agenda_mutations_applied_total";

/// Counter: mutations rejected by the remote store.
pub const MUTATIONS_REJECTED: &str = "agenda_mutations_rejected_total";

// ── Queue and background metrics (resource-driven) ──────────────

/// Counter: entries appended to the mutation queue.
pub const MUTATIONS_QUEUED: &str = "agenda_mutations_queued_total";

/// Counter: queued mutations acknowledged by the remote store.
pub const MUTATIONS_CONFIRMED: &str = "agenda_mutations_confirmed_total";

/// Gauge: mutations currently pending in the queue.
pub const QUEUE_DEPTH: &str = "agenda_queue_depth";

/// Gauge: establishments with a loaded engine.
pub const ESTABLISHMENTS_ACTIVE: &str = "agenda_establishments_active";

/// Counter: cache entries evicted to admit new ones.
pub const CACHE_EVICTIONS: &str = "agenda_cache_evictions_total";

/// Counter: replay rounds that attempted at least one send.
pub const REPLAY_ROUNDS: &str = "agenda_replay_rounds_total";

/// Counter: replay sends that failed transiently.
pub const REPLAY_FAILURES: &str = "agenda_replay_failures_total";

/// Counter: journal rewrites down to the live queue.
pub const JOURNAL_COMPACTIONS: &str = "agenda_journal_compactions_total";

/// Install the fmt tracing subscriber. Repeat calls are no-ops, so
/// tests can call this freely.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a mutation op to a short label for logs.
pub fn op_label(op: &MutationOp) -> &'static str {
    match op {
        MutationOp::Insert(_) => "insert",
        MutationOp::Update { .. } => "update",
        MutationOp::Delete { .. } => "delete",
        MutationOp::SaveHours(_) => "save_hours",
        MutationOp::SaveBlackout(_) => "save_blackout",
    }
}
