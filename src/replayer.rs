use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::establishment::EstablishmentManager;
use crate::limits::{JANITOR_PERIOD, REPLAY_PERIOD};
use crate::model::RecordKey;
use crate::observability;
use crate::remote::{self, RemoteChange, RemoteError};

/// Background task that periodically drains the mutation queue toward
/// the remote store. The first round runs one period after start, so
/// a fresh process finishes restoring before it begins sending.
pub async fn run_replayer(manager: Arc<EstablishmentManager>) {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + REPLAY_PERIOD,
        REPLAY_PERIOD,
    );
    loop {
        interval.tick().await;
        replay_round(&manager).await;
    }
}

/// One drain attempt over the current queue snapshot. Entries go out
/// in queue order; a record whose entry cannot be claimed stays
/// blocked for the rest of the round so its ops never reorder. The
/// round ends at the first transient failure, the store is plainly
/// unreachable.
pub async fn replay_round(manager: &EstablishmentManager) -> usize {
    let pending = manager.outbox().pending().await;
    if pending.is_empty() {
        return 0;
    }
    counter!(observability::REPLAY_ROUNDS).increment(1);

    let mut blocked: HashSet<RecordKey> = HashSet::new();
    let mut sent = 0usize;
    for m in pending {
        let key = m.record_key();
        if blocked.contains(&key) {
            continue;
        }
        // None: confirmed meanwhile, or a foreground send owns it.
        let Some(claimed) = manager.outbox().mark_in_flight(m.id).await else {
            blocked.insert(key);
            continue;
        };
        match remote::deliver(manager.remote().as_ref(), &claimed).await {
            Ok(()) => match manager.outbox().confirm(claimed.id).await {
                Ok(_) => {
                    debug!(
                        mutation = %claimed.id,
                        op = observability::op_label(&claimed.op),
                        "replayed queued mutation"
                    );
                    manager.note_confirmed(&claimed).await;
                    sent += 1;
                }
                Err(e) => {
                    // The remote took it but the journal did not; the
                    // entry stays and the idempotent re-send converges.
                    error!(mutation = %claimed.id, error = %e, "journal confirm failed");
                    manager.outbox().release(claimed.id).await;
                    blocked.insert(key);
                }
            },
            Err(RemoteError::Unavailable(reason)) => {
                counter!(observability::REPLAY_FAILURES).increment(1);
                debug!(
                    mutation = %claimed.id,
                    reason,
                    "remote store unreachable, ending replay round"
                );
                manager.outbox().release(claimed.id).await;
                break;
            }
            Err(RemoteError::Rejected(reason)) => {
                match manager.outbox().drop_entry(claimed.id).await {
                    Ok(_) => manager.note_rejected(&claimed, &reason).await,
                    Err(e) => {
                        error!(mutation = %claimed.id, error = %e, "journal drop failed");
                        manager.outbox().release(claimed.id).await;
                        blocked.insert(key);
                    }
                }
            }
        }
    }

    if sent > 0 {
        let remaining = manager.outbox().len().await;
        info!(sent, remaining, "replayed queued mutations");
    }
    sent
}

/// Background task that sweeps expired cache entries and compacts the
/// journal once enough appends accumulate.
pub async fn run_janitor(manager: Arc<EstablishmentManager>) {
    let mut interval = tokio::time::interval_at(
        tokio::time::Instant::now() + JANITOR_PERIOD,
        JANITOR_PERIOD,
    );
    loop {
        interval.tick().await;
        janitor_pass(&manager).await;
    }
}

pub(crate) async fn janitor_pass(manager: &EstablishmentManager) {
    let swept = manager.cache().sweep();
    if swept > 0 {
        debug!(swept, "dropped expired cache entries");
    }
    if let Err(e) = manager.outbox().maybe_compact().await {
        error!(error = %e, "journal compaction failed");
    }
}

/// Follow the remote change feed, invalidating cached reads for any
/// establishment another session touched. The caller subscribes the
/// receiver before this task is spawned, so a change published while
/// the task is still waiting to run is delivered on the first poll.
pub async fn run_change_listener(
    manager: Arc<EstablishmentManager>,
    mut changes: broadcast::Receiver<RemoteChange>,
) {
    loop {
        match changes.recv().await {
            Ok(change) => manager.note_remote_change(change.establishment_id).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "remote change feed lagged, invalidating everything");
                manager.invalidate_all().await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("remote change feed closed");
                return;
            }
        }
    }
}
