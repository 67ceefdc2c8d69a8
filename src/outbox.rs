use std::io;
use std::path::Path;

use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::ScheduleError;
use crate::journal::{Journal, JournalEvent};
use crate::limits::{JOURNAL_COMPACT_THRESHOLD, MAX_QUEUE_LEN};
use crate::model::{Appointment, MutationOp, QueuedMutation};
use crate::observability;

// ── Offline Mutation Queue ───────────────────────────────────────
//
// Every write is journaled here before anything is reported saved.
// The queue doubles as the optimistic overlay: a view merges pending
// ops over its fetched base, so "apply locally then try the network"
// is one step — the journal append IS the local apply.
//
// Reduction happens at enqueue time, per record: later patches merge
// into a queued update or insert, a delete supersedes queued updates,
// and a delete meeting a never-sent insert cancels both. Entries being
// sent right now are left alone; the reduction only touches entries
// that are still waiting.

/// What `enqueue` decided. The entry order per record is creation
/// order, so a mutation may not be sent ahead of earlier queued work
/// for the same record.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Queued with nothing ahead of it for the same record. The entry
    /// is marked in flight; the caller owns the foreground send.
    SendNow(QueuedMutation),
    /// Queued behind earlier pending work for the same record; the
    /// replayer sends it in order.
    Deferred(Ulid),
    /// The delete met a pending insert that never reached the remote;
    /// both were dropped and there is nothing to send.
    Annihilated,
    /// The record was already deleted in the queue. Caller error,
    /// logged and not retried.
    DroppedAfterDelete,
}

struct PendingEntry {
    mutation: QueuedMutation,
    /// Set while some task is sending this entry. Never persisted.
    in_flight: bool,
}

struct OutboxInner {
    journal: Journal,
    queue: Vec<PendingEntry>,
}

/// Process-wide mutation queue, one journal file behind one lock.
pub struct Outbox {
    inner: Mutex<OutboxInner>,
}

fn jerr(e: io::Error) -> ScheduleError {
    ScheduleError::JournalError(e.to_string())
}

fn record_depth(queue: &[PendingEntry]) {
    gauge!(observability::QUEUE_DEPTH).set(queue.len() as f64);
}

/// Fold journal records back into the pending queue. A `Queued` record
/// whose id is already present replaces that entry in place, keeping
/// its queue position.
fn rebuild_pending(events: Vec<JournalEvent>) -> Vec<QueuedMutation> {
    let mut queue: Vec<QueuedMutation> = Vec::new();
    for event in events {
        match event {
            JournalEvent::Queued(m) => {
                if let Some(pos) = queue.iter().position(|q| q.id == m.id) {
                    queue[pos] = m;
                } else {
                    queue.push(m);
                }
            }
            JournalEvent::Confirmed { id } | JournalEvent::Dropped { id } => {
                queue.retain(|q| q.id != id);
            }
        }
    }
    queue
}

/// Decide the outcome for the entry at `pos` and claim the flight when
/// nothing with the same record key precedes it.
fn outcome_for(queue: &mut [PendingEntry], pos: usize) -> EnqueueOutcome {
    let key = queue[pos].mutation.record_key();
    let blocked = queue[..pos]
        .iter()
        .any(|e| e.mutation.record_key() == key);
    if blocked {
        EnqueueOutcome::Deferred(queue[pos].mutation.id)
    } else {
        queue[pos].in_flight = true;
        EnqueueOutcome::SendNow(queue[pos].mutation.clone())
    }
}

impl Outbox {
    /// Open the journal at `path` and restore the pending queue from
    /// it. Flight flags start cleared.
    pub fn open(path: &Path) -> Result<Self, ScheduleError> {
        let events = Journal::replay(path).map_err(jerr)?;
        let pending = rebuild_pending(events);
        if !pending.is_empty() {
            info!(pending = pending.len(), "restored pending mutations from journal");
        }
        let journal = Journal::open(path).map_err(jerr)?;
        let queue: Vec<PendingEntry> = pending
            .into_iter()
            .map(|mutation| PendingEntry {
                mutation,
                in_flight: false,
            })
            .collect();
        record_depth(&queue);
        Ok(Self {
            inner: Mutex::new(OutboxInner { journal, queue }),
        })
    }

    /// Journal and queue a mutation, reducing against queued work for
    /// the same record first. The journal append and the queue update
    /// happen under one lock; a concurrent read sees the mutation fully
    /// queued or not at all.
    pub async fn enqueue(
        &self,
        mutation: QueuedMutation,
    ) -> Result<EnqueueOutcome, ScheduleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let key = mutation.record_key();

        // A record deleted in the queue takes no further ops.
        let after_delete = matches!(
            mutation.op,
            MutationOp::Insert(_) | MutationOp::Update { .. }
        ) && inner.queue.iter().any(|e| {
            e.mutation.record_key() == key && matches!(e.mutation.op, MutationOp::Delete { .. })
        });
        if after_delete {
            warn!(mutation = %mutation.id, "mutation targets a record already deleted in the queue, dropping");
            return Ok(EnqueueOutcome::DroppedAfterDelete);
        }

        match &mutation.op {
            MutationOp::Delete { .. } => {
                let insert_id = inner
                    .queue
                    .iter()
                    .find(|e| {
                        !e.in_flight
                            && e.mutation.record_key() == key
                            && matches!(e.mutation.op, MutationOp::Insert(_))
                    })
                    .map(|e| e.mutation.id);
                // Updates that never left cannot outlive the record.
                let mut doomed: Vec<Ulid> = inner
                    .queue
                    .iter()
                    .filter(|e| {
                        !e.in_flight
                            && e.mutation.record_key() == key
                            && matches!(e.mutation.op, MutationOp::Update { .. })
                    })
                    .map(|e| e.mutation.id)
                    .collect();

                if let Some(insert_id) = insert_id {
                    // The remote never saw this record; cancel the lot.
                    doomed.push(insert_id);
                    for id in &doomed {
                        inner
                            .journal
                            .append(&JournalEvent::Dropped { id: *id })
                            .map_err(jerr)?;
                    }
                    inner.queue.retain(|e| !doomed.contains(&e.mutation.id));
                    record_depth(&inner.queue);
                    debug!(
                        mutation = %mutation.id,
                        cancelled = doomed.len(),
                        "delete annihilated a queued insert"
                    );
                    return Ok(EnqueueOutcome::Annihilated);
                }

                for id in &doomed {
                    inner
                        .journal
                        .append(&JournalEvent::Dropped { id: *id })
                        .map_err(jerr)?;
                }
                inner.queue.retain(|e| !doomed.contains(&e.mutation.id));
            }
            MutationOp::Update { patch, .. } => {
                let target = inner.queue.iter().position(|e| {
                    !e.in_flight
                        && e.mutation.record_key() == key
                        && matches!(
                            e.mutation.op,
                            MutationOp::Insert(_) | MutationOp::Update { .. }
                        )
                });
                if let Some(pos) = target {
                    let mut merged = inner.queue[pos].mutation.clone();
                    match &mut merged.op {
                        MutationOp::Insert(row) => {
                            let mut normalized = Appointment::from_row(row);
                            patch.apply_to(&mut normalized);
                            *row = normalized.to_row();
                        }
                        MutationOp::Update {
                            patch: existing, ..
                        } => existing.merge(patch),
                        _ => {}
                    }
                    inner
                        .journal
                        .append(&JournalEvent::Queued(merged.clone()))
                        .map_err(jerr)?;
                    inner.queue[pos].mutation = merged;
                    return Ok(outcome_for(&mut inner.queue, pos));
                }
            }
            MutationOp::SaveHours(_) | MutationOp::SaveBlackout(_) => {
                // Config saves: the latest content wins.
                let target = inner
                    .queue
                    .iter()
                    .position(|e| !e.in_flight && e.mutation.record_key() == key);
                if let Some(pos) = target {
                    let mut replaced = inner.queue[pos].mutation.clone();
                    replaced.op = mutation.op.clone();
                    inner
                        .journal
                        .append(&JournalEvent::Queued(replaced.clone()))
                        .map_err(jerr)?;
                    inner.queue[pos].mutation = replaced;
                    return Ok(outcome_for(&mut inner.queue, pos));
                }
            }
            MutationOp::Insert(_) => {}
        }

        if inner.queue.len() >= MAX_QUEUE_LEN {
            return Err(ScheduleError::LimitExceeded("mutation queue"));
        }
        inner
            .journal
            .append(&JournalEvent::Queued(mutation.clone()))
            .map_err(jerr)?;
        inner.queue.push(PendingEntry {
            mutation,
            in_flight: false,
        });
        counter!(observability::MUTATIONS_QUEUED).increment(1);
        record_depth(&inner.queue);
        let pos = inner.queue.len() - 1;
        Ok(outcome_for(&mut inner.queue, pos))
    }

    /// Claim an entry for sending. `None` when the entry is gone or
    /// another task already owns it.
    pub async fn mark_in_flight(&self, id: Ulid) -> Option<QueuedMutation> {
        let mut inner = self.inner.lock().await;
        let entry = inner.queue.iter_mut().find(|e| e.mutation.id == id)?;
        if entry.in_flight {
            return None;
        }
        entry.in_flight = true;
        Some(entry.mutation.clone())
    }

    /// Give a claimed entry back after a transient failure.
    pub async fn release(&self, id: Ulid) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.queue.iter_mut().find(|e| e.mutation.id == id) {
            entry.in_flight = false;
            entry.mutation.retries += 1;
        }
    }

    /// The remote acknowledged the mutation. Journaled before the entry
    /// leaves memory, so a crash in between re-sends (idempotent)
    /// instead of losing the confirmation.
    pub async fn confirm(&self, id: Ulid) -> Result<Option<QueuedMutation>, ScheduleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(pos) = inner.queue.iter().position(|e| e.mutation.id == id) else {
            return Ok(None);
        };
        inner
            .journal
            .append(&JournalEvent::Confirmed { id })
            .map_err(jerr)?;
        let entry = inner.queue.remove(pos);
        counter!(observability::MUTATIONS_CONFIRMED).increment(1);
        record_depth(&inner.queue);
        Ok(Some(entry.mutation))
    }

    /// Remove an entry without sending it (remote rejection, or a later
    /// delete made it moot). Callers own the entry via enqueue or
    /// [`mark_in_flight`](Self::mark_in_flight) before dropping it.
    pub async fn drop_entry(&self, id: Ulid) -> Result<Option<QueuedMutation>, ScheduleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let Some(pos) = inner.queue.iter().position(|e| e.mutation.id == id) else {
            return Ok(None);
        };
        inner
            .journal
            .append(&JournalEvent::Dropped { id })
            .map_err(jerr)?;
        let entry = inner.queue.remove(pos);
        record_depth(&inner.queue);
        Ok(Some(entry.mutation))
    }

    /// Ordered snapshot of everything pending.
    pub async fn pending(&self) -> Vec<QueuedMutation> {
        let inner = self.inner.lock().await;
        inner.queue.iter().map(|e| e.mutation.clone()).collect()
    }

    /// Ordered snapshot of one establishment's pending mutations.
    pub async fn pending_for(&self, establishment_id: Ulid) -> Vec<QueuedMutation> {
        let inner = self.inner.lock().await;
        inner
            .queue
            .iter()
            .filter(|e| e.mutation.establishment_id == establishment_id)
            .map(|e| e.mutation.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Rewrite the journal down to the live queue when enough appends
    /// have accumulated. The janitor calls this periodically.
    pub async fn maybe_compact(&self) -> Result<bool, ScheduleError> {
        if self.inner.lock().await.journal.appends_since_compact() < JOURNAL_COMPACT_THRESHOLD {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    /// Unconditionally rewrite the journal from the live queue.
    pub async fn compact(&self) -> Result<(), ScheduleError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        let events: Vec<JournalEvent> = inner
            .queue
            .iter()
            .map(|e| JournalEvent::Queued(e.mutation.clone()))
            .collect();
        Journal::write_compact_file(inner.journal.path(), &events).map_err(jerr)?;
        inner.journal.swap_compact_file().map_err(jerr)?;
        counter!(observability::JOURNAL_COMPACTIONS).increment(1);
        info!(pending = events.len(), "journal compacted");
        Ok(())
    }
}
