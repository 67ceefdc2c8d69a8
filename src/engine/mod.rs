pub mod blackout;
mod error;
pub mod grid;
pub mod lanes;
mod mutations;
mod views;
#[cfg(test)]
mod tests;

pub use error::ScheduleError;

use std::sync::Arc;

use metrics::counter;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::cache::{appointments_namespace, CacheStore};
use crate::model::*;
use crate::notify::ChangeHub;
use crate::observability;
use crate::outbox::Outbox;
use crate::remote::RemoteStore;

/// Remote-confirmed configuration for one establishment.
#[derive(Debug, Clone, Default)]
pub(super) struct ConfigState {
    pub hours: BusinessHours,
    pub blackout: BlackoutConfig,
}

/// Per-establishment scheduling engine.
///
/// Reads assemble the cached remote state plus everything pending in
/// the mutation queue, so a write is visible to the next view the
/// moment it is journaled. Writes validate, queue, and then try the
/// remote store; remote reachability never gates them.
pub struct Scheduler {
    pub establishment_id: Ulid,
    pub(super) remote: Arc<dyn RemoteStore>,
    pub(super) cache: Arc<CacheStore>,
    pub(super) outbox: Arc<Outbox>,
    pub(super) hub: Arc<ChangeHub>,
    /// Loaded on first use. Pending config saves overlay this at view
    /// time, so it only ever holds what the remote store confirmed.
    pub(super) config: RwLock<Option<ConfigState>>,
}

impl Scheduler {
    pub fn new(
        establishment_id: Ulid,
        remote: Arc<dyn RemoteStore>,
        cache: Arc<CacheStore>,
        outbox: Arc<Outbox>,
        hub: Arc<ChangeHub>,
    ) -> Self {
        Self {
            establishment_id,
            remote,
            cache,
            outbox,
            hub,
            config: RwLock::new(None),
        }
    }

    pub(super) fn namespace(&self) -> String {
        appointments_namespace(self.establishment_id)
    }

    /// Change feed for this establishment's views.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.hub.subscribe(self.establishment_id)
    }

    /// Ordered snapshot of this establishment's unconfirmed mutations.
    pub async fn pending(&self) -> Vec<QueuedMutation> {
        self.outbox.pending_for(self.establishment_id).await
    }

    /// Confirmed config, fetched on first use. Returns the fallback
    /// defaults with `degraded = true` when the remote store cannot be
    /// reached; nothing is cached in that case, so the next read
    /// retries.
    pub(super) async fn remote_config(&self) -> (ConfigState, bool) {
        if let Some(state) = self.config.read().await.clone() {
            return (state, false);
        }
        let hours = self.remote.query_hours(self.establishment_id).await;
        let blackout = self.remote.query_blackout(self.establishment_id).await;
        match (hours, blackout) {
            (Ok(hours), Ok(blackout)) => {
                let state = ConfigState { hours, blackout };
                *self.config.write().await = Some(state.clone());
                (state, false)
            }
            (hours, blackout) => {
                if let Err(e) = hours.and(blackout) {
                    warn!(
                        establishment = %self.establishment_id,
                        error = %e,
                        "config fetch failed, using defaults"
                    );
                }
                (ConfigState::default(), true)
            }
        }
    }

    /// Confirmed config with pending saves applied over it, in queue
    /// order.
    pub(super) async fn effective_config(&self) -> (ConfigState, bool) {
        let (mut state, degraded) = self.remote_config().await;
        for m in self.outbox.pending_for(self.establishment_id).await {
            match m.op {
                MutationOp::SaveHours(hours) => state.hours = hours,
                MutationOp::SaveBlackout(blackout) => state.blackout = blackout,
                _ => {}
            }
        }
        (state, degraded)
    }

    /// The remote store acknowledged a mutation. The cached base is
    /// stale the moment the entry leaves the queue, so the namespace
    /// is dropped before anyone reads it.
    pub(crate) async fn note_confirmed(&self, m: &QueuedMutation) {
        match &m.op {
            MutationOp::SaveHours(hours) => {
                if let Some(state) = self.config.write().await.as_mut() {
                    state.hours = hours.clone();
                }
                self.hub
                    .send(self.establishment_id, &ChangeEvent::ConfigChanged);
            }
            MutationOp::SaveBlackout(blackout) => {
                if let Some(state) = self.config.write().await.as_mut() {
                    state.blackout = blackout.clone();
                }
                self.hub
                    .send(self.establishment_id, &ChangeEvent::ConfigChanged);
            }
            _ => {}
        }
        self.cache.clear_namespace(&self.namespace());
        self.hub
            .send(self.establishment_id, &ChangeEvent::MutationConfirmed(m.id));
    }

    /// The remote store refused a mutation. Dropping the entry already
    /// reverted the overlay; remaining local state that assumed it is
    /// invalidated here and the rejection is published for the UI.
    pub(crate) async fn note_rejected(&self, m: &QueuedMutation, reason: &str) {
        counter!(observability::MUTATIONS_REJECTED).increment(1);
        warn!(
            establishment = %self.establishment_id,
            mutation = %m.id,
            op = observability::op_label(&m.op),
            reason,
            "remote store rejected mutation, rolling back"
        );
        if matches!(
            m.op,
            MutationOp::SaveHours(_) | MutationOp::SaveBlackout(_)
        ) {
            *self.config.write().await = None;
            self.hub
                .send(self.establishment_id, &ChangeEvent::ConfigChanged);
        }
        self.cache.clear_namespace(&self.namespace());
        self.hub.send(
            self.establishment_id,
            &ChangeEvent::MutationRejected {
                id: m.id,
                reason: reason.to_string(),
            },
        );
    }

    /// Another session changed this establishment's remote data; every
    /// cached read is suspect.
    pub(crate) async fn note_remote_change(&self) {
        self.cache.clear_namespace(&self.namespace());
        *self.config.write().await = None;
        self.hub
            .send(self.establishment_id, &ChangeEvent::RemoteChanged);
    }
}
