use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ulid::Ulid;

use crate::cache::CacheStore;
use crate::engine::{ScheduleError, Scheduler};
use crate::limits::MAX_ESTABLISHMENTS;
use crate::model::{ChangeEvent, QueuedMutation};
use crate::notify::ChangeHub;
use crate::observability;
use crate::outbox::Outbox;
use crate::remote::RemoteStore;
use crate::replayer;

const JOURNAL_FILE: &str = "outbox.journal";

/// Owns the per-establishment schedulers and everything they share:
/// the journaled mutation queue, the view cache, the change hub, and
/// the remote store handle. One of these per process.
pub struct EstablishmentManager {
    schedulers: DashMap<Ulid, Arc<Scheduler>>,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<CacheStore>,
    outbox: Arc<Outbox>,
    hub: Arc<ChangeHub>,
    tasks_started: AtomicBool,
}

impl EstablishmentManager {
    /// Open (or create) the mutation journal under `data_dir` and
    /// build a manager around it. Pending mutations from a previous
    /// run are restored before the first scheduler is handed out.
    pub fn open(
        data_dir: &Path,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Arc<Self>, ScheduleError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ScheduleError::JournalError(e.to_string()))?;
        let outbox = Arc::new(Outbox::open(&data_dir.join(JOURNAL_FILE))?);
        Ok(Arc::new(Self {
            schedulers: DashMap::new(),
            remote,
            cache: Arc::new(CacheStore::new()),
            outbox,
            hub: Arc::new(ChangeHub::new()),
            tasks_started: AtomicBool::new(false),
        }))
    }

    /// Get or lazily create the scheduler for one establishment. The
    /// first call also starts the background replayer, janitor, and
    /// remote change listener.
    pub fn get_or_create(
        self: &Arc<Self>,
        establishment_id: Ulid,
    ) -> Result<Arc<Scheduler>, ScheduleError> {
        self.start_background_tasks();
        if let Some(scheduler) = self.schedulers.get(&establishment_id) {
            return Ok(scheduler.value().clone());
        }
        if self.schedulers.len() >= MAX_ESTABLISHMENTS {
            return Err(ScheduleError::LimitExceeded("too many establishments"));
        }
        let scheduler = Arc::new(Scheduler::new(
            establishment_id,
            self.remote.clone(),
            self.cache.clone(),
            self.outbox.clone(),
            self.hub.clone(),
        ));
        self.schedulers.insert(establishment_id, scheduler.clone());
        metrics::gauge!(observability::ESTABLISHMENTS_ACTIVE)
            .set(self.schedulers.len() as f64);
        Ok(scheduler)
    }

    fn start_background_tasks(self: &Arc<Self>) {
        if self
            .tasks_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // Subscribe before spawning; a change published before the
            // listener's first poll is then buffered, not lost.
            let changes = self.remote.changes();
            tokio::spawn(replayer::run_replayer(self.clone()));
            tokio::spawn(replayer::run_janitor(self.clone()));
            tokio::spawn(replayer::run_change_listener(self.clone(), changes));
        }
    }

    pub(crate) fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub(crate) fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub(crate) fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Route a confirmation to the owning scheduler. The scheduler may
    /// not be loaded when the queue outlived a restart; subscribers
    /// still hear about it.
    pub(crate) async fn note_confirmed(&self, m: &QueuedMutation) {
        let scheduler = self
            .schedulers
            .get(&m.establishment_id)
            .map(|e| e.value().clone());
        match scheduler {
            Some(s) => s.note_confirmed(m).await,
            None => self.hub.send(
                m.establishment_id,
                &ChangeEvent::MutationConfirmed(m.id),
            ),
        }
    }

    pub(crate) async fn note_rejected(&self, m: &QueuedMutation, reason: &str) {
        let scheduler = self
            .schedulers
            .get(&m.establishment_id)
            .map(|e| e.value().clone());
        match scheduler {
            Some(s) => s.note_rejected(m, reason).await,
            None => {
                metrics::counter!(observability::MUTATIONS_REJECTED).increment(1);
                self.hub.send(
                    m.establishment_id,
                    &ChangeEvent::MutationRejected {
                        id: m.id,
                        reason: reason.to_string(),
                    },
                );
            }
        }
    }

    pub(crate) async fn note_remote_change(&self, establishment_id: Ulid) {
        let scheduler = self
            .schedulers
            .get(&establishment_id)
            .map(|e| e.value().clone());
        match scheduler {
            Some(s) => s.note_remote_change().await,
            None => self
                .hub
                .send(establishment_id, &ChangeEvent::RemoteChanged),
        }
    }

    /// Drop cached reads for every loaded establishment. Used when the
    /// change feed lagged and the affected set is unknown.
    pub(crate) async fn invalidate_all(&self) {
        let schedulers: Vec<Arc<Scheduler>> =
            self.schedulers.iter().map(|e| e.value().clone()).collect();
        for scheduler in schedulers {
            scheduler.note_remote_change().await;
        }
    }
}
