use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{
    Appointment, AppointmentPatch, AppointmentRow, BlackoutConfig, BusinessHours, MutationOp,
    QueuedMutation,
};

// ── Remote Store Interface ───────────────────────────────────────

/// Why a remote call did not succeed. The gateway branches on this:
/// transient failures are queued for replay, rejections are surfaced
/// and rolled back.
#[derive(Debug)]
pub enum RemoteError {
    /// Network failure, timeout, backend down. Retryable.
    Unavailable(String),
    /// The store refused the write for business reasons. Not retryable.
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteError::Unavailable(e) => write!(f, "remote store unavailable: {e}"),
            RemoteError::Rejected(reason) => write!(f, "remote store rejected: {reason}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Another session changed this establishment's remote data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub establishment_id: Ulid,
}

/// The persistence backend the engine talks to. Writes must be
/// idempotent under re-delivery: inserting an id that already exists
/// overwrites, deleting an absent id succeeds. Client-generated ids
/// make that checkable, and queue replay after a crash between the
/// remote ack and the local confirm depends on it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Appointments whose start date falls in `[from, to]`, both bounds
    /// inclusive, optionally restricted to one staff member.
    async fn query_appointments(
        &self,
        establishment_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        staff: Option<Ulid>,
    ) -> Result<Vec<AppointmentRow>, RemoteError>;

    async fn insert_appointment(&self, row: &AppointmentRow) -> Result<(), RemoteError>;

    async fn update_appointment(
        &self,
        id: Ulid,
        patch: &AppointmentPatch,
    ) -> Result<(), RemoteError>;

    async fn delete_appointment(&self, id: Ulid) -> Result<(), RemoteError>;

    async fn query_blackout(&self, establishment_id: Ulid)
        -> Result<BlackoutConfig, RemoteError>;

    async fn save_blackout(
        &self,
        establishment_id: Ulid,
        config: &BlackoutConfig,
    ) -> Result<(), RemoteError>;

    async fn query_hours(&self, establishment_id: Ulid) -> Result<BusinessHours, RemoteError>;

    async fn save_hours(
        &self,
        establishment_id: Ulid,
        hours: &BusinessHours,
    ) -> Result<(), RemoteError>;

    /// Change feed for edits made by other sessions. Subscribers drop
    /// their cached reads for the named establishment.
    fn changes(&self) -> broadcast::Receiver<RemoteChange>;
}

/// Send one queued mutation to the backend it belongs to.
pub async fn deliver(remote: &dyn RemoteStore, m: &QueuedMutation) -> Result<(), RemoteError> {
    match &m.op {
        MutationOp::Insert(row) => remote.insert_appointment(row).await,
        MutationOp::Update { id, patch } => remote.update_appointment(*id, patch).await,
        MutationOp::Delete { id } => remote.delete_appointment(*id).await,
        MutationOp::SaveBlackout(config) => {
            remote.save_blackout(m.establishment_id, config).await
        }
        MutationOp::SaveHours(hours) => remote.save_hours(m.establishment_id, hours).await,
    }
}

// ── In-Memory Backend ────────────────────────────────────────────

/// `RemoteStore` backed by process memory. Configuration is held the
/// same way the real backend holds it, as string-keyed settings maps
/// per establishment. Carries switches for connectivity and rejection
/// plus per-operation call counters, which replay behavior is asserted
/// against.
pub struct InMemoryRemote {
    appointments: DashMap<Ulid, AppointmentRow>,
    settings: DashMap<Ulid, HashMap<String, String>>,
    change_tx: broadcast::Sender<RemoteChange>,
    online: AtomicBool,
    rejecting: AtomicBool,
    insert_calls: AtomicU64,
    update_calls: AtomicU64,
    delete_calls: AtomicU64,
    query_calls: AtomicU64,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            appointments: DashMap::new(),
            settings: DashMap::new(),
            change_tx,
            online: AtomicBool::new(true),
            rejecting: AtomicBool::new(false),
            insert_calls: AtomicU64::new(0),
            update_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            query_calls: AtomicU64::new(0),
        }
    }

    /// Flip connectivity. While offline every call fails `Unavailable`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// While set, every write fails `Rejected`.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Put a row in place directly, without counters or connectivity.
    pub fn seed_appointment(&self, row: AppointmentRow) {
        self.appointments.insert(row.id, row);
    }

    pub fn appointment(&self, id: Ulid) -> Option<AppointmentRow> {
        self.appointments.get(&id).map(|e| e.value().clone())
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    /// Pretend another session changed this establishment's data.
    pub fn publish_external_change(&self, establishment_id: Ulid) {
        let _ = self.change_tx.send(RemoteChange { establishment_id });
    }

    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> u64 {
        self.query_calls.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<(), RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("simulated rejection".into()));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn query_appointments(
        &self,
        establishment_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        staff: Option<Ulid>,
    ) -> Result<Vec<AppointmentRow>, RemoteError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;
        let mut rows: Vec<AppointmentRow> = self
            .appointments
            .iter()
            .filter(|e| e.value().establishment_id == establishment_id)
            .filter(|e| staff.is_none() || e.value().staff_id == staff)
            .filter(|e| {
                let date = Appointment::from_row(e.value()).date();
                date >= from && date <= to
            })
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| Appointment::from_row(r).starts_at);
        Ok(rows)
    }

    async fn insert_appointment(&self, row: &AppointmentRow) -> Result<(), RemoteError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        // Same-id re-delivery overwrites.
        self.appointments.insert(row.id, row.clone());
        Ok(())
    }

    async fn update_appointment(
        &self,
        id: Ulid,
        patch: &AppointmentPatch,
    ) -> Result<(), RemoteError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        let Some(mut entry) = self.appointments.get_mut(&id) else {
            return Err(RemoteError::Rejected(format!("unknown appointment {id}")));
        };
        let row = entry.value_mut();
        let mut normalized = Appointment::from_row(row);
        patch.apply_to(&mut normalized);
        *row = normalized.to_row();
        Ok(())
    }

    async fn delete_appointment(&self, id: Ulid) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_write()?;
        // Deleting an absent id succeeds; re-delivery must be harmless.
        self.appointments.remove(&id);
        Ok(())
    }

    async fn query_blackout(
        &self,
        establishment_id: Ulid,
    ) -> Result<BlackoutConfig, RemoteError> {
        self.check_read()?;
        let settings = self
            .settings
            .get(&establishment_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(BlackoutConfig::from_settings(&settings))
    }

    async fn save_blackout(
        &self,
        establishment_id: Ulid,
        config: &BlackoutConfig,
    ) -> Result<(), RemoteError> {
        self.check_write()?;
        self.settings
            .entry(establishment_id)
            .or_default()
            .extend(config.to_settings());
        Ok(())
    }

    async fn query_hours(&self, establishment_id: Ulid) -> Result<BusinessHours, RemoteError> {
        self.check_read()?;
        let settings = self
            .settings
            .get(&establishment_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(BusinessHours::from_settings(&settings))
    }

    async fn save_hours(
        &self,
        establishment_id: Ulid,
        hours: &BusinessHours,
    ) -> Result<(), RemoteError> {
        self.check_write()?;
        self.settings
            .entry(establishment_id)
            .or_default()
            .extend(hours.to_settings());
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<RemoteChange> {
        self.change_tx.subscribe()
    }
}
