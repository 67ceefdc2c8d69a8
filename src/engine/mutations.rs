use metrics::counter;
use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_NAME_LEN, MAX_SERVICES_PER_APPOINTMENT};
use crate::model::*;
use crate::observability;
use crate::outbox::EnqueueOutcome;
use crate::remote::{self, RemoteError};

use super::blackout::is_blocked;
use super::grid;
use super::{ScheduleError, Scheduler};

impl Scheduler {
    fn validate_row(&self, row: &AppointmentRow) -> Result<(), ScheduleError> {
        if row.establishment_id != self.establishment_id {
            return Err(ScheduleError::Rejected(
                "appointment belongs to another establishment".into(),
            ));
        }
        if row.services.len() > MAX_SERVICES_PER_APPOINTMENT {
            return Err(ScheduleError::LimitExceeded("too many services"));
        }
        if let Some(name) = &row.client_name
            && name.len() > MAX_NAME_LEN
        {
            return Err(ScheduleError::LimitExceeded("client name too long"));
        }
        if row.services.iter().any(|s| s.name.len() > MAX_NAME_LEN) {
            return Err(ScheduleError::LimitExceeded("service name too long"));
        }
        Ok(())
    }

    async fn check_not_blocked(&self, starts_at: &str) -> Result<(), ScheduleError> {
        let (config, _) = self.effective_config().await;
        let date = crate::localtime::parse_local(starts_at).date();
        if is_blocked(date, &config.blackout) {
            return Err(ScheduleError::Blocked(date));
        }
        Ok(())
    }

    /// Book an appointment. Visible to the next view as soon as the
    /// journal accepts it; the remote send comes after and never gates
    /// the booking.
    pub async fn insert_appointment(&self, row: AppointmentRow) -> Result<Ulid, ScheduleError> {
        self.validate_row(&row)?;
        self.check_not_blocked(&row.starts_at).await?;
        let id = row.id;
        let appointment = Appointment::from_row(&row);
        self.apply(MutationOp::Insert(row), ChangeEvent::Upserted(appointment))
            .await?;
        Ok(id)
    }

    /// Patch selected fields of an appointment.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        patch: AppointmentPatch,
    ) -> Result<(), ScheduleError> {
        if let Some(services) = &patch.services {
            if services.len() > MAX_SERVICES_PER_APPOINTMENT {
                return Err(ScheduleError::LimitExceeded("too many services"));
            }
            if services.iter().any(|s| s.name.len() > MAX_NAME_LEN) {
                return Err(ScheduleError::LimitExceeded("service name too long"));
            }
        }
        if let Some(starts_at) = &patch.starts_at {
            self.check_not_blocked(starts_at).await?;
        }
        self.apply(MutationOp::Update { id, patch }, ChangeEvent::Patched(id))
            .await
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), ScheduleError> {
        self.apply(MutationOp::Delete { id }, ChangeEvent::Removed(id))
            .await
    }

    /// Persist new business hours. Validation is strict here even
    /// though views degrade on bad stored rows; bad input is refused,
    /// bad data is survived.
    pub async fn save_hours(&self, hours: BusinessHours) -> Result<(), ScheduleError> {
        grid::validate(&hours)?;
        self.apply(MutationOp::SaveHours(hours), ChangeEvent::ConfigChanged)
            .await
    }

    pub async fn save_blackout(&self, config: BlackoutConfig) -> Result<(), ScheduleError> {
        if let Some(day) = config.weekdays.iter().find(|day| **day > 6) {
            return Err(ScheduleError::Rejected(format!(
                "weekday index out of range: {day}"
            )));
        }
        self.apply(MutationOp::SaveBlackout(config), ChangeEvent::ConfigChanged)
            .await
    }

    /// Queue one op, publish its local effect, and try the remote
    /// store when nothing for the same record is ahead of it.
    async fn apply(&self, op: MutationOp, local: ChangeEvent) -> Result<(), ScheduleError> {
        let m = QueuedMutation::new(self.establishment_id, op);
        match self.outbox.enqueue(m).await? {
            // The target was already deleted in the queue; there is no
            // local effect to publish.
            EnqueueOutcome::DroppedAfterDelete => Ok(()),
            EnqueueOutcome::Annihilated => {
                counter!(observability::MUTATIONS_APPLIED).increment(1);
                self.hub.send(self.establishment_id, &local);
                Ok(())
            }
            EnqueueOutcome::Deferred(id) => {
                counter!(observability::MUTATIONS_APPLIED).increment(1);
                self.hub.send(self.establishment_id, &local);
                self.hub
                    .send(self.establishment_id, &ChangeEvent::MutationQueued(id));
                Ok(())
            }
            EnqueueOutcome::SendNow(entry) => {
                counter!(observability::MUTATIONS_APPLIED).increment(1);
                self.hub.send(self.establishment_id, &local);
                self.send_foreground(entry).await
            }
        }
    }

    /// Foreground attempt for a freshly queued entry this caller owns.
    async fn send_foreground(&self, m: QueuedMutation) -> Result<(), ScheduleError> {
        match remote::deliver(self.remote.as_ref(), &m).await {
            Ok(()) => {
                self.outbox.confirm(m.id).await?;
                self.note_confirmed(&m).await;
                Ok(())
            }
            Err(RemoteError::Unavailable(reason)) => {
                info!(
                    establishment = %self.establishment_id,
                    mutation = %m.id,
                    reason,
                    "remote store unreachable, mutation stays queued"
                );
                self.outbox.release(m.id).await;
                self.hub
                    .send(self.establishment_id, &ChangeEvent::MutationQueued(m.id));
                Ok(())
            }
            Err(RemoteError::Rejected(reason)) => {
                self.outbox.drop_entry(m.id).await?;
                self.note_rejected(&m, &reason).await;
                Err(ScheduleError::Rejected(reason))
            }
        }
    }
}
