// libs/appointment-cell/src/services/lifecycle.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::models::{
    ActionKind, Actor, Appointment, AppointmentAction, AppointmentError, AppointmentPatch,
    AppointmentQuery, AppointmentStatus, BookAppointmentRequest, ConflictCheckResponse,
};
use crate::services::conflict::{store_error, ConflictDetectionService};
use crate::services::locking::DoctorDayLocks;
use crate::services::store::{AppointmentStore, StoreError};

/// Transition table. Returns the target status, or `None` when `actor` may
/// not perform `action` from `current`.
pub fn next_status(current: AppointmentStatus, actor: Actor, action: ActionKind) -> Option<AppointmentStatus> {
    use AppointmentStatus::*;

    if current.is_terminal() {
        return None;
    }

    match (current, action) {
        (Pending, ActionKind::Confirm) if actor.acts_as(Actor::Doctor) => Some(Confirmed),
        (Pending, ActionKind::Cancel) => Some(Cancelled),
        (Confirmed, ActionKind::ProposeReschedule) if actor.acts_as(Actor::Doctor) => Some(RescheduleRequested),
        (Confirmed, ActionKind::Complete) if actor.acts_as(Actor::Doctor) => Some(Completed),
        (Confirmed, ActionKind::Cancel) if actor.acts_as(Actor::Patient) => Some(Cancelled),
        (RescheduleRequested, ActionKind::AcceptReschedule) if actor.acts_as(Actor::Patient) => Some(Confirmed),
        (RescheduleRequested, ActionKind::DeclineReschedule) if actor.acts_as(Actor::Patient) => Some(Cancelled),
        _ => None,
    }
}

/// Actions `actor` may take on an appointment in `status`.
pub fn available_actions(status: AppointmentStatus, actor: Actor) -> Vec<ActionKind> {
    ActionKind::ALL
        .into_iter()
        .filter(|action| next_status(status, actor, *action).is_some())
        .collect()
}

fn required_reason(reason: Option<&str>, action: ActionKind) -> Result<String, AppointmentError> {
    match reason.map(str::trim) {
        Some(reason) if !reason.is_empty() => Ok(reason.to_string()),
        _ => Err(AppointmentError::ValidationError(format!(
            "A cancellation reason is required to {} an appointment", action
        ))),
    }
}

/// `start + duration` on the same day, or `None` if it would run past midnight.
fn end_on_same_day(start: NaiveTime, duration: chrono::Duration) -> Option<NaiveTime> {
    let (end, wrapped_secs) = start.overflowing_add_signed(duration);
    (wrapped_secs == 0 && end > start).then_some(end)
}

/// Computes the appointment resulting from `action`, without persisting it.
/// All side effects of a transition are applied here together.
pub fn apply_action(
    appointment: &Appointment,
    actor: Actor,
    action: &AppointmentAction,
    now: DateTime<Utc>,
) -> Result<Appointment, AppointmentError> {
    let kind = action.kind();
    let target = next_status(appointment.status, actor, kind).ok_or(AppointmentError::InvalidTransition {
        from: appointment.status,
        action: kind,
    })?;

    let mut updated = appointment.clone();
    updated.status = target;
    updated.updated_at = now;

    match action {
        AppointmentAction::Confirm | AppointmentAction::Complete => {}
        AppointmentAction::Cancel { reason } => {
            updated.cancellation_reason = Some(required_reason(reason.as_deref(), kind)?);
        }
        AppointmentAction::ProposeReschedule { date, start_time } => {
            let (date, start_time) = match (date, start_time) {
                (Some(date), Some(start_time)) => (*date, *start_time),
                _ => {
                    return Err(AppointmentError::ValidationError(
                        "proposed_date and proposed_start_time are required to propose a reschedule".to_string(),
                    ))
                }
            };
            if end_on_same_day(start_time, appointment.duration()).is_none() {
                return Err(AppointmentError::ValidationError(format!(
                    "A {} minute appointment starting at {} would run past midnight",
                    appointment.duration().num_minutes(),
                    start_time
                )));
            }
            updated.proposed_date = Some(date);
            updated.proposed_start_time = Some(start_time);
        }
        AppointmentAction::AcceptReschedule => {
            let (date, start_time) = match (appointment.proposed_date, appointment.proposed_start_time) {
                (Some(date), Some(start_time)) => (date, start_time),
                _ => {
                    return Err(AppointmentError::ValidationError(
                        "No proposed slot recorded for this appointment".to_string(),
                    ))
                }
            };
            let end_time = end_on_same_day(start_time, appointment.duration()).ok_or_else(|| {
                AppointmentError::ValidationError("Proposed slot runs past midnight".to_string())
            })?;
            updated.date = date;
            updated.start_time = start_time;
            updated.end_time = end_time;
            updated.proposed_date = None;
            updated.proposed_start_time = None;
        }
        AppointmentAction::DeclineReschedule { reason } => {
            updated.cancellation_reason = Some(required_reason(reason.as_deref(), kind)?);
            updated.proposed_date = None;
            updated.proposed_start_time = None;
        }
    }

    Ok(updated)
}

/// Owns the appointment status machine and the confirmation policy. Handlers
/// call in with an already-authorized actor; persistence is injected.
pub struct AppointmentLifecycleManager {
    store: Arc<dyn AppointmentStore>,
    conflicts: ConflictDetectionService,
    locks: DoctorDayLocks,
}

impl AppointmentLifecycleManager {
    pub fn new(store: Arc<dyn AppointmentStore>, lock_wait: Duration) -> Self {
        Self {
            conflicts: ConflictDetectionService::new(store.clone()),
            store,
            locks: DoctorDayLocks::new(lock_wait),
        }
    }

    pub fn from_config(store: Arc<dyn AppointmentStore>, config: &AppConfig) -> Self {
        Self::new(store, Duration::from_millis(config.appointment_lock_wait_ms))
    }

    pub fn locks(&self) -> &DoctorDayLocks {
        &self.locks
    }

    /// New bookings are always accepted as `pending`; overlapping requests are
    /// settled when the doctor confirms.
    #[instrument(skip(self))]
    pub async fn book(&self, request: BookAppointmentRequest) -> Result<Appointment, AppointmentError> {
        if request.end_time <= request.start_time {
            return Err(AppointmentError::ValidationError(
                "end_time must be after start_time".to_string(),
            ));
        }

        let now = Utc::now();
        let appointment = Appointment {
            id: Uuid::new_v4(),
            doctor_id: request.doctor_id,
            patient_id: request.patient_id,
            date: request.date,
            start_time: request.start_time,
            end_time: request.end_time,
            status: AppointmentStatus::Pending,
            proposed_date: None,
            proposed_start_time: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };

        let created = self.store
            .insert_appointment(appointment)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        info!("Booked appointment {} with doctor {} on {} {}-{}",
              created.id, created.doctor_id, created.date, created.start_time, created.end_time);
        Ok(created)
    }

    pub async fn get(&self, id: Uuid) -> Result<Appointment, AppointmentError> {
        self.store.get_appointment(id).await.map_err(|e| store_error(id, e))
    }

    pub async fn list(&self, query: &AppointmentQuery) -> Result<Vec<Appointment>, AppointmentError> {
        self.store
            .list_appointments(query)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))
    }

    pub async fn check_conflicts(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<ConflictCheckResponse, AppointmentError> {
        self.conflicts
            .check_conflicts(doctor_id, date, start_time, end_time, exclude_appointment_id)
            .await
    }

    /// Validates and commits a single transition. Either every field change of
    /// the transition is stored or none is.
    #[instrument(skip(self, action), fields(action = %action.kind()))]
    pub async fn transition(
        &self,
        id: Uuid,
        actor: Actor,
        action: AppointmentAction,
    ) -> Result<Appointment, AppointmentError> {
        let current = self.get(id).await?;
        let updated = apply_action(&current, actor, &action, Utc::now()).map_err(|e| {
            warn!("Rejected {} on appointment {} by {}: {}", action.kind(), id, actor, e);
            e
        })?;

        if !action.kind().claims_slot() {
            return self.commit(&current, updated, action.kind()).await;
        }

        let locked_date = updated.date;
        let _guard = self.locks.acquire(updated.doctor_id, locked_date).await?;

        // Re-read under the lock; the first read only told us which lock to take.
        let current = self.get(id).await?;
        let updated = apply_action(&current, actor, &action, Utc::now())?;
        if updated.date != locked_date {
            // The target day moved between reads; the caller should retry.
            return Err(AppointmentError::Busy { doctor_id: updated.doctor_id, date: locked_date });
        }

        self.conflicts.ensure_slot_free(&updated).await?;
        self.commit(&current, updated, action.kind()).await
    }

    async fn commit(
        &self,
        current: &Appointment,
        updated: Appointment,
        action: ActionKind,
    ) -> Result<Appointment, AppointmentError> {
        let patch = AppointmentPatch::from_transition(current.status, &updated);

        let stored = self.store
            .update_appointment(current.id, patch)
            .await
            .map_err(|e| match e {
                StoreError::StatusChanged { current: now_status } => {
                    warn!("Appointment {} moved to {} before {} could commit", current.id, now_status, action);
                    AppointmentError::InvalidTransition { from: now_status, action }
                }
                other => store_error(current.id, other),
            })?;

        info!("Appointment {} transitioned {} -> {}", stored.id, current.status, stored.status);
        debug!("Appointment {} now {:?}", stored.id, stored);
        Ok(stored)
    }

    pub async fn confirm(&self, id: Uuid, actor: Actor) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::Confirm).await
    }

    pub async fn complete(&self, id: Uuid, actor: Actor) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::Complete).await
    }

    pub async fn cancel(&self, id: Uuid, actor: Actor, reason: Option<String>) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::Cancel { reason }).await
    }

    pub async fn propose_reschedule(
        &self,
        id: Uuid,
        actor: Actor,
        date: Option<NaiveDate>,
        start_time: Option<NaiveTime>,
    ) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::ProposeReschedule { date, start_time }).await
    }

    pub async fn accept_reschedule(&self, id: Uuid, actor: Actor) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::AcceptReschedule).await
    }

    pub async fn decline_reschedule(&self, id: Uuid, actor: Actor, reason: Option<String>) -> Result<Appointment, AppointmentError> {
        self.transition(id, actor, AppointmentAction::DeclineReschedule { reason }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn t(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn appointment(status: AppointmentStatus) -> Appointment {
        let created = Utc::now() - ChronoDuration::hours(1);
        Appointment {
            id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            date: d(2),
            start_time: t(9, 0),
            end_time: t(9, 45),
            status,
            proposed_date: None,
            proposed_start_time: None,
            cancellation_reason: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn awaiting_reschedule() -> Appointment {
        let mut a = appointment(AppointmentStatus::RescheduleRequested);
        a.proposed_date = Some(d(5));
        a.proposed_start_time = Some(t(14, 30));
        a
    }

    #[test]
    fn table_matches_documented_transitions() {
        use AppointmentStatus::*;

        assert_eq!(next_status(Pending, Actor::Doctor, ActionKind::Confirm), Some(Confirmed));
        assert_eq!(next_status(Pending, Actor::Patient, ActionKind::Confirm), None);
        assert_eq!(next_status(Pending, Actor::Doctor, ActionKind::Cancel), Some(Cancelled));
        assert_eq!(next_status(Pending, Actor::Patient, ActionKind::Cancel), Some(Cancelled));
        assert_eq!(next_status(Confirmed, Actor::Doctor, ActionKind::ProposeReschedule), Some(RescheduleRequested));
        assert_eq!(next_status(Confirmed, Actor::Doctor, ActionKind::Complete), Some(Completed));
        assert_eq!(next_status(Confirmed, Actor::Patient, ActionKind::Cancel), Some(Cancelled));
        assert_eq!(next_status(Confirmed, Actor::Doctor, ActionKind::Cancel), None);
        assert_eq!(next_status(RescheduleRequested, Actor::Patient, ActionKind::AcceptReschedule), Some(Confirmed));
        assert_eq!(next_status(RescheduleRequested, Actor::Patient, ActionKind::DeclineReschedule), Some(Cancelled));
        assert_eq!(next_status(RescheduleRequested, Actor::Doctor, ActionKind::AcceptReschedule), None);
    }

    #[test]
    fn terminal_states_have_no_actions() {
        let terminal: Vec<_> = [
            AppointmentStatus::Pending,
            AppointmentStatus::Confirmed,
            AppointmentStatus::Completed,
            AppointmentStatus::Cancelled,
            AppointmentStatus::RescheduleRequested,
        ]
        .into_iter()
        .filter(AppointmentStatus::is_terminal)
        .collect();
        assert_eq!(terminal, vec![AppointmentStatus::Completed, AppointmentStatus::Cancelled]);

        for status in terminal {
            for actor in [Actor::Doctor, Actor::Patient, Actor::Admin] {
                assert!(available_actions(status, actor).is_empty());
            }
        }
    }

    #[test]
    fn admin_may_act_for_either_party() {
        assert_eq!(
            available_actions(AppointmentStatus::Confirmed, Actor::Admin),
            vec![ActionKind::Cancel, ActionKind::ProposeReschedule, ActionKind::Complete]
        );
        assert_eq!(
            available_actions(AppointmentStatus::Confirmed, Actor::Doctor),
            vec![ActionKind::ProposeReschedule, ActionKind::Complete]
        );
    }

    #[test]
    fn accept_moves_proposal_and_keeps_duration() {
        let original = awaiting_reschedule();
        let now = Utc::now();
        let accepted = apply_action(&original, Actor::Patient, &AppointmentAction::AcceptReschedule, now).unwrap();

        assert_eq!(accepted.status, AppointmentStatus::Confirmed);
        assert_eq!(accepted.date, d(5));
        assert_eq!(accepted.start_time, t(14, 30));
        assert_eq!(accepted.end_time, t(15, 15));
        assert_eq!(accepted.proposed_date, None);
        assert_eq!(accepted.proposed_start_time, None);
        assert_eq!(accepted.updated_at, now);
        assert!(accepted.satisfies_invariants());
    }

    #[test]
    fn decline_requires_reason_and_clears_proposal() {
        let original = awaiting_reschedule();

        let err = apply_action(&original, Actor::Patient, &AppointmentAction::DeclineReschedule { reason: None }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppointmentError::ValidationError(_)));

        let declined = apply_action(&original, Actor::Patient, &AppointmentAction::decline("  moving away "), Utc::now())
            .unwrap();
        assert_eq!(declined.status, AppointmentStatus::Cancelled);
        assert_eq!(declined.cancellation_reason.as_deref(), Some("moving away"));
        assert_eq!(declined.proposed_date, None);
        assert!(declined.satisfies_invariants());
    }

    #[test]
    fn blank_cancellation_reason_is_rejected() {
        let pending = appointment(AppointmentStatus::Pending);
        let err = apply_action(&pending, Actor::Patient, &AppointmentAction::cancel("   "), Utc::now()).unwrap_err();
        assert!(matches!(err, AppointmentError::ValidationError(_)));
    }

    #[test]
    fn state_is_checked_before_payload() {
        let completed = appointment(AppointmentStatus::Completed);
        let err = apply_action(&completed, Actor::Patient, &AppointmentAction::Cancel { reason: None }, Utc::now())
            .unwrap_err();
        assert_eq!(err, AppointmentError::InvalidTransition {
            from: AppointmentStatus::Completed,
            action: ActionKind::Cancel,
        });
    }

    #[test]
    fn proposal_must_fit_before_midnight() {
        let confirmed = appointment(AppointmentStatus::Confirmed);
        let err = apply_action(&confirmed, Actor::Doctor, &AppointmentAction::propose(d(3), t(23, 30)), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AppointmentError::ValidationError(_)));

        let proposed = apply_action(&confirmed, Actor::Doctor, &AppointmentAction::propose(d(3), t(23, 0)), Utc::now())
            .unwrap();
        assert_eq!(proposed.status, AppointmentStatus::RescheduleRequested);
        assert_eq!(proposed.proposed_date, Some(d(3)));
        assert_eq!(proposed.date, d(2));
        assert!(proposed.satisfies_invariants());
    }

    #[test]
    fn proposal_requires_both_fields() {
        let confirmed = appointment(AppointmentStatus::Confirmed);
        let action = AppointmentAction::ProposeReschedule { date: Some(d(3)), start_time: None };
        let err = apply_action(&confirmed, Actor::Doctor, &action, Utc::now()).unwrap_err();
        assert!(matches!(err, AppointmentError::ValidationError(_)));
    }
}
