// libs/appointment-cell/src/services/conflict.rs
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Appointment, AppointmentError, AppointmentStatus, ConflictCheckResponse};
use crate::services::store::{AppointmentStore, StoreError};

/// Two windows overlap if `start1 < end2 AND start2 < end1`; windows that
/// only touch at an endpoint are free of each other.
pub fn windows_overlap(start1: NaiveTime, end1: NaiveTime, start2: NaiveTime, end2: NaiveTime) -> bool {
    start1 < end2 && start2 < end1
}

pub(crate) fn store_error(id: Uuid, error: StoreError) -> AppointmentError {
    match error {
        StoreError::NotFound => AppointmentError::NotFound(id),
        other => AppointmentError::DatabaseError(other.to_string()),
    }
}

/// Applies the booking priority policy: the first confirmed appointment in a
/// window holds it, and nothing else may be confirmed over it.
pub struct ConflictDetectionService {
    store: Arc<dyn AppointmentStore>,
}

impl ConflictDetectionService {
    pub fn new(store: Arc<dyn AppointmentStore>) -> Self {
        Self { store }
    }

    /// Confirmed appointments of the doctor that overlap the window, other
    /// than `exclude_appointment_id`.
    pub async fn find_confirmed_overlaps(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<Vec<Appointment>, AppointmentError> {
        debug!("Checking confirmed overlaps for doctor {} on {} {}-{}",
               doctor_id, date, start_time, end_time);

        let candidates = self.store
            .list_overlapping(doctor_id, date, start_time, end_time, AppointmentStatus::Confirmed)
            .await
            .map_err(|e| AppointmentError::DatabaseError(e.to_string()))?;

        Ok(candidates
            .into_iter()
            .filter(|a| Some(a.id) != exclude_appointment_id)
            .filter(|a| a.status == AppointmentStatus::Confirmed)
            .filter(|a| windows_overlap(start_time, end_time, a.start_time, a.end_time))
            .collect())
    }

    pub async fn check_conflicts(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        exclude_appointment_id: Option<Uuid>,
    ) -> Result<ConflictCheckResponse, AppointmentError> {
        if end_time <= start_time {
            return Err(AppointmentError::ValidationError(
                "end_time must be after start_time".to_string(),
            ));
        }

        let conflicting_appointments = self
            .find_confirmed_overlaps(doctor_id, date, start_time, end_time, exclude_appointment_id)
            .await?;

        Ok(ConflictCheckResponse {
            has_conflict: !conflicting_appointments.is_empty(),
            conflicting_appointments,
        })
    }

    /// Fails with `SlotConflict` naming the earliest blocking appointment if
    /// `candidate`'s window is already held by a confirmed booking.
    pub async fn ensure_slot_free(&self, candidate: &Appointment) -> Result<(), AppointmentError> {
        let blocking = self
            .find_confirmed_overlaps(
                candidate.doctor_id,
                candidate.date,
                candidate.start_time,
                candidate.end_time,
                Some(candidate.id),
            )
            .await?;

        match blocking.first() {
            Some(blocker) => {
                warn!("Appointment {} blocked by confirmed appointment {} for doctor {} on {}",
                      candidate.id, blocker.id, candidate.doctor_id, candidate.date);
                Err(AppointmentError::SlotConflict { blocking_id: blocker.id })
            }
            None => Ok(()),
        }
    }
}
