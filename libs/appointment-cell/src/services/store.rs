// libs/appointment-cell/src/services/store.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Appointment, AppointmentPatch, AppointmentQuery, AppointmentStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Appointment not found")]
    NotFound,

    /// The conditional update lost a race: the row no longer has the status
    /// the caller read.
    #[error("Appointment status changed concurrently, now {current}")]
    StatusChanged { current: AppointmentStatus },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence contract for appointments. Implementations must apply
/// `update_appointment` atomically.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn get_appointment(&self, id: Uuid) -> Result<Appointment, StoreError>;

    /// Appointments of `doctor_id` on `date` in `status` whose window overlaps
    /// `[start_time, end_time)`, ordered by start time.
    async fn list_overlapping(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        status: AppointmentStatus,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn list_appointments(&self, query: &AppointmentQuery) -> Result<Vec<Appointment>, StoreError>;

    async fn update_appointment(&self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, StoreError>;
}

/// Process-local store. Backs the test suites and the API when no database
/// is configured.
#[derive(Default)]
pub struct InMemoryAppointmentStore {
    appointments: RwLock<HashMap<Uuid, Appointment>>,
}

impl InMemoryAppointmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_appointments(appointments: impl IntoIterator<Item = Appointment>) -> Self {
        Self {
            appointments: RwLock::new(appointments.into_iter().map(|a| (a.id, a)).collect()),
        }
    }

    pub async fn len(&self) -> usize {
        self.appointments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.appointments.read().await.is_empty()
    }
}

fn matches_query(appointment: &Appointment, query: &AppointmentQuery) -> bool {
    query.doctor_id.map_or(true, |id| appointment.doctor_id == id)
        && query.patient_id.map_or(true, |id| appointment.patient_id == id)
        && query.date.map_or(true, |date| appointment.date == date)
        && query.status.map_or(true, |status| appointment.status == status)
}

#[async_trait]
impl AppointmentStore for InMemoryAppointmentStore {
    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;
        if appointments.contains_key(&appointment.id) {
            return Err(StoreError::Backend(format!("duplicate appointment id {}", appointment.id)));
        }
        appointments.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Appointment, StoreError> {
        self.appointments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_overlapping(
        &self,
        doctor_id: Uuid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        status: AppointmentStatus,
    ) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let mut overlapping: Vec<Appointment> = appointments
            .values()
            .filter(|a| a.doctor_id == doctor_id && a.date == date && a.status == status)
            .filter(|a| a.overlaps(start_time, end_time))
            .cloned()
            .collect();
        overlapping.sort_by_key(|a| (a.start_time, a.created_at));
        Ok(overlapping)
    }

    async fn list_appointments(&self, query: &AppointmentQuery) -> Result<Vec<Appointment>, StoreError> {
        let appointments = self.appointments.read().await;
        let mut matching: Vec<Appointment> = appointments
            .values()
            .filter(|a| matches_query(a, query))
            .cloned()
            .collect();
        matching.sort_by_key(|a| (a.date, a.start_time, a.created_at));
        Ok(matching)
    }

    async fn update_appointment(&self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, StoreError> {
        let mut appointments = self.appointments.write().await;
        let appointment = appointments.get_mut(&id).ok_or(StoreError::NotFound)?;

        if appointment.status != patch.expected_status {
            debug!(
                "Rejecting update of {}: expected {}, found {}",
                id, patch.expected_status, appointment.status
            );
            return Err(StoreError::StatusChanged { current: appointment.status });
        }

        patch.apply_to(appointment);
        Ok(appointment.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn appointment(doctor_id: Uuid, start: u32, end: u32, status: AppointmentStatus) -> Appointment {
        let now = Utc::now();
        Appointment {
            id: Uuid::new_v4(),
            doctor_id,
            patient_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            start_time: NaiveTime::from_hms_opt(start, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end, 0, 0).unwrap(),
            status,
            proposed_date: None,
            proposed_start_time: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn update_applies_when_status_matches() {
        let original = appointment(Uuid::new_v4(), 9, 10, AppointmentStatus::Pending);
        let store = InMemoryAppointmentStore::with_appointments([original.clone()]);

        let mut confirmed = original.clone();
        confirmed.status = AppointmentStatus::Confirmed;
        let patch = AppointmentPatch::from_transition(AppointmentStatus::Pending, &confirmed);

        let stored = store.update_appointment(original.id, patch).await.unwrap();
        assert_eq!(stored.status, AppointmentStatus::Confirmed);
        assert_eq!(store.get_appointment(original.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn stale_update_is_rejected_without_changes() {
        let original = appointment(Uuid::new_v4(), 9, 10, AppointmentStatus::Confirmed);
        let store = InMemoryAppointmentStore::with_appointments([original.clone()]);

        let mut cancelled = original.clone();
        cancelled.status = AppointmentStatus::Cancelled;
        cancelled.cancellation_reason = Some("ill".to_string());
        let patch = AppointmentPatch::from_transition(AppointmentStatus::Pending, &cancelled);

        let err = store.update_appointment(original.id, patch).await.unwrap_err();
        assert_eq!(err, StoreError::StatusChanged { current: AppointmentStatus::Confirmed });
        assert_eq!(store.get_appointment(original.id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn list_overlapping_filters_status_and_window() {
        let doctor_id = Uuid::new_v4();
        let confirmed = appointment(doctor_id, 9, 10, AppointmentStatus::Confirmed);
        let pending = appointment(doctor_id, 9, 10, AppointmentStatus::Pending);
        let later = appointment(doctor_id, 10, 11, AppointmentStatus::Confirmed);
        let other_doctor = appointment(Uuid::new_v4(), 9, 10, AppointmentStatus::Confirmed);
        let store = InMemoryAppointmentStore::with_appointments([
            confirmed.clone(),
            pending,
            later,
            other_doctor,
        ]);

        let found = store
            .list_overlapping(
                doctor_id,
                confirmed.date,
                NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                AppointmentStatus::Confirmed,
            )
            .await
            .unwrap();

        assert_eq!(found, vec![confirmed]);
    }

    #[tokio::test]
    async fn missing_appointment_is_not_found() {
        let store = InMemoryAppointmentStore::new();
        assert!(store.is_empty().await);
        assert_eq!(store.get_appointment(Uuid::new_v4()).await, Err(StoreError::NotFound));
    }
}
