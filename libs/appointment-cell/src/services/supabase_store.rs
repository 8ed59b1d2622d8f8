// libs/appointment-cell/src/services/supabase_store.rs
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use reqwest::Method;
use tracing::{debug, error};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::{SupabaseClient, PREFER_RETURN_REPRESENTATION};

use crate::models::{Appointment, AppointmentPatch, AppointmentQuery, AppointmentStatus};
use crate::services::store::{AppointmentStore, StoreError};

const APPOINTMENTS_PATH: &str = "/rest/v1/appointments";

/// PostgREST-backed store. Authenticates with the service-role key; callers
/// are expected to have authorized the request already.
pub struct SupabaseAppointmentStore {
    supabase: SupabaseClient,
}

impl SupabaseAppointmentStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::service_role(config),
        }
    }

    async fn fetch(&self, path: &str) -> Result<Vec<Appointment>, StoreError> {
        self.supabase
            .request::<Vec<Appointment>>(Method::GET, path, Some(self.supabase.api_key()), None)
            .await
            .map_err(backend_error)
    }
}

fn backend_error(e: anyhow::Error) -> StoreError {
    error!("Appointment store request failed: {}", e);
    StoreError::Backend(e.to_string())
}

fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

fn query_filters(query: &AppointmentQuery) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(doctor_id) = query.doctor_id {
        parts.push(format!("doctor_id=eq.{}", doctor_id));
    }
    if let Some(patient_id) = query.patient_id {
        parts.push(format!("patient_id=eq.{}", patient_id));
    }
    if let Some(date) = query.date {
        parts.push(format!("date=eq.{}", date));
    }
    if let Some(status) = query.status {
        parts.push(format!("status=eq.{}", status));
    }
    parts
}

#[async_trait]
impl AppointmentStore for SupabaseAppointmentStore {
    async fn insert_appointment(&self, appointment: Appointment) -> Result<Appointment, StoreError> {
        let body = serde_json::to_value(&appointment)
            .map_err(|e| StoreError::Backend(format!("Failed to serialize appointment: {}", e)))?;

        let created: Vec<Appointment> = self.supabase
            .request_with_headers(
                Method::POST,
                APPOINTMENTS_PATH,
                Some(self.supabase.api_key()),
                Some(body),
                &[PREFER_RETURN_REPRESENTATION],
            )
            .await
            .map_err(backend_error)?;

        created
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend("Insert returned no rows".to_string()))
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Appointment, StoreError> {
        let path = format!("{}?id=eq.{}&limit=1", APPOINTMENTS_PATH, id);
        self.fetch(&path)
            .await?
            .into_iter()
            .next()
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
        let path = format!(
            "{}?doctor_id=eq.{}&date=eq.{}&status=eq.{}&start_time=lt.{}&end_time=gt.{}&order=start_time.asc",
            APPOINTMENTS_PATH,
            doctor_id,
            date,
            status,
            format_time(end_time),
            format_time(start_time),
        );
        debug!("Listing {} appointments overlapping {}-{} for doctor {} on {}",
               status, start_time, end_time, doctor_id, date);
        self.fetch(&path).await
    }

    async fn list_appointments(&self, query: &AppointmentQuery) -> Result<Vec<Appointment>, StoreError> {
        let mut parts = query_filters(query);
        parts.push("order=date.asc,start_time.asc".to_string());
        let path = format!("{}?{}", APPOINTMENTS_PATH, parts.join("&"));
        self.fetch(&path).await
    }

    async fn update_appointment(&self, id: Uuid, patch: AppointmentPatch) -> Result<Appointment, StoreError> {
        // Conditional on the status read by the caller, so the row is only
        // written if no other transition committed in between.
        let expected_status = patch.expected_status;
        let path = format!("{}?id=eq.{}&status=eq.{}", APPOINTMENTS_PATH, id, expected_status);
        let body = serde_json::to_value(&patch)
            .map_err(|e| StoreError::Backend(format!("Failed to serialize patch: {}", e)))?;

        let updated: Vec<Appointment> = self.supabase
            .request_with_headers(
                Method::PATCH,
                &path,
                Some(self.supabase.api_key()),
                Some(body),
                &[PREFER_RETURN_REPRESENTATION],
            )
            .await
            .map_err(backend_error)?;

        if let Some(appointment) = updated.into_iter().next() {
            return Ok(appointment);
        }

        // Nothing matched: the row is gone, its status moved on, or the filter
        // was refused by the backend (row-level security).
        let current = self.get_appointment(id).await?;
        if current.status == expected_status {
            error!("Conditional update of appointment {} matched no rows while still {}", id, expected_status);
            return Err(StoreError::Backend(format!(
                "Update of appointment {} was not applied", id
            )));
        }
        Err(StoreError::StatusChanged { current: current.status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_include_only_set_fields() {
        let doctor_id = Uuid::new_v4();
        let query = AppointmentQuery {
            doctor_id: Some(doctor_id),
            status: Some(AppointmentStatus::RescheduleRequested),
            ..Default::default()
        };

        assert_eq!(
            query_filters(&query),
            vec![
                format!("doctor_id=eq.{}", doctor_id),
                "status=eq.reschedule_requested".to_string(),
            ]
        );
    }

    #[test]
    fn times_are_formatted_with_seconds() {
        let time = NaiveTime::from_hms_opt(9, 5, 0).unwrap();
        assert_eq!(format_time(time), "09:05:00");
    }
}
