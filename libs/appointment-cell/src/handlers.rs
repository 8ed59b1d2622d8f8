// libs/appointment-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    Json,
};
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use shared_models::auth::User;
use shared_models::error::AppError;
use shared_utils::extractor::{ApiJson, ApiPath, ApiQuery};

use crate::models::{
    Actor, Appointment, AppointmentAction, AppointmentError, AppointmentQuery, AppointmentStatus,
    BookAppointmentRequest, CancelAppointmentRequest, ProposeRescheduleRequest,
};
use crate::services::lifecycle::available_actions;
use crate::services::AppointmentLifecycleManager;

#[derive(Clone)]
pub struct AppointmentState {
    pub manager: Arc<AppointmentLifecycleManager>,
}

impl From<AppointmentError> for AppError {
    fn from(error: AppointmentError) -> Self {
        let message = error.to_string();
        match error {
            AppointmentError::NotFound(_) => AppError::NotFound(message),
            AppointmentError::InvalidTransition { .. } => AppError::Conflict(message),
            AppointmentError::SlotConflict { .. } => AppError::Conflict(message),
            AppointmentError::ValidationError(msg) => AppError::ValidationError(msg),
            AppointmentError::Busy { .. } => AppError::Busy(message),
            AppointmentError::DatabaseError(msg) => AppError::Database(msg),
        }
    }
}

// ==============================================================================
// QUERY PARAMETER STRUCTS
// ==============================================================================

#[derive(Debug, Deserialize)]
pub struct DoctorAppointmentsQuery {
    pub date: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct PatientAppointmentsQuery {
    pub status: Option<AppointmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ConflictCheckQuery {
    pub doctor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub exclude_appointment_id: Option<Uuid>,
}

// ==============================================================================
// AUTHORIZATION HELPERS
// ==============================================================================

fn user_uuid(user: &User) -> Option<Uuid> {
    Uuid::parse_str(&user.id).ok()
}

/// Maps the caller onto the party they act as for this appointment. Only the
/// appointment's doctor, its patient, or an admin may act on it.
fn resolve_actor(user: &User, appointment: &Appointment) -> Result<Actor, AppError> {
    let user_id = user_uuid(user);

    if user_id == Some(appointment.doctor_id) {
        Ok(Actor::Doctor)
    } else if user_id == Some(appointment.patient_id) {
        Ok(Actor::Patient)
    } else if user.is_admin() {
        Ok(Actor::Admin)
    } else {
        Err(AppError::Forbidden("Not authorized to act on this appointment".to_string()))
    }
}

fn ensure_self_or_admin(user: &User, subject_id: Uuid, what: &str) -> Result<(), AppError> {
    if user_uuid(user) == Some(subject_id) || user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!("Not authorized to view {}", what)))
    }
}

/// Cancel and decline bodies may be omitted entirely; the missing reason is
/// then reported by the lifecycle as a validation error.
fn optional_reason(
    body: Result<Option<Json<CancelAppointmentRequest>>, JsonRejection>,
) -> Result<Option<String>, AppError> {
    Ok(body?.and_then(|Json(request)| request.reason))
}

async fn run_transition(
    state: &AppointmentState,
    user: &User,
    appointment_id: Uuid,
    action: AppointmentAction,
    message: &str,
) -> Result<Json<Value>, AppError> {
    let appointment = state.manager.get(appointment_id).await?;
    let actor = resolve_actor(user, &appointment)?;
    debug!("User {} acting as {} on appointment {}", user.id, actor, appointment_id);

    let updated = state.manager.transition(appointment_id, actor, action).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": updated,
        "message": message
    })))
}

// ==============================================================================
// BOOKING AND LOOKUP HANDLERS
// ==============================================================================

pub async fn book_appointment(
    State(state): State<AppointmentState>,
    Extension(user): Extension<User>,
    ApiJson(request): ApiJson<BookAppointmentRequest>,
) -> Result<Json<Value>, AppError> {
    // Patients book for themselves; doctors may book into their own calendar
    let user_id = user_uuid(&user);
    let is_patient = user_id == Some(request.patient_id);
    let is_doctor = user_id == Some(request.doctor_id);

    if !is_patient && !is_doctor && !user.is_admin() {
        return Err(AppError::Forbidden("Not authorized to book appointment for this patient".to_string()));
    }

    let appointment = state.manager.book(request).await?;

    Ok(Json(json!({
        "success": true,
        "appointment": appointment,
        "message": "Appointment requested, awaiting doctor confirmation"
    })))
}

pub async fn get_appointment(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.manager.get(appointment_id).await?;
    resolve_actor(&user, &appointment)?;

    Ok(Json(json!(appointment)))
}

pub async fn get_available_actions(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let appointment = state.manager.get(appointment_id).await?;
    let actor = resolve_actor(&user, &appointment)?;

    Ok(Json(json!({
        "appointment_id": appointment.id,
        "status": appointment.status,
        "actor": actor,
        "actions": available_actions(appointment.status, actor)
    })))
}

pub async fn get_doctor_appointments(
    State(state): State<AppointmentState>,
    ApiPath(doctor_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<DoctorAppointmentsQuery>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    ensure_self_or_admin(&user, doctor_id, "this doctor's appointments")?;

    let appointments = state.manager.list(&AppointmentQuery {
        doctor_id: Some(doctor_id),
        date: params.date,
        status: params.status,
        ..Default::default()
    }).await?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

pub async fn get_patient_appointments(
    State(state): State<AppointmentState>,
    ApiPath(patient_id): ApiPath<Uuid>,
    ApiQuery(params): ApiQuery<PatientAppointmentsQuery>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    ensure_self_or_admin(&user, patient_id, "this patient's appointments")?;

    let appointments = state.manager.list(&AppointmentQuery {
        patient_id: Some(patient_id),
        status: params.status,
        ..Default::default()
    }).await?;

    Ok(Json(json!({
        "appointments": appointments,
        "total": appointments.len()
    })))
}

pub async fn check_appointment_conflicts(
    State(state): State<AppointmentState>,
    ApiQuery(params): ApiQuery<ConflictCheckQuery>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    ensure_self_or_admin(&user, params.doctor_id, "this doctor's schedule")?;

    let response = state.manager.check_conflicts(
        params.doctor_id,
        params.date,
        params.start_time,
        params.end_time,
        params.exclude_appointment_id,
    ).await?;

    Ok(Json(json!(response)))
}

// ==============================================================================
// LIFECYCLE TRANSITION HANDLERS
// ==============================================================================

pub async fn confirm_appointment(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id, AppointmentAction::Confirm,
                   "Appointment confirmed").await
}

pub async fn complete_appointment(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id, AppointmentAction::Complete,
                   "Appointment marked as completed").await
}

pub async fn cancel_appointment(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
    body: Result<Option<Json<CancelAppointmentRequest>>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id,
                   AppointmentAction::Cancel { reason: optional_reason(body)? },
                   "Appointment cancelled").await
}

pub async fn propose_reschedule(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
    ApiJson(request): ApiJson<ProposeRescheduleRequest>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id, request.into(),
                   "Reschedule proposed, awaiting patient response").await
}

pub async fn accept_reschedule(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id, AppointmentAction::AcceptReschedule,
                   "Reschedule accepted, appointment confirmed for the new slot").await
}

pub async fn decline_reschedule(
    State(state): State<AppointmentState>,
    ApiPath(appointment_id): ApiPath<Uuid>,
    Extension(user): Extension<User>,
    body: Result<Option<Json<CancelAppointmentRequest>>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    run_transition(&state, &user, appointment_id,
                   AppointmentAction::DeclineReschedule { reason: optional_reason(body)? },
                   "Reschedule declined, appointment cancelled").await
}
