// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc, NaiveDate, NaiveTime, Duration};
use std::fmt;

// ==============================================================================
// CORE APPOINTMENT MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: AppointmentStatus,
    /// Doctor-proposed alternative slot, only present while `reschedule_requested`.
    pub proposed_date: Option<NaiveDate>,
    pub proposed_start_time: Option<NaiveTime>,
    /// Only present once `cancelled`.
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Half-open overlap: windows that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, start_time: NaiveTime, end_time: NaiveTime) -> bool {
        self.start_time < end_time && start_time < self.end_time
    }

    /// Checks the status-dependent field rules and the time window.
    pub fn satisfies_invariants(&self) -> bool {
        let reschedule_fields_ok = match self.status {
            AppointmentStatus::RescheduleRequested => {
                self.proposed_date.is_some() && self.proposed_start_time.is_some()
            }
            _ => self.proposed_date.is_none() && self.proposed_start_time.is_none(),
        };
        let cancellation_ok = (self.status == AppointmentStatus::Cancelled)
            == self.cancellation_reason.is_some();

        reschedule_fields_ok && cancellation_ok && self.end_time > self.start_time
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    RescheduleRequested,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::RescheduleRequested => "reschedule_requested",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is driving a transition. The caller establishes this after its own
/// authorization check; the state machine only uses it to pick the row of the
/// transition table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Doctor,
    Patient,
    Admin,
}

impl Actor {
    /// Admins may act in place of either party.
    pub fn acts_as(&self, party: Actor) -> bool {
        *self == Actor::Admin || *self == party
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Doctor => write!(f, "doctor"),
            Actor::Patient => write!(f, "patient"),
            Actor::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Confirm,
    Cancel,
    ProposeReschedule,
    Complete,
    AcceptReschedule,
    DeclineReschedule,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::Confirm,
        ActionKind::Cancel,
        ActionKind::ProposeReschedule,
        ActionKind::Complete,
        ActionKind::AcceptReschedule,
        ActionKind::DeclineReschedule,
    ];

    /// Actions that put the appointment into a confirmed slot and therefore
    /// go through the conflict policy.
    pub fn claims_slot(&self) -> bool {
        matches!(self, ActionKind::Confirm | ActionKind::AcceptReschedule)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Confirm => write!(f, "confirm"),
            ActionKind::Cancel => write!(f, "cancel"),
            ActionKind::ProposeReschedule => write!(f, "propose a reschedule for"),
            ActionKind::Complete => write!(f, "complete"),
            ActionKind::AcceptReschedule => write!(f, "accept a reschedule for"),
            ActionKind::DeclineReschedule => write!(f, "decline a reschedule for"),
        }
    }
}

/// A requested transition with its payload. Payload fields are optional here
/// and checked by the lifecycle manager once the transition itself is known
/// to be legal.
#[derive(Debug, Clone, PartialEq)]
pub enum AppointmentAction {
    Confirm,
    Cancel { reason: Option<String> },
    ProposeReschedule { date: Option<NaiveDate>, start_time: Option<NaiveTime> },
    Complete,
    AcceptReschedule,
    DeclineReschedule { reason: Option<String> },
}

impl AppointmentAction {
    pub fn cancel(reason: impl Into<String>) -> Self {
        AppointmentAction::Cancel { reason: Some(reason.into()) }
    }

    pub fn propose(date: NaiveDate, start_time: NaiveTime) -> Self {
        AppointmentAction::ProposeReschedule { date: Some(date), start_time: Some(start_time) }
    }

    pub fn decline(reason: impl Into<String>) -> Self {
        AppointmentAction::DeclineReschedule { reason: Some(reason.into()) }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            AppointmentAction::Confirm => ActionKind::Confirm,
            AppointmentAction::Cancel { .. } => ActionKind::Cancel,
            AppointmentAction::ProposeReschedule { .. } => ActionKind::ProposeReschedule,
            AppointmentAction::Complete => ActionKind::Complete,
            AppointmentAction::AcceptReschedule => ActionKind::AcceptReschedule,
            AppointmentAction::DeclineReschedule { .. } => ActionKind::DeclineReschedule,
        }
    }
}

// ==============================================================================
// PERSISTENCE MODELS
// ==============================================================================

/// Full replacement of an appointment's mutable columns, applied only if the
/// stored status still equals `expected_status`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AppointmentPatch {
    #[serde(skip)]
    pub expected_status: AppointmentStatus,
    pub status: AppointmentStatus,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub proposed_date: Option<NaiveDate>,
    pub proposed_start_time: Option<NaiveTime>,
    pub cancellation_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AppointmentPatch {
    pub fn from_transition(expected_status: AppointmentStatus, updated: &Appointment) -> Self {
        Self {
            expected_status,
            status: updated.status,
            date: updated.date,
            start_time: updated.start_time,
            end_time: updated.end_time,
            proposed_date: updated.proposed_date,
            proposed_start_time: updated.proposed_start_time,
            cancellation_reason: updated.cancellation_reason.clone(),
            updated_at: updated.updated_at,
        }
    }

    pub fn apply_to(&self, appointment: &mut Appointment) {
        appointment.status = self.status;
        appointment.date = self.date;
        appointment.start_time = self.start_time;
        appointment.end_time = self.end_time;
        appointment.proposed_date = self.proposed_date;
        appointment.proposed_start_time = self.proposed_start_time;
        appointment.cancellation_reason = self.cancellation_reason.clone();
        appointment.updated_at = self.updated_at;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppointmentQuery {
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
    pub status: Option<AppointmentStatus>,
}

// ==============================================================================
// REQUEST/RESPONSE MODELS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookAppointmentRequest {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAppointmentRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposeRescheduleRequest {
    pub proposed_date: Option<NaiveDate>,
    pub proposed_start_time: Option<NaiveTime>,
}

impl From<ProposeRescheduleRequest> for AppointmentAction {
    fn from(request: ProposeRescheduleRequest) -> Self {
        AppointmentAction::ProposeReschedule {
            date: request.proposed_date,
            start_time: request.proposed_start_time,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictCheckResponse {
    pub has_conflict: bool,
    pub conflicting_appointments: Vec<Appointment>,
}

// ==============================================================================
// ERROR TYPES
// ==============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AppointmentError {
    #[error("Appointment {0} not found")]
    NotFound(Uuid),

    #[error("Cannot {action} an appointment that is {from}")]
    InvalidTransition { from: AppointmentStatus, action: ActionKind },

    #[error("Slot conflicts with confirmed appointment {blocking_id}")]
    SlotConflict { blocking_id: Uuid },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Schedule for doctor {doctor_id} on {date} is busy, retry shortly")]
    Busy { doctor_id: Uuid, date: NaiveDate },

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl AppointmentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppointmentError::Busy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(start: (u32, u32), end: (u32, u32)) -> Appointment {
        let now = Utc::now();
        Appointment {
            id: Uuid::new_v4(),
            doctor_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
            start_time: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            status: AppointmentStatus::Pending,
            proposed_date: None,
            proposed_start_time: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AppointmentStatus::RescheduleRequested).unwrap();
        assert_eq!(json, "\"reschedule_requested\"");
        let parsed: AppointmentStatus = serde_json::from_str("\"confirmed\"").unwrap();
        assert_eq!(parsed, AppointmentStatus::Confirmed);
    }

    #[test]
    fn touching_windows_do_not_overlap() {
        let morning = slot((9, 0), (9, 30));
        assert!(!morning.overlaps(
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        ));
        assert!(morning.overlaps(
            NaiveTime::from_hms_opt(9, 29, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        ));
    }

    #[test]
    fn invariants_track_status_fields() {
        let mut appointment = slot((9, 0), (9, 30));
        assert!(appointment.satisfies_invariants());

        appointment.cancellation_reason = Some("stray".to_string());
        assert!(!appointment.satisfies_invariants());

        appointment.status = AppointmentStatus::Cancelled;
        assert!(appointment.satisfies_invariants());

        appointment.status = AppointmentStatus::RescheduleRequested;
        appointment.cancellation_reason = None;
        assert!(!appointment.satisfies_invariants());
    }

    #[test]
    fn patch_serialization_skips_expected_status() {
        let appointment = slot((9, 0), (9, 30));
        let patch = AppointmentPatch::from_transition(AppointmentStatus::Pending, &appointment);
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json.get("expected_status").is_none());
        assert_eq!(json["status"], "pending");
        assert!(json["proposed_date"].is_null());
    }

    #[test]
    fn only_busy_is_retryable() {
        let busy = AppointmentError::Busy {
            doctor_id: Uuid::new_v4(),
            date: NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        };
        assert!(busy.is_retryable());
        assert!(!AppointmentError::SlotConflict { blocking_id: Uuid::new_v4() }.is_retryable());
        assert!(!AppointmentError::NotFound(Uuid::new_v4()).is_retryable());
    }
}
