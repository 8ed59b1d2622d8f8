// libs/appointment-cell/src/router.rs
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
    middleware,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers::{self, AppointmentState};
use crate::services::AppointmentLifecycleManager;

pub fn appointment_routes(config: Arc<AppConfig>, manager: Arc<AppointmentLifecycleManager>) -> Router {
    let state = AppointmentState { manager };

    // All appointment operations require authentication
    let protected_routes = Router::new()
        .route("/", post(handlers::book_appointment))
        .route("/{appointment_id}", get(handlers::get_appointment))
        .route("/{appointment_id}/actions", get(handlers::get_available_actions))

        // Lifecycle transitions
        .route("/{appointment_id}/confirm", post(handlers::confirm_appointment))
        .route("/{appointment_id}/complete", post(handlers::complete_appointment))
        .route("/{appointment_id}/cancel", post(handlers::cancel_appointment))
        .route("/{appointment_id}/reschedule", post(handlers::propose_reschedule))
        .route("/{appointment_id}/reschedule/accept", post(handlers::accept_reschedule))
        .route("/{appointment_id}/reschedule/decline", post(handlers::decline_reschedule))

        // Listings
        .route("/doctors/{doctor_id}", get(handlers::get_doctor_appointments))
        .route("/patients/{patient_id}", get(handlers::get_patient_appointments))

        .route("/conflicts/check", get(handlers::check_appointment_conflicts))

        .layer(middleware::from_fn_with_state(config, auth_middleware));

    Router::new()
        .merge(protected_routes)
        .with_state(state)
}
