use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use appointment_cell::router::appointment_routes;
use appointment_cell::services::AppointmentLifecycleManager;
use shared_config::AppConfig;

pub fn create_router(config: Arc<AppConfig>, manager: Arc<AppointmentLifecycleManager>) -> Router {
    Router::new()
        .route("/", get(|| async { "Clinic appointment API is running!" }))
        .nest("/appointments", appointment_routes(config, manager))
}
