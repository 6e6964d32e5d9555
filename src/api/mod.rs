//! HTTP surface over the verification core.

pub mod dto;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

pub use handlers::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/verify", post(handlers::verify))
        .route("/session/start/{class_id}", post(handlers::start_session))
        .route(
            "/session/{session_id}/otp/{student_id}",
            get(handlers::get_otp),
        )
        .route("/otp/resend", post(handlers::resend_otp))
        .route("/session/{session_id}/lock", post(handlers::lock_session))
        .route("/session/{session_id}/unlock", post(handlers::unlock_session))
        .route("/students/{student_id}/unlock", post(handlers::unlock_student))
        .route("/anomalies", get(handlers::list_anomalies))
        .route("/anomalies/{anomaly_id}/review", post(handlers::review_anomaly))
        .route("/classes/{class_id}/enroll", post(handlers::enroll_student))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
