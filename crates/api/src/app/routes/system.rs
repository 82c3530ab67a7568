use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::{errors, services::AppServices};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// GET /sync/stats
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.coordinator.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /sync/sweep: one sweeper pass (retries, watchdog, escalation catch-up), on demand.
pub async fn sweep(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.coordinator.sweep_once(&services.sweeper).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
