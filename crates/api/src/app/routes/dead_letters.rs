//! Dead-letter triage: list quarantined operations and close them out.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use marketsync_core::DeadLetterId;

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id", get(get_dead_letter).delete(remove_dead_letter))
}

/// GET /sync/dead-letters?limit=50&offset=0 (most recent first)
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::PageQuery>,
) -> axum::response::Response {
    match services.coordinator.dead_letters(query.pagination()).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: DeadLetterId = match errors::parse_id(&id, "dead-letter") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.coordinator.dead_letter(id).await {
        Ok(entry) => (StatusCode::OK, Json(entry)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// DELETE /sync/dead-letters/:id
///
/// An unknown id answers `{"removed": false}` rather than 404.
pub async fn remove_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: DeadLetterId = match errors::parse_id(&id, "dead-letter") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.coordinator.remove_dead_letter(id).await {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
