//! Operation log endpoints: submit, inspect, and manually retry.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use marketsync_core::OperationId;
use marketsync_pipeline::SubmitRequest;

use crate::app::{dto, errors, services::AppServices};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_operation).get(list_operations))
        .route("/:id", get(get_operation))
        .route("/:id/retry", post(retry_operation))
}

/// POST /sync/operations
///
/// Creates the record and makes the first attempt before answering, so the
/// response already carries an outcome.
pub async fn submit_operation(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(request) = match body {
        Ok(b) => b,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", e.body_text()),
    };

    match services.coordinator.submit(request).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /sync/operations?state=failed_retrying&kind=update_price&limit=50&offset=0
pub async fn list_operations(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListOperationsQuery>,
) -> axum::response::Response {
    let filter = match query.filter() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match services.coordinator.list(filter, query.pagination()).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn get_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: OperationId = match errors::parse_id(&id, "operation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.coordinator.get(id).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /sync/operations/:id/retry[?early=defer]
///
/// Exhausting the budget is not an error; the response is the record in
/// whatever state the attempt left it.
pub async fn retry_operation(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::RetryQuery>,
) -> axum::response::Response {
    let id: OperationId = match errors::parse_id(&id, "operation") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let outcome = match query.early {
        Some(early) => services.coordinator.retry_with(id, early).await,
        None => services.coordinator.retry(id).await,
    };

    match outcome {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
