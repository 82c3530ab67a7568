use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use marketsync_pipeline::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        PipelineError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        PipelineError::OperationNotFound(_) | PipelineError::DeadLetterNotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", message)
        }
        PipelineError::PreconditionFailed(_) => {
            json_error(StatusCode::CONFLICT, "precondition_failed", message)
        }
        PipelineError::ConcurrentAttempt(_) => {
            json_error(StatusCode::CONFLICT, "concurrent_attempt", message)
        }
        PipelineError::TooEarly { retry_at, .. } => (
            StatusCode::TOO_EARLY,
            axum::Json(json!({
                "error": "too_early",
                "message": message,
                "retry_at": retry_at,
            })),
        )
            .into_response(),
        PipelineError::Storage(_) => {
            tracing::error!(error = %message, "storage failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path id, answering 400 for malformed input.
pub fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id")))
}
