use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use sitefleet_infra::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ (QueueError::Conflict { .. } | QueueError::AlreadyExists(_)) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        QueueError::Store(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        QueueError::Dispatch(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "dispatch_unavailable", e.to_string())
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
