use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use pagequeue_core::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Paused => json_error(StatusCode::CONFLICT, "paused", "processing is paused"),
        QueueError::InvalidEvent(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_event", msg),
        QueueError::InvalidKey(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_key", msg),
        QueueError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        QueueError::Store(msg) => {
            tracing::error!(error = %msg, "queue store failure");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg)
        }
        QueueError::Config(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
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
