use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::app::errors;
use crate::app::services::ApiServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn settings(Extension(services): Extension<Arc<ApiServices>>) -> axum::response::Response {
    match services.control.settings().await {
        Ok(settings) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "paused": settings.paused,
                "model_version": settings.model_version,
                "model_ready": settings.is_model_ready(),
                "alarm_running": services.alarm.is_running(),
            })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn stats(Extension(services): Extension<Arc<ApiServices>>) -> axum::response::Response {
    match services.control.stats().await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
