use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use pagequeue_infra::queue::EnqueueOutcome;

use crate::app::services::ApiServices;
use crate::app::{dto, errors};

pub async fn enqueue(
    Extension(services): Extension<Arc<ApiServices>>,
    Json(body): Json<dto::EnqueueRequest>,
) -> axum::response::Response {
    let outcome = match services.control.enqueue(body.into_event()).await {
        Ok(outcome) => outcome,
        Err(e) => return errors::queue_error_to_response(e),
    };

    let now = services.now();
    let (status, coalesced) = match &outcome {
        EnqueueOutcome::Created(_) => (StatusCode::CREATED, false),
        EnqueueOutcome::Coalesced(_) => (StatusCode::OK, true),
    };
    let mut body = dto::record_to_json(outcome.record(), now);
    body["coalesced"] = serde_json::Value::Bool(coalesced);
    (status, Json(body)).into_response()
}

pub async fn records(
    Extension(services): Extension<Arc<ApiServices>>,
    Query(query): Query<dto::RecordsQuery>,
) -> axum::response::Response {
    match services.control.find_by_url(&query.url).await {
        Ok(records) => (StatusCode::OK, Json(dto::records_to_json(&records, services.now()))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn pause(
    Extension(services): Extension<Arc<ApiServices>>,
    Json(body): Json<dto::PauseRequest>,
) -> axum::response::Response {
    match services.control.pause(body.paused).await {
        Ok(settings) => (StatusCode::OK, Json(settings)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn set_model_version(
    Extension(services): Extension<Arc<ApiServices>>,
    Json(body): Json<dto::ModelVersionRequest>,
) -> axum::response::Response {
    match services.control.set_model_version(body.version).await {
        Ok(settings) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "model_version": settings.model_version,
                "model_ready": settings.is_model_ready(),
            })),
        )
            .into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

/// Run one scheduler tick now, outside the alarm.
pub async fn tick(Extension(services): Extension<Arc<ApiServices>>) -> axum::response::Response {
    match services.scheduler.tick().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
