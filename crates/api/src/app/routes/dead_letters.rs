use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::ApiServices;
use crate::app::{dto, errors};

const DEFAULT_LIMIT: usize = 100;

pub fn router() -> Router {
    Router::new()
        .route("/dead-letters", get(list_dead_letters).delete(purge_dead_letters))
        .route("/dead-letters/retry", post(retry_dead_letter))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<ApiServices>>,
    Query(query): Query<dto::LimitQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    match services.control.dead_letters(limit).await {
        Ok(records) => (StatusCode::OK, Json(dto::records_to_json(&records, services.now()))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn retry_dead_letter(
    Extension(services): Extension<Arc<ApiServices>>,
    Json(body): Json<dto::RetryDeadLetterRequest>,
) -> axum::response::Response {
    let key = match body.key() {
        Ok(key) => key,
        Err(e) => return errors::queue_error_to_response(e),
    };
    match services.control.retry_dead_letter(&key).await {
        Ok(record) => (StatusCode::OK, Json(dto::record_to_json(&record, services.now()))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn purge_dead_letters(Extension(services): Extension<Arc<ApiServices>>) -> axum::response::Response {
    match services.control.purge_dead_letters().await {
        Ok(removed) => (StatusCode::OK, Json(serde_json::json!({ "removed": removed }))).into_response(),
        Err(e) => errors::queue_error_to_response(e),
    }
}
