use axum::{
    routing::{get, post},
    Router,
};

pub mod dead_letters;
pub mod queue;
pub mod system;

/// Router for all queue endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/settings", get(system::settings))
        .route("/stats", get(system::stats))
        .route("/pause", post(queue::pause))
        .route("/model", post(queue::set_model_version))
        .route("/queue", post(queue::enqueue))
        .route("/records", get(queue::records))
        .route("/tick", post(queue::tick))
        .merge(dead_letters::router())
}
