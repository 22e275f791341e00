//! External worker channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::types::{DispatchResult, QueueRecord};

/// Client for the worker that processes queue records (extraction, embedding).
///
/// The worker may disappear between ticks; implementations report that as a
/// retriable failure rather than an error.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn dispatch(&self, record: &QueueRecord) -> DispatchResult;
}

#[async_trait]
impl<T: WorkerClient + ?Sized> WorkerClient for Arc<T> {
    async fn dispatch(&self, record: &QueueRecord) -> DispatchResult {
        (**self).dispatch(record).await
    }
}

/// Request body posted to the worker.
#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    id: &'a str,
    url: &'a str,
    title: &'a str,
    payload: &'a Value,
    attempt: u32,
}

/// Optional response body from the worker.
#[derive(Debug, Deserialize)]
struct DispatchResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    retriable: Option<bool>,
}

/// Worker reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpWorkerClient {
    /// Client posting records to `endpoint`, giving up on each request after `timeout`.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build worker HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn dispatch(&self, record: &QueueRecord) -> DispatchResult {
        let body = DispatchRequest {
            id: record.id.as_str(),
            url: &record.url,
            title: &record.title,
            payload: &record.payload,
            attempt: record.attempt,
        };

        let response = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(record = %record.id, error = %err, "worker unreachable");
                return DispatchResult::retriable(format!("worker unavailable: {err}"));
            }
        };

        let status = response.status();
        let parsed = response.json::<DispatchResponse>().await.ok();
        classify(status, parsed)
    }
}

/// Retriable unless the worker says the request itself was wrong.
fn status_is_retriable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn classify(status: StatusCode, body: Option<DispatchResponse>) -> DispatchResult {
    match body {
        Some(body) if body.success && status.is_success() => DispatchResult::Success,
        Some(body) => DispatchResult::Failure {
            message: body
                .message
                .unwrap_or_else(|| format!("worker rejected record ({status})")),
            retriable: body
                .retriable
                .unwrap_or_else(|| status.is_success() || status_is_retriable(status)),
        },
        None if status.is_success() => DispatchResult::Success,
        None => DispatchResult::Failure {
            message: format!("worker responded with {status}"),
            retriable: status_is_retriable(status),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::{Json, Router, http::StatusCode as AxumStatus, routing::post};
    use chrono::DateTime;

    use pagequeue_core::RecordKey;

    use crate::queue::types::PageEvent;

    fn record() -> QueueRecord {
        let at = DateTime::from_timestamp_millis(0).unwrap();
        QueueRecord::new(
            RecordKey::derive("https://a.com", at, Duration::from_secs(60)),
            PageEvent::new("https://a.com", "A"),
            at,
        )
    }

    fn response(success: bool, message: Option<&str>, retriable: Option<bool>) -> Option<DispatchResponse> {
        Some(DispatchResponse {
            success,
            message: message.map(str::to_string),
            retriable,
        })
    }

    #[test]
    fn success_without_body() {
        assert_eq!(classify(StatusCode::OK, None), DispatchResult::Success);
        assert_eq!(classify(StatusCode::NO_CONTENT, None), DispatchResult::Success);
    }

    #[test]
    fn server_errors_and_throttling_are_retriable() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(
                classify(status, None),
                DispatchResult::Failure { retriable: true, .. }
            ));
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, None),
            DispatchResult::Failure { retriable: false, .. }
        ));
    }

    #[test]
    fn explicit_body_overrides_status_mapping() {
        assert_eq!(
            classify(StatusCode::OK, response(false, Some("malformed page"), Some(false))),
            DispatchResult::permanent("malformed page")
        );
        assert_eq!(
            classify(StatusCode::BAD_REQUEST, response(false, Some("model loading"), Some(true))),
            DispatchResult::retriable("model loading")
        );
        assert!(matches!(
            classify(StatusCode::OK, response(false, None, None)),
            DispatchResult::Failure { retriable: true, .. }
        ));
    }

    #[tokio::test]
    async fn unreachable_worker_is_retriable() {
        let client = HttpWorkerClient::new("http://127.0.0.1:9/dispatch", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            client.dispatch(&record()).await,
            DispatchResult::Failure { retriable: true, .. }
        ));
    }

    #[tokio::test]
    async fn posts_record_to_worker() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = seen.clone();
        let app = Router::new().route(
            "/dispatch",
            post(move |Json(body): Json<Value>| {
                let seen = seen_in_handler.clone();
                async move {
                    seen.lock().unwrap().push(body);
                    (AxumStatus::OK, Json(serde_json::json!({ "success": true })))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            HttpWorkerClient::new(format!("http://{addr}/dispatch"), Duration::from_secs(5)).unwrap();
        let result = client.dispatch(&record()).await;
        server.abort();

        assert_eq!(result, DispatchResult::Success);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["url"], "https://a.com");
        assert_eq!(seen[0]["attempt"], 0);
    }
}
