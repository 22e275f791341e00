use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use pagequeue_core::{RecordKey, is_never};
use pagequeue_infra::queue::{PageEvent, QueueRecord, RecordState};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl EnqueueRequest {
    pub fn into_event(self) -> PageEvent {
        let event = PageEvent::new(self.url, self.title.unwrap_or_default());
        match self.payload {
            Some(payload) => event.with_payload(payload),
            None => event,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct ModelVersionRequest {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryDeadLetterRequest {
    pub id: String,
}

impl RetryDeadLetterRequest {
    pub fn key(&self) -> Result<RecordKey, pagequeue_core::QueueError> {
        self.id.parse()
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// -------------------------
// Response mapping
// -------------------------

fn state_name(state: RecordState) -> &'static str {
    match state {
        RecordState::Pending => "pending",
        RecordState::Backoff => "backoff",
        RecordState::DeadLetter => "dead_letter",
    }
}

pub fn record_to_json(record: &QueueRecord, now: DateTime<Utc>) -> Value {
    let next_attempt_at = (!is_never(record.next_attempt_at)).then(|| record.next_attempt_at.to_rfc3339());
    json!({
        "id": record.id.as_str(),
        "url": record.url,
        "title": record.title,
        "payload": record.payload,
        "first_enqueued_at": record.first_enqueued_at.to_rfc3339(),
        "last_updated_at": record.last_updated_at.to_rfc3339(),
        "attempt": record.attempt,
        "next_attempt_at": next_attempt_at,
        "last_error": record.last_error,
        "state": state_name(record.state(now)),
    })
}

pub fn records_to_json(records: &[QueueRecord], now: DateTime<Utc>) -> Value {
    let items = records.iter().map(|r| record_to_json(r, now)).collect::<Vec<_>>();
    json!({ "items": items })
}
