//! Core queue types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pagequeue_core::{RecordKey, is_never};

/// Incoming "page seen" event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEvent {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Opaque metadata forwarded to the worker.
    #[serde(default)]
    pub payload: Value,
}

impl PageEvent {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A coalesced unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Coalescing key (url + time bucket)
    pub id: RecordKey,
    pub url: String,
    pub title: String,
    pub payload: Value,
    /// Set once at creation; FIFO ordering key
    pub first_enqueued_at: DateTime<Utc>,
    /// Set on every coalesce and every processing attempt
    pub last_updated_at: DateTime<Utc>,
    /// Failures so far
    pub attempt: u32,
    /// Eligible for dequeue once `now >= next_attempt_at`; `never()` marks a dead letter
    pub next_attempt_at: DateTime<Utc>,
    /// Message of the most recent failure
    pub last_error: Option<String>,
}

/// Derived lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Due now
    Pending,
    /// Waiting out a backoff window
    Backoff,
    /// Never retried again
    DeadLetter,
}

impl QueueRecord {
    /// Create a record for the first event seen for `id`. Immediately eligible.
    pub fn new(id: RecordKey, event: PageEvent, now: DateTime<Utc>) -> Self {
        Self {
            id,
            url: event.url,
            title: event.title,
            payload: event.payload,
            first_enqueued_at: now,
            last_updated_at: now,
            attempt: 0,
            next_attempt_at: now,
            last_error: None,
        }
    }

    /// Fold a repeated event, built as a fresh record for the same key, into this one.
    ///
    /// Only the mutable metadata moves; ordering and retry state stay put.
    pub fn coalesce(&mut self, fresh: &QueueRecord) {
        self.url.clone_from(&fresh.url);
        self.title.clone_from(&fresh.title);
        self.payload.clone_from(&fresh.payload);
        self.last_updated_at = fresh.last_updated_at;
    }

    pub fn is_dead_letter(&self) -> bool {
        is_never(self.next_attempt_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_dead_letter() && self.next_attempt_at <= now
    }

    pub fn state(&self, now: DateTime<Utc>) -> RecordState {
        if self.is_dead_letter() {
            RecordState::DeadLetter
        } else if self.next_attempt_at <= now {
            RecordState::Pending
        } else {
            RecordState::Backoff
        }
    }
}

/// Singleton settings record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub paused: bool,
    /// Set once the worker finished its one-time model bootstrap.
    pub model_version: Option<String>,
}

impl Settings {
    pub fn is_model_ready(&self) -> bool {
        self.model_version
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
    }
}

/// Aggregate processing counters, persisted alongside the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn record_success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, dead_lettered: bool) {
        self.processed += 1;
        self.failed += 1;
        if dead_lettered {
            self.dead_lettered += 1;
        }
    }
}

/// Outcome reported by the external worker for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Success,
    Failure { message: String, retriable: bool },
}

impl DispatchResult {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            retriable: false,
        }
    }
}
