//! Queue error model.

use thiserror::Error;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Transient worker failures never show up here: they are absorbed by the
/// backoff policy and only logged. What remains is what a caller must react to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Processing is paused; the operation was rejected without touching the store.
    #[error("processing is paused")]
    Paused,

    /// An incoming event was malformed (e.g. empty URL).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A record key could not be parsed.
    #[error("invalid record key: {0}")]
    InvalidKey(String),

    /// No record matched the requested key.
    #[error("record not found: {0}")]
    NotFound(String),

    /// The persistent store failed; the store remains the source of truth.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration was rejected.
    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
