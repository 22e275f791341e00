//! Coalescing key of a queue record.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Identifier of a queue record.
///
/// Derived from the page URL and a coarse time bucket, so every event for the
/// same URL inside one window lands on the same record. Rendered as
/// `"{bucket}:{url}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// Derive the key for `url` observed at `at`, bucketed by `window`.
    pub fn derive(url: &str, at: DateTime<Utc>, window: Duration) -> Self {
        let bucket = Self::bucket(at, window);
        Self(format!("{bucket}:{url}"))
    }

    /// `floor(at_ms / window_ms)`. A zero window is treated as one millisecond.
    pub fn bucket(at: DateTime<Utc>, window: Duration) -> i64 {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX).max(1);
        at.timestamp_millis().div_euclid(window_ms)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bucket, url) = s
            .split_once(':')
            .ok_or_else(|| QueueError::invalid_key(format!("missing bucket separator: {s}")))?;
        bucket
            .parse::<i64>()
            .map_err(|e| QueueError::invalid_key(format!("bucket '{bucket}': {e}")))?;
        if url.trim().is_empty() {
            return Err(QueueError::invalid_key(format!("empty url: {s}")));
        }
        Ok(Self(s.to_string()))
    }
}
