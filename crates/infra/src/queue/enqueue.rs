//! Coalescing enqueue.

use std::time::Duration;

use tracing::{debug, info};

use pagequeue_core::{Clock, QueueError, QueueResult, RecordKey};

use super::store::QueueStore;
use super::types::{PageEvent, QueueRecord};

/// What an enqueue did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// First event for the key; a new record was created.
    Created(QueueRecord),
    /// An existing record absorbed the event.
    Coalesced(QueueRecord),
}

impl EnqueueOutcome {
    pub fn record(&self) -> &QueueRecord {
        match self {
            Self::Created(r) | Self::Coalesced(r) => r,
        }
    }

    pub fn into_record(self) -> QueueRecord {
        match self {
            Self::Created(r) | Self::Coalesced(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Record a "page seen" event.
///
/// Rejected with [`QueueError::Paused`] while the pause flag is set; in that
/// case the store is not written.
pub async fn enqueue<S, C>(
    store: &S,
    clock: &C,
    window: Duration,
    event: PageEvent,
) -> QueueResult<EnqueueOutcome>
where
    S: QueueStore + ?Sized,
    C: Clock + ?Sized,
{
    let url = event.url.trim();
    if url.is_empty() {
        return Err(QueueError::invalid_event("url must not be empty"));
    }
    let event = PageEvent {
        url: url.to_string(),
        ..event
    };

    let settings = store.settings().await?;
    if settings.paused {
        debug!(url = %event.url, "enqueue rejected: processing is paused");
        return Err(QueueError::Paused);
    }

    let now = clock.now();
    let key = RecordKey::derive(&event.url, now, window);

    let fresh = QueueRecord::new(key, event, now);

    // One store operation: a tick settling the same record concurrently keeps
    // its attempt and due time.
    let outcome = match store.coalesce_or_insert(&fresh).await? {
        Some(merged) => EnqueueOutcome::Coalesced(merged),
        None => EnqueueOutcome::Created(fresh),
    };

    match &outcome {
        EnqueueOutcome::Created(r) => info!(record = %r.id, "enqueued page"),
        EnqueueOutcome::Coalesced(r) => debug!(record = %r.id, "coalesced page event"),
    }

    Ok(outcome)
}
