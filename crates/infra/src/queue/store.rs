//! Queue storage implementations.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pagequeue_core::{QueueError, RecordKey};

use super::types::{QueueRecord, QueueStats, Settings};

/// Queue store abstraction.
///
/// Every mutation is a single atomic write. Enqueue and the scheduler touch
/// disjoint columns of a record (metadata vs. retry state), so neither can
/// overwrite the other's change.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Get a record by key.
    async fn get(&self, key: &RecordKey) -> Result<Option<QueueRecord>, StoreError>;

    /// Insert or replace a whole record.
    async fn upsert(&self, record: &QueueRecord) -> Result<(), StoreError>;

    /// Insert `fresh`, or fold its metadata (url, title, payload,
    /// last_updated_at) into the record already stored under the same key.
    ///
    /// Returns the merged record when one existed, `None` when `fresh` was inserted.
    async fn coalesce_or_insert(&self, fresh: &QueueRecord) -> Result<Option<QueueRecord>, StoreError>;

    /// Write only the retry state (attempt, next_attempt_at, last_error,
    /// last_updated_at) of an existing record. Returns whether it existed.
    async fn save_retry_state(&self, record: &QueueRecord) -> Result<bool, StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, key: &RecordKey) -> Result<bool, StoreError>;

    /// Records with `next_attempt_at <= now`, oldest `first_enqueued_at` first.
    /// Dead letters are never returned.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>, StoreError>;

    /// All records for a URL, across buckets.
    async fn by_url(&self, url: &str) -> Result<Vec<QueueRecord>, StoreError>;

    /// Dead-lettered records, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError>;

    /// Number of records (live and dead).
    async fn count(&self) -> Result<usize, StoreError>;

    async fn settings(&self) -> Result<Settings, StoreError>;

    /// Set the pause flag, leaving the model version alone. Returns the settings after the write.
    async fn set_paused(&self, paused: bool) -> Result<Settings, StoreError>;

    /// Set the model version, leaving the pause flag alone. Returns the settings after the write.
    async fn set_model_version(&self, version: Option<String>) -> Result<Settings, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    async fn save_stats(&self, stats: &QueueStats) -> Result<(), StoreError>;
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(RecordKey),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => QueueError::not_found(key.to_string()),
            other => QueueError::store(other.to_string()),
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("lock poisoned".to_string())
}

/// In-memory queue store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    records: RwLock<HashMap<RecordKey, QueueRecord>>,
    settings: RwLock<Settings>,
    stats: RwLock<QueueStats>,
    skip_before_failure: AtomicUsize,
    failures: AtomicUsize,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store that starts unpaused with the worker model already bootstrapped.
    pub fn ready(model_version: impl Into<String>) -> Self {
        let store = Self::new();
        if let Ok(mut settings) = store.settings.write() {
            settings.model_version = Some(model_version.into());
        }
        store
    }

    /// Make the next `n` operations fail with a storage error.
    pub fn fail_next(&self, n: usize) {
        self.fail_after(0, n);
    }

    /// Let `skip` operations through, then fail the `n` after them.
    pub fn fail_after(&self, skip: usize, n: usize) {
        self.skip_before_failure.store(skip, Ordering::SeqCst);
        self.failures.store(n, Ordering::SeqCst);
    }

    /// All records ordered by `first_enqueued_at`.
    pub fn snapshot(&self) -> Vec<QueueRecord> {
        let records = match self.records.read() {
            Ok(r) => r,
            Err(_) => return Vec::new(),
        };
        let mut all: Vec<_> = records.values().cloned().collect();
        sort_fifo(&mut all);
        all
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let skipped = self
            .skip_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if skipped {
            return Ok(());
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Storage("injected failure".to_string()));
        }
        Ok(())
    }
}

fn sort_fifo(records: &mut [QueueRecord]) {
    records.sort_by(|a, b| {
        a.first_enqueued_at
            .cmp(&b.first_enqueued_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<QueueRecord>, StoreError> {
        self.check_fault()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.get(key).cloned())
    }

    async fn upsert(&self, record: &QueueRecord) -> Result<(), StoreError> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn coalesce_or_insert(&self, fresh: &QueueRecord) -> Result<Option<QueueRecord>, StoreError> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        match records.entry(fresh.id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().coalesce(fresh);
                Ok(Some(slot.get().clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh.clone());
                Ok(None)
            }
        }
    }

    async fn save_retry_state(&self, record: &QueueRecord) -> Result<bool, StoreError> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        let Some(stored) = records.get_mut(&record.id) else {
            return Ok(false);
        };
        stored.attempt = record.attempt;
        stored.next_attempt_at = record.next_attempt_at;
        stored.last_error = record.last_error.clone();
        stored.last_updated_at = record.last_updated_at;
        Ok(true)
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| poisoned())?;
        Ok(records.remove(key).is_some())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        self.check_fault()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut due: Vec<_> = records.values().filter(|r| r.is_due(now)).cloned().collect();
        sort_fifo(&mut due);
        due.truncate(limit);
        Ok(due)
    }

    async fn by_url(&self, url: &str) -> Result<Vec<QueueRecord>, StoreError> {
        self.check_fault()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut matching: Vec<_> = records.values().filter(|r| r.url == url).cloned().collect();
        sort_fifo(&mut matching);
        Ok(matching)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        self.check_fault()?;
        let records = self.records.read().map_err(|_| poisoned())?;
        let mut dead: Vec<_> = records
            .values()
            .filter(|r| r.is_dead_letter())
            .cloned()
            .collect();
        sort_fifo(&mut dead);
        dead.truncate(limit);
        Ok(dead)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.check_fault()?;
        Ok(self.records.read().map_err(|_| poisoned())?.len())
    }

    async fn settings(&self) -> Result<Settings, StoreError> {
        self.check_fault()?;
        Ok(self.settings.read().map_err(|_| poisoned())?.clone())
    }

    async fn set_paused(&self, paused: bool) -> Result<Settings, StoreError> {
        self.check_fault()?;
        let mut settings = self.settings.write().map_err(|_| poisoned())?;
        settings.paused = paused;
        Ok(settings.clone())
    }

    async fn set_model_version(&self, version: Option<String>) -> Result<Settings, StoreError> {
        self.check_fault()?;
        let mut settings = self.settings.write().map_err(|_| poisoned())?;
        settings.model_version = version;
        Ok(settings.clone())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.check_fault()?;
        Ok(self.stats.read().map_err(|_| poisoned())?.clone())
    }

    async fn save_stats(&self, stats: &QueueStats) -> Result<(), StoreError> {
        self.check_fault()?;
        *self.stats.write().map_err(|_| poisoned())? = stats.clone();
        Ok(())
    }
}

#[async_trait]
impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    async fn get(&self, key: &RecordKey) -> Result<Option<QueueRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn upsert(&self, record: &QueueRecord) -> Result<(), StoreError> {
        (**self).upsert(record).await
    }

    async fn coalesce_or_insert(&self, fresh: &QueueRecord) -> Result<Option<QueueRecord>, StoreError> {
        (**self).coalesce_or_insert(fresh).await
    }

    async fn save_retry_state(&self, record: &QueueRecord) -> Result<bool, StoreError> {
        (**self).save_retry_state(record).await
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool, StoreError> {
        (**self).remove(key).await
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        (**self).due(now, limit).await
    }

    async fn by_url(&self, url: &str) -> Result<Vec<QueueRecord>, StoreError> {
        (**self).by_url(url).await
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<QueueRecord>, StoreError> {
        (**self).dead_letters(limit).await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        (**self).count().await
    }

    async fn settings(&self) -> Result<Settings, StoreError> {
        (**self).settings().await
    }

    async fn set_paused(&self, paused: bool) -> Result<Settings, StoreError> {
        (**self).set_paused(paused).await
    }

    async fn set_model_version(&self, version: Option<String>) -> Result<Settings, StoreError> {
        (**self).set_model_version(version).await
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        (**self).stats().await
    }

    async fn save_stats(&self, stats: &QueueStats) -> Result<(), StoreError> {
        (**self).save_stats(stats).await
    }
}
