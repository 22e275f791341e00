//! External control surface: pause, enqueue, model readiness, inspection and cleanup.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use pagequeue_core::{Clock, QueueError, QueueResult, RecordKey, SystemClock};

use super::enqueue::{EnqueueOutcome, enqueue};
use super::store::QueueStore;
use super::types::{PageEvent, QueueRecord, QueueStats, Settings};

/// Commands accepted from outside the queue.
///
/// Every command goes straight to the store; nothing is cached here, so the
/// facade can be cloned freely across request handlers.
#[derive(Clone)]
pub struct QueueControl<S> {
    store: S,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl<S: QueueStore> QueueControl<S> {
    pub fn new(store: S, window: Duration) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            window,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[cfg(test)]
    fn store(&self) -> &S {
        &self.store
    }

    /// Set the pause flag. Returns the settings as persisted.
    pub async fn pause(&self, paused: bool) -> QueueResult<Settings> {
        let settings = self.store.set_paused(paused).await?;
        info!(paused, "queue pause flag updated");
        Ok(settings)
    }

    pub async fn enqueue(&self, event: PageEvent) -> QueueResult<EnqueueOutcome> {
        enqueue(&self.store, self.clock.as_ref(), self.window, event).await
    }

    /// Record the worker's model version; a blank or absent version marks the
    /// worker as not ready.
    pub async fn set_model_version(&self, version: Option<String>) -> QueueResult<Settings> {
        let version = version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let settings = self.store.set_model_version(version).await?;
        info!(model_version = ?settings.model_version, "worker model version updated");
        Ok(settings)
    }

    pub async fn settings(&self) -> QueueResult<Settings> {
        Ok(self.store.settings().await?)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.stats().await?)
    }

    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<QueueRecord>> {
        Ok(self.store.dead_letters(limit).await?)
    }

    pub async fn find_by_url(&self, url: &str) -> QueueResult<Vec<QueueRecord>> {
        let url = url.trim();
        if url.is_empty() {
            return Err(QueueError::invalid_event("url must not be empty"));
        }
        Ok(self.store.by_url(url).await?)
    }

    /// Put a dead letter back in line: attempt 0, due now, error cleared.
    pub async fn retry_dead_letter(&self, key: &RecordKey) -> QueueResult<QueueRecord> {
        let mut record = match self.store.get(key).await? {
            Some(record) if record.is_dead_letter() => record,
            _ => return Err(QueueError::not_found(format!("dead letter {key}"))),
        };

        let now = self.clock.now();
        record.attempt = 0;
        record.next_attempt_at = now;
        record.last_error = None;
        record.last_updated_at = now;
        if !self.store.save_retry_state(&record).await? {
            return Err(QueueError::not_found(format!("dead letter {key}")));
        }

        info!(record = %record.id, "dead letter requeued");
        Ok(record)
    }

    /// Delete every dead letter. Returns how many were removed.
    pub async fn purge_dead_letters(&self) -> QueueResult<usize> {
        let dead = self.store.dead_letters(usize::MAX).await?;
        let mut removed = 0;
        for record in &dead {
            if self.store.remove(&record.id).await? {
                removed += 1;
            }
        }
        info!(removed, "dead letters purged");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    use pagequeue_core::{ManualClock, never};

    use crate::queue::store::InMemoryQueueStore;

    const WINDOW: Duration = Duration::from_secs(600);

    fn control() -> (QueueControl<Arc<InMemoryQueueStore>>, Arc<ManualClock>) {
        let clock = ManualClock::at_millis(0).arc();
        let control = QueueControl::new(InMemoryQueueStore::arc(), WINDOW).with_clock(clock.clone());
        (control, clock)
    }

    async fn dead_letter(control: &QueueControl<Arc<InMemoryQueueStore>>, url: &str) -> QueueRecord {
        let mut record = control
            .enqueue(PageEvent::new(url, "t"))
            .await
            .unwrap()
            .into_record();
        record.attempt = 9;
        record.next_attempt_at = never();
        record.last_error = Some("boom".into());
        control.store().upsert(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn pause_gates_enqueue_and_is_persisted() {
        let (control, _) = control();

        assert!(control.pause(true).await.unwrap().paused);
        assert!(control.settings().await.unwrap().paused);
        assert_eq!(
            control.enqueue(PageEvent::new("https://a.com", "A")).await.unwrap_err(),
            QueueError::Paused
        );

        control.pause(false).await.unwrap();
        assert!(control.enqueue(PageEvent::new("https://a.com", "A")).await.is_ok());
    }

    #[tokio::test]
    async fn blank_model_version_means_not_ready() {
        let (control, _) = control();

        let settings = control.set_model_version(Some("  ".into())).await.unwrap();
        assert!(!settings.is_model_ready());

        let settings = control.set_model_version(Some("minilm-v2".into())).await.unwrap();
        assert_eq!(settings.model_version.as_deref(), Some("minilm-v2"));
        assert!(settings.is_model_ready());

        assert!(!control.set_model_version(None).await.unwrap().is_model_ready());
    }

    #[tokio::test]
    async fn retry_dead_letter_resets_attempts() {
        let (control, clock) = control();
        let dead = dead_letter(&control, "https://a.com").await;
        clock.advance(Duration::from_secs(30));

        let revived = control.retry_dead_letter(&dead.id).await.unwrap();

        assert_eq!(revived.attempt, 0);
        assert_eq!(revived.next_attempt_at, DateTime::from_timestamp_millis(30_000).unwrap());
        assert!(revived.last_error.is_none());
        assert!(control.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(control.store().due(clock.now(), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_rejects_live_or_unknown_records() {
        let (control, _) = control();
        let live = control
            .enqueue(PageEvent::new("https://a.com", "A"))
            .await
            .unwrap()
            .into_record();

        assert!(matches!(
            control.retry_dead_letter(&live.id).await.unwrap_err(),
            QueueError::NotFound(_)
        ));
        let unknown: RecordKey = "0:https://nowhere.dev".parse().unwrap();
        assert!(matches!(
            control.retry_dead_letter(&unknown).await.unwrap_err(),
            QueueError::NotFound(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pause_and_model_updates_both_stick() {
        let (control, _) = control();

        for round in 0..50 {
            let version = format!("v{round}");
            let (paused, ready) = tokio::join!(
                tokio::spawn({
                    let control = control.clone();
                    async move { control.pause(true).await }
                }),
                tokio::spawn({
                    let control = control.clone();
                    let version = version.clone();
                    async move { control.set_model_version(Some(version)).await }
                }),
            );
            paused.unwrap().unwrap();
            ready.unwrap().unwrap();

            let settings = control.settings().await.unwrap();
            assert!(settings.paused, "pause lost in round {round}");
            assert_eq!(settings.model_version.as_deref(), Some(version.as_str()));

            control.pause(false).await.unwrap();
            control.set_model_version(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn retry_keeps_metadata_coalesced_into_dead_letter() {
        let (control, clock) = control();
        let dead = dead_letter(&control, "https://a.com").await;

        clock.advance(Duration::from_secs(5));
        let coalesced = control
            .enqueue(PageEvent::new("https://a.com", "revisited"))
            .await
            .unwrap();
        assert!(!coalesced.is_created());
        assert!(coalesced.record().is_dead_letter());

        let revived = control.retry_dead_letter(&dead.id).await.unwrap();
        assert_eq!(revived.title, "revisited");
        assert_eq!(revived.attempt, 0);
    }

    #[tokio::test]
    async fn purge_removes_only_dead_letters() {
        let (control, _) = control();
        dead_letter(&control, "https://a.com").await;
        dead_letter(&control, "https://b.com").await;
        control.enqueue(PageEvent::new("https://c.com", "C")).await.unwrap();

        assert_eq!(control.purge_dead_letters().await.unwrap(), 2);
        assert_eq!(control.purge_dead_letters().await.unwrap(), 0);

        let remaining = control.store().snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].url, "https://c.com");
    }

    #[tokio::test]
    async fn find_by_url_spans_windows() {
        let (control, clock) = control();
        control.enqueue(PageEvent::new("https://a.com", "A")).await.unwrap();
        clock.advance(WINDOW);
        control.enqueue(PageEvent::new("https://a.com", "A")).await.unwrap();
        control.enqueue(PageEvent::new("https://b.com", "B")).await.unwrap();

        assert_eq!(control.find_by_url(" https://a.com ").await.unwrap().len(), 2);
        assert!(control.find_by_url("https://z.com").await.unwrap().is_empty());
        assert!(matches!(
            control.find_by_url("").await.unwrap_err(),
            QueueError::InvalidEvent(_)
        ));
    }
}
