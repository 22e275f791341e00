//! Scheduler tick: drain due records into the worker under a batch and time budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use pagequeue_core::{Clock, QueueError, QueueResult, SystemClock};

use crate::config::QueueConfig;

use super::policy::BackoffDecision;
use super::store::{QueueStore, StoreError};
use super::types::{DispatchResult, QueueRecord, QueueStats};
use super::worker::WorkerClient;

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous tick is still in flight
    AlreadyRunning,
    /// The pause flag is set
    Paused,
    /// The worker has not finished its model bootstrap
    ModelNotReady,
}

/// Counters for one tick that ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// The time budget ran out before the batch was drained
    pub budget_exhausted: bool,
}

/// Result of [`Scheduler::tick`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickReport {
    Skipped { reason: SkipReason },
    Ran(TickSummary),
}

impl TickReport {
    fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn summary(&self) -> Option<&TickSummary> {
        match self {
            Self::Ran(summary) => Some(summary),
            Self::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skipped { reason } => Some(*reason),
            Self::Ran(_) => None,
        }
    }
}

/// Releases the processing flag when dropped, whichever way the tick exits.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Cooperative, single-flight scheduler.
///
/// Each tick dispatches due records one at a time in FIFO order; nothing runs
/// in parallel within a tick.
pub struct Scheduler<S, W> {
    store: S,
    worker: W,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    rng: Mutex<StdRng>,
    processing: AtomicBool,
}

impl<S: QueueStore, W: WorkerClient> Scheduler<S, W> {
    pub fn new(store: S, worker: W, config: QueueConfig) -> Self {
        Self {
            store,
            worker,
            clock: Arc::new(SystemClock),
            config,
            rng: Mutex::new(StdRng::from_entropy()),
            processing: AtomicBool::new(false),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed the jitter source (deterministic tests).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Whether a tick is currently in flight.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Run one tick.
    ///
    /// Settings are read once at the start; pausing mid-tick takes effect on the
    /// next tick. A store failure aborts the tick and is returned; every record
    /// keeps its last persisted state.
    pub async fn tick(&self) -> QueueResult<TickReport> {
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!("tick skipped: previous tick still running");
            return Ok(TickReport::skipped(SkipReason::AlreadyRunning));
        };

        let started = self.clock.now();
        let settings = self.store.settings().await.map_err(|e| store_failure("load settings", e))?;
        if settings.paused {
            debug!("tick skipped: processing is paused");
            return Ok(TickReport::skipped(SkipReason::Paused));
        }
        if !settings.is_model_ready() {
            debug!("tick skipped: worker model not ready");
            return Ok(TickReport::skipped(SkipReason::ModelNotReady));
        }

        let due = self
            .store
            .due(started, self.config.batch_size)
            .await
            .map_err(|e| store_failure("load due records", e))?;
        let mut stats = self.store.stats().await.map_err(|e| store_failure("load stats", e))?;
        let mut summary = TickSummary::default();

        for record in due {
            let elapsed = (self.clock.now() - started).to_std().unwrap_or_default();
            if elapsed >= self.config.tick_budget {
                summary.budget_exhausted = true;
                info!(elapsed_ms = elapsed.as_millis() as u64, "tick budget exhausted");
                break;
            }

            summary.dispatched += 1;
            let result = self.dispatch(&record).await;
            self.settle(record, result, &mut summary, &mut stats).await?;
        }

        stats.last_tick_at = Some(self.clock.now());
        self.store
            .save_stats(&stats)
            .await
            .map_err(|e| store_failure("save stats", e))?;

        if summary.dispatched > 0 {
            info!(
                dispatched = summary.dispatched,
                succeeded = summary.succeeded,
                retried = summary.retried,
                dead_lettered = summary.dead_lettered,
                "tick finished"
            );
        }
        Ok(TickReport::Ran(summary))
    }

    async fn dispatch(&self, record: &QueueRecord) -> DispatchResult {
        let timeout = self.config.dispatch_timeout;
        match tokio::time::timeout(timeout, self.worker.dispatch(record)).await {
            Ok(result) => result,
            Err(_) => DispatchResult::retriable(format!(
                "worker did not respond within {}ms",
                timeout.as_millis()
            )),
        }
    }

    async fn settle(
        &self,
        record: QueueRecord,
        result: DispatchResult,
        summary: &mut TickSummary,
        stats: &mut QueueStats,
    ) -> QueueResult<()> {
        match result {
            DispatchResult::Success => {
                self.store
                    .remove(&record.id)
                    .await
                    .map_err(|e| store_failure("remove processed record", e))?;
                summary.succeeded += 1;
                stats.record_success();
                debug!(record = %record.id, "record processed");
            }
            DispatchResult::Failure { message, retriable } => {
                let mut current = record;
                let now = self.clock.now();
                let decision = {
                    let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                    self.config
                        .retry
                        .apply_failure(&mut current, &message, retriable, now, &mut *rng)
                };

                // Retry columns only: metadata coalesced during the dispatch stays.
                let persisted = self
                    .store
                    .save_retry_state(&current)
                    .await
                    .map_err(|e| store_failure("persist failed record", e))?;
                if !persisted {
                    debug!(record = %current.id, "record removed while in flight");
                }

                match decision {
                    BackoffDecision::Retry { attempt, delay } => {
                        summary.retried += 1;
                        stats.record_failure(false);
                        warn!(
                            record = %current.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "dispatch failed, retrying later"
                        );
                    }
                    BackoffDecision::DeadLetter { attempt, reason } => {
                        summary.dead_lettered += 1;
                        stats.record_failure(true);
                        warn!(
                            record = %current.id,
                            attempt,
                            reason = ?reason,
                            error = %message,
                            "record dead-lettered"
                        );
                    }
                }
            }
        }

        self.store
            .save_stats(stats)
            .await
            .map_err(|e| store_failure("save stats", e))?;
        Ok(())
    }
}

fn store_failure(action: &'static str, err: StoreError) -> QueueError {
    error!(action, error = %err, "queue store failed; aborting tick");
    err.into()
}
