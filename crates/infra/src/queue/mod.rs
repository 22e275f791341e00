//! Persistent page queue with coalescing, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Repeated "page seen" events for one URL inside a time window coalesce
//!   into a single record
//! - A periodic scheduler tick drains due records in FIFO order under a batch
//!   size and a wall-clock budget
//! - Failures back off exponentially with jitter; permanent failures and
//!   exhausted records become dead letters (`next_attempt_at = never`)
//! - A persisted pause flag gates both enqueue and the tick
//!
//! ## Components
//!
//! - `QueueRecord`: a coalesced unit of work
//! - `QueueStore`: persistence (in-memory or SQLite)
//! - `RetryPolicy`: backoff and dead-letter decisions
//! - `Scheduler`: single-flight tick driving a `WorkerClient`
//! - `AlarmDriver`: periodic timer invoking the tick
//! - `QueueControl`: external commands (pause, enqueue, cleanup)

pub mod alarm;
pub mod control;
pub mod enqueue;
pub mod policy;
pub mod scheduler;
pub mod sqlite;
pub mod store;
pub mod types;
pub mod worker;

pub use alarm::AlarmDriver;
pub use control::QueueControl;
pub use enqueue::{EnqueueOutcome, enqueue};
pub use policy::{BackoffDecision, DeadLetterReason, RetryPolicy};
pub use scheduler::{Scheduler, SkipReason, TickReport, TickSummary};
pub use sqlite::SqliteQueueStore;
pub use store::{InMemoryQueueStore, QueueStore, StoreError};
pub use types::{DispatchResult, PageEvent, QueueRecord, QueueStats, RecordState, Settings};
pub use worker::{HttpWorkerClient, WorkerClient};
