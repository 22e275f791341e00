//! Service wiring: one store, one worker client, shared by the HTTP handlers,
//! the scheduler and the alarm.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};

use pagequeue_core::{Clock, SystemClock};
use pagequeue_infra::QueueConfig;
use pagequeue_infra::queue::{
    AlarmDriver, HttpWorkerClient, QueueControl, QueueStore, Scheduler, SqliteQueueStore, WorkerClient,
};

use crate::config::ApiConfig;

pub type DynStore = Arc<dyn QueueStore>;
pub type DynWorker = Arc<dyn WorkerClient>;
pub type QueueScheduler = Scheduler<DynStore, DynWorker>;

pub struct ApiServices {
    pub control: QueueControl<DynStore>,
    pub scheduler: Arc<QueueScheduler>,
    pub alarm: AlarmDriver<DynStore, DynWorker>,
    clock: Arc<dyn Clock>,
}

impl ApiServices {
    pub fn new(store: DynStore, worker: DynWorker, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let control = QueueControl::new(store.clone(), config.coalesce_window).with_clock(clock.clone());
        let scheduler = Arc::new(Scheduler::new(store, worker, config).with_clock(clock.clone()));
        let alarm = AlarmDriver::new(scheduler.clone());
        Self {
            control,
            scheduler,
            alarm,
            clock,
        }
    }

    /// Production wiring: SQLite store at `DATABASE_URL`, HTTP worker at `WORKER_URL`.
    pub async fn connect(config: &ApiConfig) -> anyhow::Result<Self> {
        let store = SqliteQueueStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open queue store at {}", config.database_url))?;
        let worker = HttpWorkerClient::new(config.worker_url.clone(), config.queue.dispatch_timeout)?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(worker),
            config.queue.clone(),
            Arc::new(SystemClock),
        ))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
