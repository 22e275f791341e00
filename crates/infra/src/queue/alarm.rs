//! Periodic alarm driving the scheduler tick.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::scheduler::{Scheduler, TickReport};
use super::store::QueueStore;
use super::worker::WorkerClient;

struct RunningAlarm {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Owns the background timer that calls [`Scheduler::tick`] every period.
///
/// At most one timer exists per driver; `ensure_started` is safe to call on
/// every startup path.
pub struct AlarmDriver<S, W> {
    scheduler: Arc<Scheduler<S, W>>,
    period: Duration,
    running: Mutex<Option<RunningAlarm>>,
}

impl<S, W> AlarmDriver<S, W>
where
    S: QueueStore + 'static,
    W: WorkerClient + 'static,
{
    /// Driver firing at the scheduler's configured alarm period.
    pub fn new(scheduler: Arc<Scheduler<S, W>>) -> Self {
        let period = scheduler.config().alarm_period;
        Self::with_period(scheduler, period)
    }

    pub fn with_period(scheduler: Arc<Scheduler<S, W>>, period: Duration) -> Self {
        Self {
            scheduler,
            period,
            running: Mutex::new(None),
        }
    }

    /// Start the timer unless one is already running. Returns whether a new
    /// timer was spawned. Must be called from within a Tokio runtime.
    pub fn ensure_started(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|alarm| !alarm.join.is_finished()) {
            return false;
        }

        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(alarm_loop(self.scheduler.clone(), self.period, shutdown.clone()));
        *running = Some(RunningAlarm { shutdown, join });
        info!(period_ms = self.period.as_millis() as u64, "queue alarm started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|alarm| !alarm.join.is_finished())
    }

    /// Stop the timer and wait for an in-flight tick to finish.
    pub async fn shutdown(&self) {
        let alarm = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(alarm) = alarm {
            alarm.shutdown.notify_one();
            if let Err(err) = alarm.join.await {
                error!(error = %err, "queue alarm task panicked");
            }
            info!("queue alarm stopped");
        }
    }
}

async fn alarm_loop<S, W>(scheduler: Arc<Scheduler<S, W>>, period: Duration, shutdown: Arc<Notify>)
where
    S: QueueStore,
    W: WorkerClient,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = interval.tick() => {
                match scheduler.tick().await {
                    Ok(TickReport::Skipped { reason }) => debug!(?reason, "alarm tick skipped"),
                    Ok(TickReport::Ran(_)) => {}
                    Err(err) => error!(error = %err, "alarm tick failed"),
                }
            }
        }
    }
}
