//! Periodic passes that re-feed the dispatcher with work the live path
//! missed: firings that fell due while the process was down, and retries
//! that were pending when it stopped.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::RecoveryConfig;
use cadence_core::types::now;
use cadence_store::Store;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, PendingExecution};
use crate::error::{Result, SchedulerError};

#[derive(Clone)]
pub struct RecoveryLoops {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    config: RecoveryConfig,
}

impl RecoveryLoops {
    pub fn new(store: Arc<dyn Store>, dispatcher: Dispatcher, config: RecoveryConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Enqueue every catch-up schedule whose cached next firing is overdue,
    /// then advance its cached next firing. Stops at the first full queue;
    /// the rest are picked up next pass. Returns how many were enqueued.
    pub async fn missed_pass(&self) -> Result<usize> {
        let now = now();
        let grace = chrono::Duration::seconds(self.config.missed_grace_secs as i64);
        let missed = self.store.find_missed_firings(now, grace).await?;
        let mut enqueued = 0;

        for schedule in missed {
            let Some(scheduled_time) = schedule.next_execution_at else {
                continue;
            };
            let id = schedule.id;
            let attempt = self.store.latest_attempt(id, scheduled_time).await? + 1;
            let next = schedule.next_fire_after(now);

            let mut item = PendingExecution::scheduled(Arc::new(schedule), scheduled_time, true);
            item.attempt_count = attempt;
            match self.dispatcher.enqueue(item).await {
                Ok(_) => {
                    info!(schedule_id = %id, %scheduled_time, "missed firing enqueued");
                    enqueued += 1;
                }
                Err(e @ (SchedulerError::QueueFull | SchedulerError::ShuttingDown)) => {
                    warn!(schedule_id = %id, error = %e, "missed pass stopped early");
                    break;
                }
                Err(e) => return Err(e),
            }
            if let Err(e) = self.store.set_next_execution(id, next).await {
                warn!(schedule_id = %id, error = %e, "failed to advance next execution time");
            }
        }
        Ok(enqueued)
    }

    /// Schedule delayed retries for recent failures that still have budget
    /// and have not been superseded. Returns how many were newly scheduled.
    pub async fn retry_pass(&self) -> Result<usize> {
        let window = chrono::Duration::seconds(self.config.retry_window_secs as i64);
        let candidates = self
            .store
            .find_failed_retryable(now(), window, self.config.retry_batch)
            .await?;
        let scheduled = candidates
            .into_iter()
            .filter(|c| self.dispatcher.schedule_recovered_retry(c.clone()))
            .count();
        if scheduled > 0 {
            info!(scheduled, "recovered retries scheduled");
        }
        Ok(scheduled)
    }

    /// Run both passes on their own tickers until `cancel` fires. The first
    /// tick of each comes one full period after the call.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let missed = {
            let loops = self.clone();
            let cancel = cancel.clone();
            let period = Duration::from_secs(self.config.missed_interval_secs.max(1));
            tokio::spawn(async move {
                loops
                    .run_every(period, cancel, "missed firings", |l| async move {
                        l.missed_pass().await
                    })
                    .await
            })
        };
        let retry = {
            let loops = self.clone();
            let period = Duration::from_secs(self.config.retry_interval_secs.max(1));
            tokio::spawn(async move {
                loops
                    .run_every(period, cancel, "retry", |l| async move { l.retry_pass().await })
                    .await
            })
        };
        vec![missed, retry]
    }

    async fn run_every<F, Fut>(self, period: Duration, cancel: CancellationToken, name: &str, pass: F)
    where
        F: Fn(RecoveryLoops) -> Fut,
        Fut: std::future::Future<Output = Result<usize>>,
    {
        info!(loop_name = name, period_secs = period.as_secs(), "recovery loop started");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match AssertUnwindSafe(pass(self.clone())).catch_unwind().await {
                        Ok(Ok(n)) => debug!(loop_name = name, handled = n, "recovery pass done"),
                        Ok(Err(e)) => error!(loop_name = name, error = %e, "recovery pass failed"),
                        Err(_) => error!(loop_name = name, "recovery pass panicked"),
                    }
                }
                _ = cancel.cancelled() => {
                    info!(loop_name = name, "recovery loop stopped");
                    break;
                }
            }
        }
    }
}
