//! The running scheduler: time wheel, dispatcher and recovery loops wired
//! over one store, behind the operations the HTTP surface needs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_core::config::CadenceConfig;
use cadence_core::sinks::{AuditSink, Notifier};
use cadence_core::types::{now, Schedule};
use cadence_store::Store;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, DispatcherDeps, PendingExecution};
use crate::error::{Result, SchedulerError};
use crate::invoker::TargetInvoker;
use crate::recovery::RecoveryLoops;
use crate::wheel::{TimeWheel, WheelEntry};

/// Error written on executions left `running` by a previous process.
pub const RESTART_ERROR: &str = "interrupted by restart";

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    wheel: TimeWheel,
    recovery: RecoveryLoops,
    budget: Duration,
    cancel: CancellationToken,
    loops: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        invoker: Arc<dyn TargetInvoker>,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn Notifier>,
        config: &CadenceConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            DispatcherDeps {
                store: store.clone(),
                invoker,
                audit,
                notifier,
            },
            config.dispatcher.clone(),
            config.targets.n8n_base_url.clone(),
        );
        let cancel = CancellationToken::new();
        let wheel = TimeWheel::with_cancel(
            Arc::new(dispatcher.clone()),
            store.clone(),
            cancel.child_token(),
        );
        let recovery = RecoveryLoops::new(store.clone(), dispatcher.clone(), config.recovery.clone());
        Self {
            store,
            dispatcher,
            wheel,
            recovery,
            budget: config.shutdown_budget(),
            cancel,
            loops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail orphaned executions, start workers, enqueue missed catch-up
    /// firings, load every active schedule into the wheel and start the
    /// recovery loops. Missed firings are handled before registration so
    /// the wheel never fires the same overdue instant a second time.
    pub async fn start(&self) -> Result<()> {
        let orphaned = self.store.fail_running_executions(RESTART_ERROR).await?;
        if orphaned > 0 {
            warn!(orphaned, "failed executions left running by previous process");
        }

        self.dispatcher.start();

        match self.recovery.missed_pass().await {
            Ok(n) if n > 0 => info!(enqueued = n, "missed firings enqueued at startup"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "startup missed-firing pass failed"),
        }

        let active = self.store.find_active_schedules().await?;
        let count = active.len();
        for schedule in active {
            self.wheel.register(schedule);
        }
        self.wheel.start();

        let handles = self.recovery.spawn(self.cancel.clone());
        if let Ok(mut loops) = self.loops.lock() {
            loops.extend(handles);
        }
        info!(schedules = count, "scheduler started");
        Ok(())
    }

    /// Bring the wheel in line with a created or updated schedule.
    pub fn sync(&self, schedule: &Schedule) {
        self.wheel.register(schedule.clone());
    }

    /// Forget a deleted schedule.
    pub fn remove(&self, schedule_id: Uuid) {
        self.wheel.unregister(schedule_id);
        self.dispatcher.forget(schedule_id);
    }

    /// Queue an immediate run of the schedule, regardless of whether it is
    /// enabled. Returns the id its execution row will carry.
    pub async fn trigger(&self, schedule_id: Uuid, actor: &str) -> Result<Uuid> {
        let schedule = self.store.get_schedule(schedule_id).await?;
        let item = PendingExecution::manual(Arc::new(schedule), actor);
        self.dispatcher.enqueue(item).await
    }

    /// Queue another attempt of a failed or timed-out execution's firing.
    pub async fn retry_execution(&self, execution_id: Uuid, actor: &str) -> Result<Uuid> {
        let execution = self.store.get_execution(execution_id).await?;
        if !execution.status.is_failure() {
            return Err(SchedulerError::NotRetryable {
                id: execution.id,
                status: execution.status,
            });
        }
        let schedule = self.store.get_schedule(execution.schedule_id).await?;
        let attempt = self
            .store
            .latest_attempt(execution.schedule_id, execution.scheduled_time)
            .await?
            + 1;

        let mut item = PendingExecution::manual(Arc::new(schedule), actor);
        item.scheduled_time = execution.scheduled_time;
        item.attempt_count = attempt;
        item.is_catch_up = execution.is_catch_up;
        self.dispatcher.enqueue(item).await
    }

    /// Next firing the wheel holds for the schedule.
    pub fn next_fire(&self, schedule_id: Uuid) -> Option<DateTime<Utc>> {
        self.wheel.entry_for(schedule_id).map(|e| e.next_fire)
    }

    pub fn entry_for(&self, schedule_id: Uuid) -> Option<WheelEntry> {
        self.wheel.entry_for(schedule_id)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn wheel(&self) -> &TimeWheel {
        &self.wheel
    }

    pub fn recovery(&self) -> &RecoveryLoops {
        &self.recovery
    }

    /// Stop firing, stop the recovery loops and drain the dispatcher within
    /// the configured budget.
    pub async fn shutdown(&self) {
        let started = now();
        self.cancel.cancel();
        self.wheel.stop().await;
        let handles: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .map(|mut l| l.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        self.dispatcher.shutdown(self.budget).await;
        info!(
            elapsed_ms = (now() - started).num_milliseconds(),
            "scheduler stopped"
        );
    }
}
