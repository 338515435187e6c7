//! Bounded queue of pending executions and the worker pool that runs them.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::DispatcherConfig;
use cadence_core::metrics::ExecutionOutcome;
use cadence_core::sinks::{AuditSink, Notification, Notifier};
use cadence_core::types::{
    now, AuditAction, AuditEntry, Execution, ExecutionResult, NewExecution, OverlapPolicy,
    Schedule,
};
use cadence_store::{RetryCandidate, Store, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::invoker::{ResolvedTarget, TargetInvoker};
use crate::retry::{has_retry_budget, retry_delay};
use crate::wheel::FireSink;

pub const TRIGGERED_BY_SCHEDULER: &str = "scheduler";
pub const TRIGGERED_BY_CATCH_UP: &str = "catch_up";
pub const TRIGGERED_BY_RETRY: &str = "retry";

/// Error recorded on executions abandoned at shutdown.
pub const SHUTDOWN_ERROR: &str = "shutdown";

/// A firing waiting for a worker. The execution id is assigned up front so
/// manual triggers can report it before any row exists.
#[derive(Debug, Clone)]
pub struct PendingExecution {
    pub execution_id: Uuid,
    pub schedule: Arc<Schedule>,
    pub scheduled_time: DateTime<Utc>,
    pub attempt_count: i32,
    pub is_manual_trigger: bool,
    pub is_catch_up: bool,
    pub triggered_by: String,
}

impl PendingExecution {
    pub fn scheduled(schedule: Arc<Schedule>, scheduled_time: DateTime<Utc>, catch_up: bool) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            schedule,
            scheduled_time,
            attempt_count: 1,
            is_manual_trigger: false,
            is_catch_up: catch_up,
            triggered_by: if catch_up {
                TRIGGERED_BY_CATCH_UP
            } else {
                TRIGGERED_BY_SCHEDULER
            }
            .to_string(),
        }
    }

    pub fn manual(schedule: Arc<Schedule>, actor: impl Into<String>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            schedule,
            scheduled_time: now(),
            attempt_count: 1,
            is_manual_trigger: true,
            is_catch_up: false,
            triggered_by: actor.into(),
        }
    }

    /// Manual triggers never wait on or skip for a running execution.
    pub fn overlap_policy(&self) -> OverlapPolicy {
        if self.is_manual_trigger {
            OverlapPolicy::Allow
        } else {
            self.schedule.overlap_policy
        }
    }

    fn new_execution(&self, target: Option<&ResolvedTarget>) -> NewExecution {
        NewExecution {
            id: self.execution_id,
            schedule_id: self.schedule.id,
            scheduled_time: self.scheduled_time,
            attempt_count: self.attempt_count,
            is_manual_trigger: self.is_manual_trigger,
            is_catch_up: self.is_catch_up,
            triggered_by: self.triggered_by.clone(),
            metadata: target.map(ResolvedTarget::metadata),
        }
    }
}

/// Per-schedule overlap state: how many executions are running in this
/// process, and a lock that serialises `queue`-policy items.
struct ScheduleGate {
    running: watch::Sender<usize>,
    serial: AsyncMutex<()>,
}

impl ScheduleGate {
    fn new() -> Self {
        Self {
            running: watch::Sender::new(0),
            serial: AsyncMutex::new(()),
        }
    }

    fn running(&self) -> usize {
        *self.running.borrow()
    }

    async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn enter(self: &Arc<Self>) -> GateGuard {
        self.running.send_modify(|n| *n += 1);
        GateGuard(self.clone())
    }

    /// Enter only when nothing is running.
    fn try_enter_idle(self: &Arc<Self>) -> Option<GateGuard> {
        let mut entered = false;
        self.running.send_if_modified(|n| {
            if *n == 0 {
                *n = 1;
                entered = true;
            }
            entered
        });
        entered.then(|| GateGuard(self.clone()))
    }
}

struct GateGuard(Arc<ScheduleGate>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.0.running.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct DispatcherDeps {
    pub store: Arc<dyn Store>,
    pub invoker: Arc<dyn TargetInvoker>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
}

struct Inner {
    store: Arc<dyn Store>,
    invoker: Arc<dyn TargetInvoker>,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    config: DispatcherConfig,
    n8n_base_url: Option<String>,
    tx: mpsc::Sender<PendingExecution>,
    rx: AsyncMutex<mpsc::Receiver<PendingExecution>>,
    gates: DashMap<Uuid, Arc<ScheduleGate>>,
    /// `(schedule_id, scheduled_time)` of firings with a retry already
    /// waiting in this process, mapped to the attempt it will run.
    pending_retries: DashMap<(Uuid, DateTime<Utc>), i32>,
    /// Executions whose target call is in progress.
    in_flight: DashMap<Uuid, Uuid>,
    /// Stop accepting work; workers drain what is queued.
    closing: CancellationToken,
    /// Give up on in-progress target calls.
    abandon: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig, n8n_base_url: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                store: deps.store,
                invoker: deps.invoker,
                audit: deps.audit,
                notifier: deps.notifier,
                config,
                n8n_base_url,
                tx,
                rx: AsyncMutex::new(rx),
                gates: DashMap::new(),
                pending_retries: DashMap::new(),
                in_flight: DashMap::new(),
                closing: CancellationToken::new(),
                abandon: CancellationToken::new(),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        if !workers.is_empty() {
            return;
        }
        for worker in 0..self.inner.config.workers.max(1) {
            let inner = self.inner.clone();
            workers.push(tokio::spawn(async move { inner.worker_loop(worker).await }));
        }
        info!(
            workers = workers.len(),
            capacity = self.inner.config.queue_capacity,
            "dispatcher started"
        );
    }

    /// Queue `item`, waiting up to the enqueue timeout for room. A timeout
    /// drops the firing and records an `enqueue_timeout` audit entry.
    pub async fn enqueue(&self, item: PendingExecution) -> Result<Uuid> {
        self.inner.enqueue(item).await
    }

    /// Queued items waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    /// Schedule a delayed retry for a failure found by the recovery loop.
    /// Returns false when a retry for that firing is already pending here.
    pub fn schedule_recovered_retry(&self, candidate: RetryCandidate) -> bool {
        let RetryCandidate {
            execution,
            schedule,
        } = candidate;
        let elapsed = execution
            .end_time
            .map(|end| (now() - end).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        let delay = retry_delay(schedule.retry_strategy, execution.attempt_count)
            .saturating_sub(elapsed);
        self.inner
            .clone()
            .schedule_retry(Arc::new(schedule), &execution, delay)
    }

    /// Drop per-schedule overlap state for a deleted schedule.
    pub fn forget(&self, schedule_id: Uuid) {
        self.inner
            .gates
            .remove_if(&schedule_id, |_, gate| gate.running() == 0);
    }

    /// Stop accepting work, let workers drain the queue for up to `budget`,
    /// then abandon in-progress calls and fail their executions with
    /// `shutdown`.
    pub async fn shutdown(&self, budget: Duration) {
        self.inner.closing.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        let mut join = Box::pin(futures_util::future::join_all(handles));

        if tokio::time::timeout(budget, &mut join).await.is_err() {
            warn!(
                in_flight = self.inner.in_flight.len(),
                "shutdown budget exhausted, abandoning running executions"
            );
            self.inner.abandon.cancel();
            if tokio::time::timeout(Duration::from_secs(5), &mut join).await.is_err() {
                warn!("workers did not stop after abandon");
            }
        }

        let leftover: Vec<Uuid> = self.inner.in_flight.iter().map(|e| *e.key()).collect();
        for id in leftover {
            let result = ExecutionResult::failed(SHUTDOWN_ERROR, now());
            if let Err(e) = self.inner.store.record_execution_terminal(id, &result).await {
                warn!(execution_id = %id, error = %e, "failed to mark abandoned execution");
            }
        }
        info!("dispatcher stopped");
    }
}

#[async_trait]
impl FireSink for Dispatcher {
    async fn fire(&self, schedule: Arc<Schedule>, scheduled_time: DateTime<Utc>, catch_up: bool) {
        let id = schedule.id;
        let item = PendingExecution::scheduled(schedule, scheduled_time, catch_up);
        if let Err(e) = self.enqueue(item).await {
            warn!(schedule_id = %id, %scheduled_time, error = %e, "firing dropped");
        }
    }
}

impl Inner {
    async fn enqueue(&self, item: PendingExecution) -> Result<Uuid> {
        if self.closing.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let id = item.execution_id;
        let schedule_id = item.schedule.id;
        let scheduled_time = item.scheduled_time;
        match self.tx.send_timeout(item, self.config.enqueue_timeout()).await {
            Ok(()) => {
                debug!(execution_id = %id, %schedule_id, "execution queued");
                Ok(id)
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(%schedule_id, %scheduled_time, "dispatcher queue full, dropping firing");
                self.audit
                    .record(
                        AuditEntry::new(Some(schedule_id), AuditAction::EnqueueTimeout, "system")
                            .with_details(json!({ "scheduled_time": scheduled_time })),
                    )
                    .await;
                Err(SchedulerError::QueueFull)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SchedulerError::ShuttingDown),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        loop {
            if self.abandon.is_cancelled() {
                break;
            }
            let next = {
                let mut rx = self.rx.lock().await;
                if self.closing.is_cancelled() {
                    rx.try_recv().ok()
                } else {
                    tokio::select! {
                        item = rx.recv() => item,
                        _ = self.closing.cancelled() => continue,
                    }
                }
            };
            let Some(item) = next else {
                break;
            };

            let execution_id = item.execution_id;
            let run = AssertUnwindSafe(self.clone().process(item)).catch_unwind();
            if let Err(panic) = run.await {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                error!(worker, %execution_id, panic = %msg, "execution panicked");
                self.in_flight.remove(&execution_id);
                let result = ExecutionResult::failed(format!("panic: {msg}"), now());
                if let Err(e) = self.store.record_execution_terminal(execution_id, &result).await {
                    debug!(%execution_id, error = %e, "no execution row to fail after panic");
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    fn gate(&self, schedule_id: Uuid) -> Arc<ScheduleGate> {
        self.gates
            .entry(schedule_id)
            .or_insert_with(|| Arc::new(ScheduleGate::new()))
            .clone()
    }

    #[instrument(skip(self, item), fields(
        execution_id = %item.execution_id,
        schedule_id = %item.schedule.id,
        attempt = item.attempt_count,
    ))]
    async fn process(self: Arc<Self>, item: PendingExecution) {
        let schedule_id = item.schedule.id;
        let gate = self.gate(schedule_id);

        let (_serial, _running) = match item.overlap_policy() {
            OverlapPolicy::Skip => {
                let Some(running) = gate.try_enter_idle() else {
                    self.record_skipped(&item).await;
                    return;
                };
                let busy = self
                    .store
                    .has_running_execution(schedule_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "running check failed, proceeding");
                        false
                    });
                if busy {
                    drop(running);
                    self.record_skipped(&item).await;
                    return;
                }
                (None, running)
            }
            OverlapPolicy::Queue => {
                let serial = gate.serial.lock().await;
                gate.wait_idle().await;
                (Some(serial), gate.enter())
            }
            OverlapPolicy::Allow => (None, gate.enter()),
        };

        let target = ResolvedTarget::resolve(&item.schedule, self.n8n_base_url.as_deref());
        let started = match self
            .store
            .record_execution_start(&item.new_execution(target.as_ref().ok()))
            .await
        {
            Ok(execution) => execution,
            Err(StoreError::Conflict(msg)) => {
                warn!(conflict = %msg, "attempt already recorded, dropping");
                return;
            }
            Err(e) => {
                error!(error = %e, "could not record execution start, dropping");
                return;
            }
        };

        let result = match target {
            Ok(target) => {
                self.in_flight.insert(started.id, schedule_id);
                let result = tokio::select! {
                    result = self.invoker.invoke(&target) => result,
                    _ = self.abandon.cancelled() => ExecutionResult::failed(SHUTDOWN_ERROR, now()),
                };
                self.in_flight.remove(&started.id);
                result
            }
            Err(reason) => ExecutionResult::failed(reason, now()),
        };

        let finished = match self.store.record_execution_terminal(started.id, &result).await {
            Ok(execution) => execution,
            Err(e) => {
                warn!(error = %e, "terminal write rejected");
                return;
            }
        };
        info!(
            status = %finished.status,
            response_code = ?finished.response_code,
            duration_ms = ?finished.duration_ms,
            "execution finished"
        );

        self.record_metrics(&finished).await;
        if finished.status.is_failure() {
            self.after_failure(item.schedule.clone(), &finished).await;
        }
    }

    async fn record_skipped(&self, item: &PendingExecution) {
        match self.store.record_execution_skipped(&item.new_execution(None)).await {
            Ok(skipped) => {
                info!("previous execution still running, skipped");
                self.record_metrics(&skipped).await;
            }
            Err(e) => warn!(error = %e, "could not record skipped execution"),
        }
    }

    async fn record_metrics(&self, execution: &Execution) {
        let outcome = ExecutionOutcome {
            status: execution.status,
            duration_ms: execution.duration_ms.unwrap_or(0),
            finished_at: execution.end_time.unwrap_or_else(now),
        };
        if let Err(e) = self.store.update_metrics(execution.schedule_id, &outcome).await {
            warn!(schedule_id = %execution.schedule_id, error = %e, "metrics update failed");
        }
    }

    async fn after_failure(self: Arc<Self>, schedule: Arc<Schedule>, failed: &Execution) {
        if failed.error_message.as_deref() == Some(SHUTDOWN_ERROR) {
            return;
        }
        if has_retry_budget(failed.attempt_count, schedule.max_retries) {
            let delay = retry_delay(schedule.retry_strategy, failed.attempt_count);
            self.schedule_retry(schedule, failed, delay);
            return;
        }
        self.notifier
            .notify(Notification::ExecutionFailed {
                schedule_id: schedule.id,
                schedule_name: schedule.name.clone(),
                execution_id: failed.id,
                status: failed.status,
                attempt_count: failed.attempt_count,
                error: failed.error_message.clone(),
                scheduled_time: failed.scheduled_time,
            })
            .await;
    }

    /// Enqueue the next attempt of `failed`'s firing after `delay`. The
    /// schedule is re-read first so edits and deletions made meanwhile win.
    fn schedule_retry(self: Arc<Self>, schedule: Arc<Schedule>, failed: &Execution, delay: Duration) -> bool {
        let key = (schedule.id, failed.scheduled_time);
        let attempt = failed.attempt_count + 1;
        if self.pending_retries.contains_key(&key) {
            return false;
        }
        self.pending_retries.insert(key, attempt);
        info!(
            schedule_id = %schedule.id,
            failed_execution = %failed.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        let is_catch_up = failed.is_catch_up;
        let scheduled_time = failed.scheduled_time;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.closing.cancelled() => {
                    self.pending_retries.remove(&key);
                    return;
                }
            }
            self.pending_retries.remove(&key);

            let fresh = match self.store.get_schedule(schedule.id).await {
                Ok(fresh) if fresh.is_schedulable() => fresh,
                Ok(_) => {
                    debug!(schedule_id = %schedule.id, "schedule no longer active, retry dropped");
                    return;
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "retry dropped");
                    return;
                }
            };
            let item = PendingExecution {
                execution_id: Uuid::new_v4(),
                schedule: Arc::new(fresh),
                scheduled_time,
                attempt_count: attempt,
                is_manual_trigger: false,
                is_catch_up,
                triggered_by: TRIGGERED_BY_RETRY.to_string(),
            };
            if let Err(e) = self.enqueue(item).await {
                warn!(schedule_id = %schedule.id, attempt, error = %e, "retry not queued");
            }
        });
        true
    }
}
