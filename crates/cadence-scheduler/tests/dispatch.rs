use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::{CadenceConfig, DispatcherConfig, RecoveryConfig};
use cadence_core::schedule::NewSchedule;
use cadence_core::sinks::{AuditSink, Notification, Notifier};
use cadence_core::types::{
    now, AuditAction, AuditEntry, Execution, ExecutionResult, ExecutionStatus, NewExecution,
    OverlapPolicy, RetryStrategy, Schedule, TargetType,
};
use cadence_core::ErrorKind;
use cadence_scheduler::dispatcher::SHUTDOWN_ERROR;
use cadence_scheduler::scheduler::RESTART_ERROR;
use cadence_scheduler::{
    Dispatcher, DispatcherDeps, PendingExecution, RecoveryLoops, ResolvedTarget, Scheduler,
    SchedulerError, TargetInvoker,
};
use cadence_store::{SqliteStore, Store};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Answers every call with `status` after `delay`, tracking concurrency.
struct StubInvoker {
    delay: Duration,
    status: ExecutionStatus,
    running: AtomicUsize,
    max_running: AtomicUsize,
    calls: AtomicUsize,
}

impl StubInvoker {
    fn new(status: ExecutionStatus, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            status,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TargetInvoker for StubInvoker {
    async fn invoke(&self, _target: &ResolvedTarget) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let success = self.status == ExecutionStatus::Success;
        ExecutionResult {
            status: self.status,
            response_code: Some(if success { 200 } else { 500 }),
            response_body: Some(if success { "ok" } else { "boom" }.into()),
            response_truncated: false,
            error_message: (!success).then(|| "target responded with HTTP 500".to_string()),
            end_time: now(),
        }
    }
}

#[derive(Default)]
struct RecordingAudit(Mutex<Vec<AuditEntry>>);

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, entry: AuditEntry) {
        self.0.lock().unwrap().push(entry);
    }
}

#[derive(Default)]
struct RecordingNotifier(Mutex<Vec<Notification>>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

struct Harness {
    store: Arc<dyn Store>,
    dispatcher: Dispatcher,
    audit: Arc<RecordingAudit>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(invoker: Arc<StubInvoker>, config: DispatcherConfig) -> Harness {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let audit = Arc::new(RecordingAudit::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Dispatcher::new(
        DispatcherDeps {
            store: store.clone(),
            invoker,
            audit: audit.clone(),
            notifier: notifier.clone(),
        },
        config,
        None,
    );
    Harness {
        store,
        dispatcher,
        audit,
        notifier,
    }
}

fn workers(n: usize) -> DispatcherConfig {
    DispatcherConfig {
        workers: n,
        ..Default::default()
    }
}

fn new_schedule(overlap: OverlapPolicy) -> NewSchedule {
    NewSchedule {
        name: Some("job".into()),
        cron_expression: Some("*/5 * * * *".into()),
        target_type: Some(TargetType::Http),
        target_url: Some("http://localhost:9/hook".into()),
        overlap_policy: Some(overlap),
        ..Default::default()
    }
}

async fn create(store: &Arc<dyn Store>, new: NewSchedule) -> Arc<Schedule> {
    Arc::new(store.create_schedule(new).await.unwrap())
}

/// Poll until `done` holds for the schedule's executions (newest first).
async fn wait_for<F>(store: &Arc<dyn Store>, schedule_id: Uuid, secs: u64, done: F) -> Vec<Execution>
where
    F: Fn(&[Execution]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let rows = store.list_executions(Some(schedule_id), 50).await.unwrap();
        if done(&rows) {
            return rows;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting, executions: {rows:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn all_terminal(n: usize) -> impl Fn(&[Execution]) -> bool {
    move |rows| rows.len() >= n && rows.iter().all(|e| e.status.is_terminal())
}

fn minutes_ago(m: i64) -> DateTime<Utc> {
    now() - chrono::Duration::minutes(m)
}

#[tokio::test]
async fn skip_policy_records_skipped_while_previous_runs() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::from_millis(1500));
    let h = harness(invoker.clone(), workers(2));
    h.dispatcher.start();
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Skip)).await;

    h.dispatcher
        .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(2), false))
        .await
        .unwrap();
    wait_for(&h.store, schedule.id, 5, |rows| {
        rows.iter().any(|e| e.status == ExecutionStatus::Running)
    })
    .await;
    h.dispatcher
        .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(1), false))
        .await
        .unwrap();

    let rows = wait_for(&h.store, schedule.id, 10, all_terminal(2)).await;
    let statuses: Vec<_> = rows.iter().map(|e| e.status).collect();
    assert!(statuses.contains(&ExecutionStatus::Success));
    assert!(statuses.contains(&ExecutionStatus::Skipped));
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);

    let skipped = rows
        .iter()
        .find(|e| e.status == ExecutionStatus::Skipped)
        .unwrap();
    assert_eq!(skipped.duration_ms, Some(0));
    assert_eq!(skipped.triggered_by, "scheduler");
}

#[tokio::test]
async fn exponential_retries_reuse_the_firing_and_back_off() {
    let invoker = StubInvoker::new(ExecutionStatus::Failed, Duration::ZERO);
    let h = harness(invoker.clone(), workers(2));
    h.dispatcher.start();
    let schedule = create(
        &h.store,
        NewSchedule {
            max_retries: Some(2),
            retry_strategy: Some(RetryStrategy::Exponential),
            ..new_schedule(OverlapPolicy::Skip)
        },
    )
    .await;
    let fired_at = minutes_ago(1);

    h.dispatcher
        .enqueue(PendingExecution::scheduled(schedule.clone(), fired_at, false))
        .await
        .unwrap();

    let mut rows = wait_for(&h.store, schedule.id, 20, all_terminal(3)).await;
    rows.sort_by_key(|e| e.attempt_count);
    let attempts: Vec<_> = rows.iter().map(|e| e.attempt_count).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert!(rows.iter().all(|e| e.scheduled_time == fired_at));
    assert!(rows.iter().all(|e| e.status == ExecutionStatus::Failed));
    assert_eq!(rows[0].triggered_by, "scheduler");
    assert_eq!(rows[1].triggered_by, "retry");

    let gap = |a: &Execution, b: &Execution| b.start_time.unwrap() - a.start_time.unwrap();
    assert!(gap(&rows[0], &rows[1]) >= chrono::Duration::seconds(2));
    assert!(gap(&rows[1], &rows[2]) >= chrono::Duration::seconds(4));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.notifier.0.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no failure notification");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let metrics = h.store.get_metrics(schedule.id).await.unwrap().unwrap();
    assert_eq!(metrics.consecutive_failures, 3);
    assert_eq!(metrics.failure_count, 3);

    let notes = h.notifier.0.lock().unwrap().clone();
    assert_eq!(notes.len(), 1);
    let Notification::ExecutionFailed { attempt_count, .. } = &notes[0];
    assert_eq!(*attempt_count, 3);
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn queue_policy_runs_one_at_a_time() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::from_millis(300));
    let h = harness(invoker.clone(), workers(3));
    h.dispatcher.start();
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Queue)).await;

    for m in 1..=3 {
        h.dispatcher
            .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(m), false))
            .await
            .unwrap();
    }

    let rows = wait_for(&h.store, schedule.id, 10, all_terminal(3)).await;
    assert!(rows.iter().all(|e| e.status == ExecutionStatus::Success));
    assert_eq!(invoker.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn allow_policy_overlaps() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::from_millis(500));
    let h = harness(invoker.clone(), workers(3));
    h.dispatcher.start();
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Allow)).await;

    for m in 1..=2 {
        h.dispatcher
            .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(m), false))
            .await
            .unwrap();
    }
    wait_for(&h.store, schedule.id, 10, all_terminal(2)).await;
    assert_eq!(invoker.max_running.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn full_queue_drops_firing_and_audits() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::ZERO);
    let h = harness(
        invoker,
        DispatcherConfig {
            workers: 1,
            queue_capacity: 1,
            enqueue_timeout_ms: 50,
        },
    );
    // Workers not started, so the queue stays full.
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Skip)).await;

    h.dispatcher
        .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(2), false))
        .await
        .unwrap();
    assert_eq!(h.dispatcher.queue_depth(), 1);

    let err = h
        .dispatcher
        .enqueue(PendingExecution::scheduled(schedule.clone(), minutes_ago(1), false))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull));
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert_eq!(err.to_string(), "Execution queue is full, please try again");

    let audit = h.audit.0.lock().unwrap().clone();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::EnqueueTimeout);
    assert_eq!(audit[0].schedule_id, Some(schedule.id));
    assert!(h
        .store
        .list_executions(Some(schedule.id), 50)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missed_pass_enqueues_catch_up_and_advances() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::ZERO);
    let h = harness(invoker, workers(1));
    h.dispatcher.start();
    let schedule = create(
        &h.store,
        NewSchedule {
            catch_up_missed: Some(true),
            ..new_schedule(OverlapPolicy::Skip)
        },
    )
    .await;
    let overdue = minutes_ago(10);
    h.store
        .set_next_execution(schedule.id, Some(overdue))
        .await
        .unwrap();

    let loops = RecoveryLoops::new(h.store.clone(), h.dispatcher.clone(), RecoveryConfig::default());
    assert_eq!(loops.missed_pass().await.unwrap(), 1);

    let rows = wait_for(&h.store, schedule.id, 5, all_terminal(1)).await;
    assert_eq!(rows[0].scheduled_time, overdue);
    assert!(rows[0].is_catch_up);
    assert_eq!(rows[0].triggered_by, "catch_up");

    let refreshed = h.store.get_schedule(schedule.id).await.unwrap();
    assert!(refreshed.next_execution_at.unwrap() > now());
    assert_eq!(loops.missed_pass().await.unwrap(), 0);
}

#[tokio::test]
async fn retry_pass_picks_up_recent_failure_once() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::ZERO);
    let h = harness(invoker, workers(1));
    h.dispatcher.start();
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Skip)).await;
    let fired_at = minutes_ago(1);

    let first = h
        .store
        .record_execution_start(&NewExecution {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            scheduled_time: fired_at,
            attempt_count: 1,
            is_manual_trigger: false,
            is_catch_up: false,
            triggered_by: "scheduler".into(),
            metadata: None,
        })
        .await
        .unwrap();
    h.store
        .record_execution_terminal(first.id, &ExecutionResult::failed("boom", now()))
        .await
        .unwrap();

    let loops = RecoveryLoops::new(h.store.clone(), h.dispatcher.clone(), RecoveryConfig::default());
    assert_eq!(loops.retry_pass().await.unwrap(), 1);
    assert_eq!(loops.retry_pass().await.unwrap(), 0);

    let rows = wait_for(&h.store, schedule.id, 8, all_terminal(2)).await;
    let retry = rows.iter().find(|e| e.attempt_count == 2).unwrap();
    assert_eq!(retry.status, ExecutionStatus::Success);
    assert_eq!(retry.scheduled_time, fired_at);
    assert_eq!(retry.triggered_by, "retry");
    assert_eq!(loops.retry_pass().await.unwrap(), 0);
}

#[tokio::test]
async fn shutdown_fails_abandoned_executions() {
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::from_secs(3600));
    let h = harness(invoker, workers(1));
    h.dispatcher.start();
    let schedule = create(&h.store, new_schedule(OverlapPolicy::Skip)).await;

    let id = h
        .dispatcher
        .enqueue(PendingExecution::manual(schedule.clone(), "alice"))
        .await
        .unwrap();
    wait_for(&h.store, schedule.id, 5, |rows| {
        rows.iter().any(|e| e.status == ExecutionStatus::Running)
    })
    .await;

    h.dispatcher.shutdown(Duration::from_millis(200)).await;

    let execution = h.store.get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_message.as_deref(), Some(SHUTDOWN_ERROR));
    assert!(h.notifier.0.lock().unwrap().is_empty());

    let err = h
        .dispatcher
        .enqueue(PendingExecution::manual(schedule, "alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ShuttingDown));
}

fn scheduler(store: Arc<dyn Store>, invoker: Arc<StubInvoker>) -> Scheduler {
    let config = CadenceConfig {
        shutdown_budget_secs: 1,
        ..Default::default()
    };
    Scheduler::new(
        store,
        invoker,
        Arc::new(RecordingAudit::default()),
        Arc::new(RecordingNotifier::default()),
        &config,
    )
}

#[tokio::test]
async fn manual_triggers_ignore_overlap_and_enabled() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::from_millis(500));
    let scheduler = scheduler(store.clone(), invoker.clone());
    let schedule = create(
        &store,
        NewSchedule {
            enabled: Some(false),
            ..new_schedule(OverlapPolicy::Skip)
        },
    )
    .await;
    scheduler.start().await.unwrap();
    assert!(scheduler.next_fire(schedule.id).is_none());

    let a = scheduler.trigger(schedule.id, "alice").await.unwrap();
    let b = scheduler.trigger(schedule.id, "alice").await.unwrap();
    assert_ne!(a, b);

    let rows = wait_for(&store, schedule.id, 5, all_terminal(2)).await;
    assert!(rows.iter().all(|e| e.status == ExecutionStatus::Success));
    assert!(rows.iter().all(|e| e.is_manual_trigger && e.triggered_by == "alice"));
    assert_eq!(invoker.max_running.load(Ordering::SeqCst), 2);

    let missing = scheduler.trigger(Uuid::new_v4(), "alice").await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn start_fails_orphans_and_loads_active_schedules() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let schedule = create(&store, new_schedule(OverlapPolicy::Skip)).await;
    let orphan = store
        .record_execution_start(&NewExecution {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            scheduled_time: minutes_ago(5),
            attempt_count: 1,
            is_manual_trigger: false,
            is_catch_up: false,
            triggered_by: "scheduler".into(),
            metadata: None,
        })
        .await
        .unwrap();

    let scheduler = scheduler(
        store.clone(),
        StubInvoker::new(ExecutionStatus::Success, Duration::ZERO),
    );
    scheduler.start().await.unwrap();

    let failed = store.get_execution(orphan.id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some(RESTART_ERROR));
    assert!(scheduler.next_fire(schedule.id).is_some());

    scheduler.remove(schedule.id);
    assert!(scheduler.next_fire(schedule.id).is_none());
    scheduler.shutdown().await;
}

#[tokio::test]
async fn retry_execution_only_accepts_failures() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let invoker = StubInvoker::new(ExecutionStatus::Success, Duration::ZERO);
    let scheduler = scheduler(store.clone(), invoker);
    let schedule = create(&store, new_schedule(OverlapPolicy::Skip)).await;
    scheduler.start().await.unwrap();

    let first = scheduler.trigger(schedule.id, "alice").await.unwrap();
    wait_for(&store, schedule.id, 5, all_terminal(1)).await;
    let err = scheduler.retry_execution(first, "alice").await.unwrap_err();
    assert!(matches!(err, SchedulerError::NotRetryable { .. }));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let fired_at = minutes_ago(3);
    let failed = store
        .record_execution_start(&NewExecution {
            id: Uuid::new_v4(),
            schedule_id: schedule.id,
            scheduled_time: fired_at,
            attempt_count: 1,
            is_manual_trigger: false,
            is_catch_up: false,
            triggered_by: "scheduler".into(),
            metadata: None,
        })
        .await
        .unwrap();
    store
        .record_execution_terminal(failed.id, &ExecutionResult::failed("boom", now()))
        .await
        .unwrap();

    let retried = scheduler.retry_execution(failed.id, "bob").await.unwrap();
    wait_for(&store, schedule.id, 5, all_terminal(3)).await;
    let execution = store.get_execution(retried).await.unwrap();
    assert_eq!(execution.attempt_count, 2);
    assert_eq!(execution.scheduled_time, fired_at);
    assert_eq!(execution.triggered_by, "bob");
    assert!(execution.is_manual_trigger);
    scheduler.shutdown().await;
}
