use async_trait::async_trait;
use cadence_core::metrics::{ExecutionOutcome, ScheduleMetrics};
use cadence_core::schedule::{NewSchedule, SchedulePatch};
use cadence_core::types::{
    AuditEntry, CronPreset, DashboardStats, Execution, ExecutionResult, NewExecution, Schedule,
    ScheduleFilter,
};
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;

/// `GET /api/executions` returns at most this many rows.
pub const EXECUTION_LIST_CAP: usize = 100;
/// `GET /api/schedules/{id}/executions` returns at most this many rows.
pub const SCHEDULE_EXECUTION_LIST_CAP: usize = 50;

/// A failed execution that still has retry budget, with its schedule.
#[derive(Debug, Clone)]
pub struct RetryCandidate {
    pub execution: Execution,
    pub schedule: Schedule,
}

/// Durable view of every entity. Implementations must be safe to share
/// across tasks.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short backend name for logs and status endpoints.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    // --- schedules ---------------------------------------------------------

    /// Apply defaults, validate, persist. Invalid cron is `InvalidArgument`.
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule>;
    async fn get_schedule(&self, id: Uuid) -> Result<Schedule>;
    /// Sorted by priority (highest first), then name.
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>>;
    async fn update_schedule(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule>;
    /// Hard delete; executions and metrics go with it.
    async fn delete_schedule(&self, id: Uuid) -> Result<()>;
    async fn count_schedules(&self) -> Result<i64>;
    async fn set_next_execution(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()>;

    // --- executions --------------------------------------------------------

    /// Insert a `running` row with `start_time = now` and stamp the
    /// schedule's `last_executed_at`. A duplicate attempt is a `Conflict`.
    async fn record_execution_start(&self, exec: &NewExecution) -> Result<Execution>;
    /// Insert a row that is already terminal with status `skipped`.
    async fn record_execution_skipped(&self, exec: &NewExecution) -> Result<Execution>;
    /// Move a non-terminal execution to a terminal state. Repeating the same
    /// terminal status is a no-op; a different one is a `Conflict`.
    async fn record_execution_terminal(&self, id: Uuid, result: &ExecutionResult) -> Result<Execution>;
    async fn get_execution(&self, id: Uuid) -> Result<Execution>;
    /// Most recent first.
    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Execution>>;
    async fn has_running_execution(&self, schedule_id: Uuid) -> Result<bool>;
    /// Highest `attempt_count` recorded for one firing, 0 when none.
    async fn latest_attempt(&self, schedule_id: Uuid, scheduled_time: DateTime<Utc>) -> Result<i32>;
    /// Fail every `running` execution with `error`. Used for rows orphaned
    /// by a crash. Returns the number of rows changed.
    async fn fail_running_executions(&self, error: &str) -> Result<u64>;

    // --- metrics -----------------------------------------------------------

    /// Atomic upsert folding one terminal outcome into the schedule's row.
    async fn update_metrics(&self, schedule_id: Uuid, outcome: &ExecutionOutcome) -> Result<()>;
    async fn get_metrics(&self, schedule_id: Uuid) -> Result<Option<ScheduleMetrics>>;

    // --- recovery queries --------------------------------------------------

    /// Enabled, active schedules.
    async fn find_active_schedules(&self) -> Result<Vec<Schedule>>;
    /// Failed or timed-out executions that ended after `now - window`, have
    /// retry budget left, and are the newest execution of their schedule.
    async fn find_failed_retryable(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<RetryCandidate>>;
    /// Catch-up schedules whose cached next firing is older than
    /// `now - grace` and has not run.
    async fn find_missed_firings(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<Schedule>>;

    // --- presets, audit, dashboard ----------------------------------------

    async fn list_presets(&self) -> Result<Vec<CronPreset>>;
    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;
    /// Most recent first.
    async fn list_audit(&self, schedule_id: Uuid, limit: usize) -> Result<Vec<AuditEntry>>;
    async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats>;
}
