//! Production backend on a sqlx Postgres pool.

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use cadence_core::config::DatabaseConfig;
use cadence_core::metrics::{ExecutionOutcome, ScheduleMetrics, FAILURE_STREAK_FLOOR};
use cadence_core::schedule::{NewSchedule, SchedulePatch};
use cadence_core::types::{
    now, AuditEntry, CronPreset, DashboardStats, Execution, ExecutionResult, ExecutionStatus,
    NewExecution, RetryStrategy, Schedule, ScheduleFilter,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::PgExecutor;
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::connect::Backoff;
use crate::error::{Result, StoreError};
use crate::presets::SYSTEM_PRESETS;
use crate::store::{RetryCandidate, Store};

const SCHEMA: &str = r#"
CREATE TABLE schedules (
    id                 UUID PRIMARY KEY,
    name               TEXT NOT NULL,
    description        TEXT NOT NULL DEFAULT '',
    owner              TEXT,
    team               TEXT,
    tags               TEXT[] NOT NULL DEFAULT '{}',
    priority           INTEGER NOT NULL DEFAULT 5,
    cron_expression    TEXT NOT NULL,
    timezone           TEXT NOT NULL DEFAULT 'UTC',
    target_type        TEXT NOT NULL,
    target_url         TEXT,
    target_method      TEXT NOT NULL DEFAULT 'POST',
    target_headers     JSONB,
    target_payload     JSONB,
    target_workflow_id TEXT,
    enabled            BOOLEAN NOT NULL DEFAULT TRUE,
    status             TEXT NOT NULL DEFAULT 'active',
    overlap_policy     TEXT NOT NULL DEFAULT 'skip',
    max_retries        INTEGER NOT NULL DEFAULT 3,
    retry_strategy     TEXT NOT NULL DEFAULT 'exponential',
    timeout_seconds    INTEGER NOT NULL DEFAULT 30,
    catch_up_missed    BOOLEAN NOT NULL DEFAULT FALSE,
    created_at         TIMESTAMPTZ NOT NULL,
    updated_at         TIMESTAMPTZ NOT NULL,
    last_executed_at   TIMESTAMPTZ,
    next_execution_at  TIMESTAMPTZ
);

CREATE TABLE executions (
    id                 UUID PRIMARY KEY,
    schedule_id        UUID NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
    scheduled_time     TIMESTAMPTZ NOT NULL,
    start_time         TIMESTAMPTZ,
    end_time           TIMESTAMPTZ,
    duration_ms        BIGINT,
    status             TEXT NOT NULL,
    attempt_count      INTEGER NOT NULL DEFAULT 1,
    response_code      INTEGER,
    response_body      TEXT,
    response_truncated BOOLEAN NOT NULL DEFAULT FALSE,
    error_message      TEXT,
    is_manual_trigger  BOOLEAN NOT NULL DEFAULT FALSE,
    is_catch_up        BOOLEAN NOT NULL DEFAULT FALSE,
    triggered_by       TEXT NOT NULL,
    metadata           JSONB,
    created_at         TIMESTAMPTZ NOT NULL,
    UNIQUE (schedule_id, scheduled_time, attempt_count)
);
CREATE INDEX idx_executions_schedule ON executions (schedule_id);
CREATE INDEX idx_executions_status ON executions (status);

CREATE TABLE schedule_metrics (
    schedule_id          UUID PRIMARY KEY REFERENCES schedules (id) ON DELETE CASCADE,
    total_executions     BIGINT NOT NULL DEFAULT 0,
    success_count        BIGINT NOT NULL DEFAULT 0,
    failure_count        BIGINT NOT NULL DEFAULT 0,
    success_rate         DOUBLE PRECISION NOT NULL DEFAULT 0,
    avg_duration_ms      DOUBLE PRECISION NOT NULL DEFAULT 0,
    consecutive_failures BIGINT NOT NULL DEFAULT 0,
    health_score         INTEGER NOT NULL DEFAULT 100,
    last_success_at      TIMESTAMPTZ,
    last_failure_at      TIMESTAMPTZ,
    updated_at           TIMESTAMPTZ
);

CREATE TABLE cron_presets (
    id          UUID PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    expression  TEXT NOT NULL,
    category    TEXT NOT NULL,
    is_system   BOOLEAN NOT NULL DEFAULT FALSE,
    usage_count BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE audit_log (
    id           UUID PRIMARY KEY,
    schedule_id  UUID,
    action       TEXT NOT NULL,
    performed_by TEXT NOT NULL,
    ip_address   TEXT,
    details      JSONB,
    occurred_at  TIMESTAMPTZ NOT NULL
);
CREATE INDEX idx_audit_schedule ON audit_log (schedule_id, occurred_at);
"#;

const SCHEDULE_COLUMNS: &str = "id, name, description, owner, team, tags, priority, \
    cron_expression, timezone, target_type, target_url, target_method, target_headers, \
    target_payload, target_workflow_id, enabled, status, overlap_policy, max_retries, \
    retry_strategy, timeout_seconds, catch_up_missed, created_at, updated_at, \
    last_executed_at, next_execution_at";

const EXECUTION_COLUMNS: &str = "id, schedule_id, scheduled_time, start_time, end_time, \
    duration_ms, status, attempt_count, response_code, response_body, response_truncated, \
    error_message, is_manual_trigger, is_catch_up, triggered_by, metadata, created_at";

const METRICS_COLUMNS: &str = "schedule_id, total_executions, success_count, failure_count, \
    success_rate, avg_duration_ms, consecutive_failures, health_score, last_success_at, \
    last_failure_at, updated_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with retries, then create the schema if it is missing.
    pub async fn connect(
        options: PgConnectOptions,
        db: &DatabaseConfig,
        backoff: Backoff,
    ) -> Result<Self> {
        let mut attempt = 0;
        let pool = loop {
            attempt += 1;
            let result = PgPoolOptions::new()
                .max_connections(db.max_connections)
                .min_connections(db.min_idle)
                .max_lifetime(db.max_lifetime())
                .connect_with(options.clone())
                .await;
            match result {
                Ok(pool) => break pool,
                Err(e) if attempt < backoff.max_attempts => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = backoff.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "postgres connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "postgres unreachable after {attempt} attempts: {e}"
                    )));
                }
            }
        };
        info!(attempt, backend = "postgres", "store connected");

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT to_regclass('schedules') IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        if exists {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(SCHEMA).execute(&mut *tx).await?;
        for (name, description, expression, category) in SYSTEM_PRESETS {
            sqlx::query(
                "INSERT INTO cron_presets (id, name, description, expression, category, is_system)
                 VALUES ($1, $2, $3, $4, $5, TRUE)",
            )
            .bind(Uuid::new_v4())
            .bind(name)
            .bind(description)
            .bind(expression)
            .bind(category)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(presets = SYSTEM_PRESETS.len(), "postgres schema initialised");
        Ok(())
    }

    async fn load_schedule(&self, id: Uuid) -> Result<Schedule> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::schedule_not_found(id))?;
        schedule_from_row(&row)
    }

    async fn load_execution(&self, id: Uuid) -> Result<Execution> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::execution_not_found(id))?;
        execution_from_row(&row)
    }
}

/// Shared by the pool path and transactional callers.
async fn insert_execution<'e, E>(
    executor: E,
    exec: &NewExecution,
    status: ExecutionStatus,
    at: DateTime<Utc>,
) -> Result<Execution>
where
    E: PgExecutor<'e>,
{
    let (end, duration) = if status.is_terminal() {
        (Some(at), Some(0i64))
    } else {
        (None, None)
    };
    let row = sqlx::query(&format!(
        "INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES
         ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, FALSE, NULL, $9, $10, $11, $12, $4)
         RETURNING {EXECUTION_COLUMNS}"
    ))
    .bind(exec.id)
    .bind(exec.schedule_id)
    .bind(exec.scheduled_time)
    .bind(at)
    .bind(end)
    .bind(duration)
    .bind(status.as_str())
    .bind(exec.attempt_count)
    .bind(exec.is_manual_trigger)
    .bind(exec.is_catch_up)
    .bind(&exec.triggered_by)
    .bind(&exec.metadata)
    .fetch_one(executor)
    .await?;
    execution_from_row(&row)
}

fn parse_col<T>(row: &PgRow, col: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(col)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Internal(format!("column {col}: {e}")))
}

fn schedule_from_row(row: &PgRow) -> Result<Schedule> {
    let headers: Option<Json<BTreeMap<String, String>>> = row.try_get("target_headers")?;
    let strategy: String = row.try_get("retry_strategy")?;
    Ok(Schedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        owner: row.try_get("owner")?,
        team: row.try_get("team")?,
        tags: row.try_get("tags")?,
        priority: row.try_get("priority")?,
        cron_expression: row.try_get("cron_expression")?,
        timezone: row.try_get("timezone")?,
        target_type: parse_col(row, "target_type")?,
        target_url: row.try_get("target_url")?,
        target_method: row.try_get("target_method")?,
        target_headers: headers.map(|Json(h)| h),
        target_payload: row.try_get("target_payload")?,
        target_workflow_id: row.try_get("target_workflow_id")?,
        enabled: row.try_get("enabled")?,
        status: parse_col(row, "status")?,
        overlap_policy: parse_col(row, "overlap_policy")?,
        max_retries: row.try_get("max_retries")?,
        retry_strategy: RetryStrategy::from_stored(&strategy),
        timeout_seconds: row.try_get("timeout_seconds")?,
        catch_up_missed: row.try_get("catch_up_missed")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_executed_at: row.try_get("last_executed_at")?,
        next_execution_at: row.try_get("next_execution_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    Ok(Execution {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        scheduled_time: row.try_get("scheduled_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_ms: row.try_get("duration_ms")?,
        status: parse_col(row, "status")?,
        attempt_count: row.try_get("attempt_count")?,
        response_code: row.try_get("response_code")?,
        response_body: row.try_get("response_body")?,
        response_truncated: row.try_get("response_truncated")?,
        error_message: row.try_get("error_message")?,
        is_manual_trigger: row.try_get("is_manual_trigger")?,
        is_catch_up: row.try_get("is_catch_up")?,
        triggered_by: row.try_get("triggered_by")?,
        metadata: row.try_get::<Option<Value>, _>("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn metrics_from_row(row: &PgRow) -> Result<ScheduleMetrics> {
    Ok(ScheduleMetrics {
        schedule_id: row.try_get("schedule_id")?,
        total_executions: row.try_get("total_executions")?,
        success_count: row.try_get("success_count")?,
        failure_count: row.try_get("failure_count")?,
        success_rate: row.try_get("success_rate")?,
        avg_duration_ms: row.try_get("avg_duration_ms")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        health_score: row.try_get("health_score")?,
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        schedule_id: row.try_get("schedule_id")?,
        action: parse_col(row, "action")?,
        performed_by: row.try_get("performed_by")?,
        ip_address: row.try_get("ip_address")?,
        details: row.try_get::<Option<Value>, _>("details")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

/// Upsert that folds one outcome into `schedule_metrics` in one statement.
/// The insert branch carries a precomputed first row; the update branch
/// recomputes every derived column from the locked old row.
///
/// Binds: `$1` schedule id, `$2..$11` first-row values, `$12` success,
/// `$13` failure, `$14` duration ms, `$15` finished at.
fn metrics_upsert_sql() -> String {
    let succ = "(m.success_count + CASE WHEN $12 THEN 1 ELSE 0 END)";
    let fail = "(m.failure_count + CASE WHEN $13 THEN 1 ELSE 0 END)";
    let streak = "(CASE WHEN $12 THEN 0 WHEN $13 THEN m.consecutive_failures + 1 \
                  ELSE m.consecutive_failures END)";
    let floor = FAILURE_STREAK_FLOOR;
    format!(
        "INSERT INTO schedule_metrics AS m ({METRICS_COLUMNS})
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (schedule_id) DO UPDATE SET
            total_executions = m.total_executions + 1,
            success_count = {succ},
            failure_count = {fail},
            consecutive_failures = {streak},
            success_rate = {succ} * 100.0 / (m.total_executions + 1),
            avg_duration_ms = CASE WHEN $12 OR $13
                THEN (m.avg_duration_ms * (m.success_count + m.failure_count) + $14)
                     / (m.success_count + m.failure_count + 1)
                ELSE m.avg_duration_ms END,
            health_score = LEAST(100, GREATEST(0, ROUND((
                0.6 * CASE WHEN {succ} + {fail} > 0
                           THEN {succ} * 100.0 / ({succ} + {fail})
                           ELSE 100.0 END
                + 40.0 * (1 - LEAST(GREATEST({streak}, 0), {floor}) / {floor}.0)
            )::numeric)))::integer,
            last_success_at = CASE WHEN $12 THEN $15 ELSE m.last_success_at END,
            last_failure_at = CASE WHEN $13 THEN $15 ELSE m.last_failure_at END,
            updated_at = $15"
    )
}

#[async_trait]
impl Store for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, new), fields(name = ?new.name))]
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let s = new.into_schedule(now())?;
        sqlx::query(&format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
              $19, $20, $21, $22, $23, $24, $25, $26)"
        ))
        .bind(s.id)
        .bind(&s.name)
        .bind(&s.description)
        .bind(&s.owner)
        .bind(&s.team)
        .bind(&s.tags)
        .bind(s.priority)
        .bind(&s.cron_expression)
        .bind(&s.timezone)
        .bind(s.target_type.as_str())
        .bind(&s.target_url)
        .bind(&s.target_method)
        .bind(s.target_headers.as_ref().map(Json))
        .bind(&s.target_payload)
        .bind(&s.target_workflow_id)
        .bind(s.enabled)
        .bind(s.status.as_str())
        .bind(s.overlap_policy.as_str())
        .bind(s.max_retries)
        .bind(s.retry_strategy.as_str())
        .bind(s.timeout_seconds)
        .bind(s.catch_up_missed)
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.last_executed_at)
        .bind(s.next_execution_at)
        .execute(&self.pool)
        .await?;
        info!(schedule_id = %s.id, "schedule created");
        Ok(s)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule> {
        self.load_schedule(id).await
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE ($1::boolean IS NULL OR enabled = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR owner = $3)
               AND ($4::text IS NULL OR team = $4)
               AND ($5::text IS NULL OR $5 = ANY(tags))
             ORDER BY priority DESC, name ASC"
        ))
        .bind(filter.enabled)
        .bind(filter.status.as_ref().map(|s| s.as_str()))
        .bind(&filter.owner)
        .bind(&filter.team)
        .bind(&filter.tag)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    #[instrument(skip(self, patch))]
    async fn update_schedule(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::schedule_not_found(id))?;
        let mut s = schedule_from_row(&row)?;
        s.apply_patch(patch, now())?;

        sqlx::query(
            "UPDATE schedules SET name = $2, description = $3, owner = $4, team = $5, tags = $6,
                priority = $7, cron_expression = $8, timezone = $9, target_type = $10,
                target_url = $11, target_method = $12, target_headers = $13,
                target_payload = $14, target_workflow_id = $15, enabled = $16, status = $17,
                overlap_policy = $18, max_retries = $19, retry_strategy = $20,
                timeout_seconds = $21, catch_up_missed = $22, updated_at = $23,
                next_execution_at = $24
             WHERE id = $1",
        )
        .bind(s.id)
        .bind(&s.name)
        .bind(&s.description)
        .bind(&s.owner)
        .bind(&s.team)
        .bind(&s.tags)
        .bind(s.priority)
        .bind(&s.cron_expression)
        .bind(&s.timezone)
        .bind(s.target_type.as_str())
        .bind(&s.target_url)
        .bind(&s.target_method)
        .bind(s.target_headers.as_ref().map(Json))
        .bind(&s.target_payload)
        .bind(&s.target_workflow_id)
        .bind(s.enabled)
        .bind(s.status.as_str())
        .bind(s.overlap_policy.as_str())
        .bind(s.max_retries)
        .bind(s.retry_strategy.as_str())
        .bind(s.timeout_seconds)
        .bind(s.catch_up_missed)
        .bind(s.updated_at)
        .bind(s.next_execution_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(schedule_id = %id, "schedule updated");
        Ok(s)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        let done = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::schedule_not_found(id));
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    async fn count_schedules(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM schedules")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn set_next_execution(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE schedules SET next_execution_at = $2 WHERE id = $1")
            .bind(id)
            .bind(next)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, exec), fields(execution_id = %exec.id, schedule_id = %exec.schedule_id))]
    async fn record_execution_start(&self, exec: &NewExecution) -> Result<Execution> {
        let started = now();
        let mut tx = self.pool.begin().await?;
        let execution =
            insert_execution(&mut *tx, exec, ExecutionStatus::Running, started).await?;
        sqlx::query("UPDATE schedules SET last_executed_at = $2 WHERE id = $1")
            .bind(exec.schedule_id)
            .bind(started)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(execution)
    }

    async fn record_execution_skipped(&self, exec: &NewExecution) -> Result<Execution> {
        insert_execution(&self.pool, exec, ExecutionStatus::Skipped, now()).await
    }

    #[instrument(skip(self, result), fields(execution_id = %id, status = %result.status))]
    async fn record_execution_terminal(&self, id: Uuid, result: &ExecutionResult) -> Result<Execution> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvalidArgument(format!(
                "{} is not a terminal status",
                result.status
            )));
        }
        let row = sqlx::query(&format!(
            "UPDATE executions SET status = $2, response_code = $3, response_body = $4,
                response_truncated = $5, error_message = $6,
                end_time = GREATEST($7, COALESCE(start_time, created_at)),
                duration_ms = (EXTRACT(EPOCH FROM
                    GREATEST($7, COALESCE(start_time, created_at)) - COALESCE(start_time, created_at)
                ) * 1000)::bigint
             WHERE id = $1 AND status IN ('pending', 'running')
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(id)
        .bind(result.status.as_str())
        .bind(result.response_code)
        .bind(&result.response_body)
        .bind(result.response_truncated)
        .bind(&result.error_message)
        .bind(result.end_time)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => execution_from_row(&row),
            None => {
                let existing = self.load_execution(id).await?;
                if existing.status == result.status {
                    Ok(existing)
                } else {
                    Err(StoreError::Conflict(format!(
                        "execution {id} is already {}",
                        existing.status
                    )))
                }
            }
        }
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.load_execution(id).await
    }

    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Execution>> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE $1::uuid IS NULL OR schedule_id = $1
             ORDER BY created_at DESC, attempt_count DESC LIMIT $2"
        ))
        .bind(schedule_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn has_running_execution(&self, schedule_id: Uuid) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM executions WHERE schedule_id = $1 AND status = 'running')",
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn latest_attempt(&self, schedule_id: Uuid, scheduled_time: DateTime<Utc>) -> Result<i32> {
        Ok(sqlx::query_scalar(
            "SELECT COALESCE(MAX(attempt_count), 0) FROM executions
             WHERE schedule_id = $1 AND scheduled_time = $2",
        )
        .bind(schedule_id)
        .bind(scheduled_time)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn fail_running_executions(&self, error: &str) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE executions SET status = 'failed', error_message = $1, end_time = $2,
                duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM $2 - COALESCE(start_time, created_at)) * 1000)::bigint)
             WHERE status IN ('pending', 'running')",
        )
        .bind(error)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn update_metrics(&self, schedule_id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        let mut first = ScheduleMetrics::placeholder(schedule_id);
        first.record(outcome);
        let success = outcome.status == ExecutionStatus::Success;
        let failure = outcome.status.is_failure();
        sqlx::query(&metrics_upsert_sql())
            .bind(schedule_id)
            .bind(first.total_executions)
            .bind(first.success_count)
            .bind(first.failure_count)
            .bind(first.success_rate)
            .bind(first.avg_duration_ms)
            .bind(first.consecutive_failures)
            .bind(first.health_score)
            .bind(first.last_success_at)
            .bind(first.last_failure_at)
            .bind(first.updated_at)
            .bind(success)
            .bind(failure)
            .bind(outcome.duration_ms)
            .bind(outcome.finished_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_metrics(&self, schedule_id: Uuid) -> Result<Option<ScheduleMetrics>> {
        sqlx::query(&format!(
            "SELECT {METRICS_COLUMNS} FROM schedule_metrics WHERE schedule_id = $1"
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(metrics_from_row)
        .transpose()
    }

    async fn find_active_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE enabled AND status = 'active'"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn find_failed_retryable(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<RetryCandidate>> {
        let columns = EXECUTION_COLUMNS
            .split(',')
            .map(|c| format!("e.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = sqlx::query(&format!(
            "SELECT {columns} FROM executions e
             JOIN schedules s ON s.id = e.schedule_id
             WHERE e.status IN ('failed', 'timeout')
               AND e.end_time > $1
               AND e.attempt_count < s.max_retries + 1
               AND s.enabled AND s.status = 'active'
               AND NOT EXISTS (
                   SELECT 1 FROM executions n
                   WHERE n.schedule_id = e.schedule_id AND n.created_at > e.created_at)
             ORDER BY e.end_time ASC LIMIT $2"
        ))
        .bind(now - window)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let execution = execution_from_row(row)?;
            let schedule = self.load_schedule(execution.schedule_id).await?;
            candidates.push(RetryCandidate { execution, schedule });
        }
        Ok(candidates)
    }

    async fn find_missed_firings(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules
             WHERE enabled AND status = 'active' AND catch_up_missed
               AND next_execution_at IS NOT NULL AND next_execution_at < $1
               AND (last_executed_at IS NULL OR last_executed_at < next_execution_at)
             ORDER BY next_execution_at ASC"
        ))
        .bind(now - grace)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn list_presets(&self) -> Result<Vec<CronPreset>> {
        let rows = sqlx::query(
            "SELECT id, name, description, expression, category, is_system, usage_count
             FROM cron_presets ORDER BY category, name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<CronPreset> {
                Ok(CronPreset {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    expression: row.try_get("expression")?,
                    category: row.try_get("category")?,
                    is_system: row.try_get("is_system")?,
                    usage_count: row.try_get("usage_count")?,
                })
            })
            .collect()
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, schedule_id, action, performed_by, ip_address, details, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.id)
        .bind(entry.schedule_id)
        .bind(entry.action.as_str())
        .bind(&entry.performed_by)
        .bind(&entry.ip_address)
        .bind(&entry.details)
        .bind(entry.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, schedule_id: Uuid, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, schedule_id, action, performed_by, ip_address, details, occurred_at
             FROM audit_log WHERE schedule_id = $1 ORDER BY occurred_at DESC LIMIT $2",
        )
        .bind(schedule_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats> {
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM schedules) AS total,
                (SELECT COUNT(*) FROM schedules WHERE enabled AND status = 'active') AS active,
                (SELECT COUNT(*) FROM schedules WHERE NOT enabled OR status = 'paused') AS paused,
                (SELECT COUNT(*) FROM executions WHERE created_at >= $1) AS today,
                (SELECT COUNT(*) FROM executions WHERE status = 'running') AS running,
                (SELECT COUNT(*) FROM executions
                  WHERE status IN ('failed', 'timeout') AND created_at >= $2) AS failed,
                (SELECT COALESCE(AVG(success_rate), 0)::float8 FROM schedule_metrics) AS rate,
                (SELECT COALESCE(AVG(health_score), 100)::float8 FROM schedule_metrics) AS health",
        )
        .bind(day_start)
        .bind(now - Duration::hours(24))
        .fetch_one(&self.pool)
        .await?;
        Ok(DashboardStats {
            total_schedules: row.try_get("total")?,
            active_schedules: row.try_get("active")?,
            paused_schedules: row.try_get("paused")?,
            executions_today: row.try_get("today")?,
            running_executions: row.try_get("running")?,
            failed_last_24h: row.try_get("failed")?,
            average_success_rate: row.try_get("rate")?,
            average_health_score: row.try_get("health")?,
        })
    }
}
