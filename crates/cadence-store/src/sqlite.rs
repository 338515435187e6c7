//! Embedded backend on a single SQLite connection.
//!
//! All statements run under one mutex, which also makes every multi-step
//! operation (patching a schedule, folding metrics) serialisable.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cadence_core::metrics::{ExecutionOutcome, ScheduleMetrics};
use cadence_core::schedule::{NewSchedule, SchedulePatch};
use cadence_core::types::{
    now, AuditEntry, CronPreset, DashboardStats, Execution, ExecutionResult, ExecutionStatus,
    NewExecution, RetryStrategy, Schedule, ScheduleFilter,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::presets::SYSTEM_PRESETS;
use crate::store::{RetryCandidate, Store};

const SCHEDULE_COLUMNS: &str = "id, name, description, owner, team, tags, priority, \
    cron_expression, timezone, target_type, target_url, target_method, target_headers, \
    target_payload, target_workflow_id, enabled, status, overlap_policy, max_retries, \
    retry_strategy, timeout_seconds, catch_up_missed, created_at, updated_at, \
    last_executed_at, next_execution_at";

const EXECUTION_COLUMNS: &str = "id, schedule_id, scheduled_time, start_time, end_time, \
    duration_ms, status, attempt_count, response_code, response_body, response_truncated, \
    error_message, is_manual_trigger, is_catch_up, triggered_by, metadata, created_at";

/// Create the schema and seed presets. A no-op when `schedules` exists.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schedules')",
        [],
        |row| row.get(0),
    )?;
    if exists {
        return Ok(());
    }

    conn.execute_batch(
        "
        CREATE TABLE schedules (
            id                 TEXT    NOT NULL PRIMARY KEY,
            name               TEXT    NOT NULL,
            description        TEXT    NOT NULL DEFAULT '',
            owner              TEXT,
            team               TEXT,
            tags               TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            priority           INTEGER NOT NULL DEFAULT 5,
            cron_expression    TEXT    NOT NULL,
            timezone           TEXT    NOT NULL DEFAULT 'UTC',
            target_type        TEXT    NOT NULL,
            target_url         TEXT,
            target_method      TEXT    NOT NULL DEFAULT 'POST',
            target_headers     TEXT,                           -- JSON object
            target_payload     TEXT,                           -- JSON object
            target_workflow_id TEXT,
            enabled            INTEGER NOT NULL DEFAULT 1,
            status             TEXT    NOT NULL DEFAULT 'active',
            overlap_policy     TEXT    NOT NULL DEFAULT 'skip',
            max_retries        INTEGER NOT NULL DEFAULT 3,
            retry_strategy     TEXT    NOT NULL DEFAULT 'exponential',
            timeout_seconds    INTEGER NOT NULL DEFAULT 30,
            catch_up_missed    INTEGER NOT NULL DEFAULT 0,
            created_at         TEXT    NOT NULL,
            updated_at         TEXT    NOT NULL,
            last_executed_at   TEXT,
            next_execution_at  TEXT
        ) STRICT;

        CREATE TABLE executions (
            id                 TEXT    NOT NULL PRIMARY KEY,
            schedule_id        TEXT    NOT NULL REFERENCES schedules (id) ON DELETE CASCADE,
            scheduled_time     TEXT    NOT NULL,
            start_time         TEXT,
            end_time           TEXT,
            duration_ms        INTEGER,
            status             TEXT    NOT NULL,
            attempt_count      INTEGER NOT NULL DEFAULT 1,
            response_code      INTEGER,
            response_body      TEXT,
            response_truncated INTEGER NOT NULL DEFAULT 0,
            error_message      TEXT,
            is_manual_trigger  INTEGER NOT NULL DEFAULT 0,
            is_catch_up        INTEGER NOT NULL DEFAULT 0,
            triggered_by       TEXT    NOT NULL,
            metadata           TEXT,
            created_at         TEXT    NOT NULL,
            UNIQUE (schedule_id, scheduled_time, attempt_count)
        ) STRICT;
        CREATE INDEX idx_executions_schedule ON executions (schedule_id);
        CREATE INDEX idx_executions_status ON executions (status);

        CREATE TABLE schedule_metrics (
            schedule_id          TEXT    NOT NULL PRIMARY KEY
                                 REFERENCES schedules (id) ON DELETE CASCADE,
            total_executions     INTEGER NOT NULL DEFAULT 0,
            success_count        INTEGER NOT NULL DEFAULT 0,
            failure_count        INTEGER NOT NULL DEFAULT 0,
            success_rate         REAL    NOT NULL DEFAULT 0,
            avg_duration_ms      REAL    NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            health_score         INTEGER NOT NULL DEFAULT 100,
            last_success_at      TEXT,
            last_failure_at      TEXT,
            updated_at           TEXT
        ) STRICT;

        CREATE TABLE cron_presets (
            id          TEXT    NOT NULL PRIMARY KEY,
            name        TEXT    NOT NULL UNIQUE,
            description TEXT    NOT NULL DEFAULT '',
            expression  TEXT    NOT NULL,
            category    TEXT    NOT NULL,
            is_system   INTEGER NOT NULL DEFAULT 0,
            usage_count INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Append-only; outlives the schedules it mentions.
        CREATE TABLE audit_log (
            id           TEXT NOT NULL PRIMARY KEY,
            schedule_id  TEXT,
            action       TEXT NOT NULL,
            performed_by TEXT NOT NULL,
            ip_address   TEXT,
            details      TEXT,
            occurred_at  TEXT NOT NULL
        ) STRICT;
        CREATE INDEX idx_audit_schedule ON audit_log (schedule_id, occurred_at);
        ",
    )?;

    for (name, description, expression, category) in SYSTEM_PRESETS {
        conn.execute(
            "INSERT INTO cron_presets (id, name, description, expression, category, is_system)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![Uuid::new_v4().to_string(), name, description, expression, category],
        )?;
    }
    info!(presets = SYSTEM_PRESETS.len(), "sqlite schema initialised");
    Ok(())
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal("sqlite connection mutex poisoned".into()))
    }
}

// --- encoding helpers -------------------------------------------------------

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: &Option<DateTime<Utc>>) -> Option<String> {
    t.as_ref().map(ts)
}

fn json_text<T: serde::Serialize>(v: &Option<T>) -> Result<Option<String>> {
    v.as_ref()
        .map(|v| serde_json::to_string(v).map_err(|e| StoreError::Internal(e.to_string())))
        .transpose()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn col_parse<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| conversion_error(idx, e.to_string()))
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => col_ts(row, idx).map(Some),
        None => Ok(None),
    }
}

fn col_json<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, e.to_string())),
        None => Ok(None),
    }
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let tags: Option<Vec<String>> = col_json(row, 5)?;
    let strategy: String = row.get(19)?;
    Ok(Schedule {
        id: col_parse(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner: row.get(3)?,
        team: row.get(4)?,
        tags: tags.unwrap_or_default(),
        priority: row.get(6)?,
        cron_expression: row.get(7)?,
        timezone: row.get(8)?,
        target_type: col_parse(row, 9)?,
        target_url: row.get(10)?,
        target_method: row.get(11)?,
        target_headers: col_json(row, 12)?,
        target_payload: col_json(row, 13)?,
        target_workflow_id: row.get(14)?,
        enabled: row.get(15)?,
        status: col_parse(row, 16)?,
        overlap_policy: col_parse(row, 17)?,
        max_retries: row.get(18)?,
        retry_strategy: RetryStrategy::from_stored(&strategy),
        timeout_seconds: row.get(20)?,
        catch_up_missed: row.get(21)?,
        created_at: col_ts(row, 22)?,
        updated_at: col_ts(row, 23)?,
        last_executed_at: col_opt_ts(row, 24)?,
        next_execution_at: col_opt_ts(row, 25)?,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: col_parse(row, 0)?,
        schedule_id: col_parse(row, 1)?,
        scheduled_time: col_ts(row, 2)?,
        start_time: col_opt_ts(row, 3)?,
        end_time: col_opt_ts(row, 4)?,
        duration_ms: row.get(5)?,
        status: col_parse(row, 6)?,
        attempt_count: row.get(7)?,
        response_code: row.get(8)?,
        response_body: row.get(9)?,
        response_truncated: row.get(10)?,
        error_message: row.get(11)?,
        is_manual_trigger: row.get(12)?,
        is_catch_up: row.get(13)?,
        triggered_by: row.get(14)?,
        metadata: col_json::<Value>(row, 15)?,
        created_at: col_ts(row, 16)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let schedule_id: Option<String> = row.get(1)?;
    Ok(AuditEntry {
        id: col_parse(row, 0)?,
        schedule_id: schedule_id
            .map(|s| s.parse().map_err(|e: uuid::Error| conversion_error(1, e.to_string())))
            .transpose()?,
        action: col_parse(row, 2)?,
        performed_by: row.get(3)?,
        ip_address: row.get(4)?,
        details: col_json(row, 5)?,
        occurred_at: col_ts(row, 6)?,
    })
}

fn metrics_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleMetrics> {
    Ok(ScheduleMetrics {
        schedule_id: col_parse(row, 0)?,
        total_executions: row.get(1)?,
        success_count: row.get(2)?,
        failure_count: row.get(3)?,
        success_rate: row.get(4)?,
        avg_duration_ms: row.get(5)?,
        consecutive_failures: row.get(6)?,
        health_score: row.get(7)?,
        last_success_at: col_opt_ts(row, 8)?,
        last_failure_at: col_opt_ts(row, 9)?,
        updated_at: col_opt_ts(row, 10)?,
    })
}

// --- statement helpers on a locked connection ------------------------------

fn load_schedule(conn: &Connection, id: Uuid) -> Result<Schedule> {
    conn.query_row(
        &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
        [id.to_string()],
        schedule_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::schedule_not_found(id))
}

fn load_execution(conn: &Connection, id: Uuid) -> Result<Execution> {
    conn.query_row(
        &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
        [id.to_string()],
        execution_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::execution_not_found(id))
}

fn query_schedules(conn: &Connection, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Schedule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCHEDULE_COLUMNS} FROM schedules {where_clause}"
    ))?;
    let rows = stmt
        .query_map(args, schedule_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn write_schedule(conn: &Connection, s: &Schedule, insert: bool) -> Result<()> {
    let sql = if insert {
        format!(
            "INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES \
             (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26)"
        )
    } else {
        "UPDATE schedules SET name=?2, description=?3, owner=?4, team=?5, tags=?6, priority=?7,
            cron_expression=?8, timezone=?9, target_type=?10, target_url=?11, target_method=?12,
            target_headers=?13, target_payload=?14, target_workflow_id=?15, enabled=?16,
            status=?17, overlap_policy=?18, max_retries=?19, retry_strategy=?20,
            timeout_seconds=?21, catch_up_missed=?22, created_at=?23, updated_at=?24,
            last_executed_at=?25, next_execution_at=?26
         WHERE id=?1"
            .to_string()
    };
    conn.execute(
        &sql,
        params![
            s.id.to_string(),
            s.name,
            s.description,
            s.owner,
            s.team,
            serde_json::to_string(&s.tags).map_err(|e| StoreError::Internal(e.to_string()))?,
            s.priority,
            s.cron_expression,
            s.timezone,
            s.target_type.as_str(),
            s.target_url,
            s.target_method,
            json_text(&s.target_headers)?,
            json_text(&s.target_payload)?,
            s.target_workflow_id,
            s.enabled,
            s.status.as_str(),
            s.overlap_policy.as_str(),
            s.max_retries,
            s.retry_strategy.as_str(),
            s.timeout_seconds,
            s.catch_up_missed,
            ts(&s.created_at),
            ts(&s.updated_at),
            opt_ts(&s.last_executed_at),
            opt_ts(&s.next_execution_at),
        ],
    )?;
    Ok(())
}

fn insert_execution(
    conn: &Connection,
    exec: &NewExecution,
    status: ExecutionStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    let (end, duration) = if status.is_terminal() {
        (Some(ts(&at)), Some(0i64))
    } else {
        (None, None)
    };
    conn.execute(
        &format!(
            "INSERT INTO executions ({EXECUTION_COLUMNS}) VALUES
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, 0, NULL, ?9, ?10, ?11, ?12, ?4)"
        ),
        params![
            exec.id.to_string(),
            exec.schedule_id.to_string(),
            ts(&exec.scheduled_time),
            ts(&at),
            end,
            duration,
            status.as_str(),
            exec.attempt_count,
            exec.is_manual_trigger,
            exec.is_catch_up,
            exec.triggered_by,
            json_text(&exec.metadata)?,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    #[instrument(skip(self, new), fields(name = ?new.name))]
    async fn create_schedule(&self, new: NewSchedule) -> Result<Schedule> {
        let schedule = new.into_schedule(now())?;
        let conn = self.conn()?;
        write_schedule(&conn, &schedule, true)?;
        info!(schedule_id = %schedule.id, "schedule created");
        Ok(schedule)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule> {
        let conn = self.conn()?;
        load_schedule(&conn, id)
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        let all = query_schedules(&conn, "ORDER BY priority DESC, name ASC", &[])?;
        Ok(all.into_iter().filter(|s| filter.matches(s)).collect())
    }

    #[instrument(skip(self, patch))]
    async fn update_schedule(&self, id: Uuid, patch: SchedulePatch) -> Result<Schedule> {
        let conn = self.conn()?;
        let mut schedule = load_schedule(&conn, id)?;
        schedule.apply_patch(patch, now())?;
        write_schedule(&conn, &schedule, false)?;
        info!(schedule_id = %id, "schedule updated");
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM schedules WHERE id = ?1", [id.to_string()])?;
        if n == 0 {
            return Err(StoreError::schedule_not_found(id));
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    async fn count_schedules(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM schedules", [], |row| row.get(0))?)
    }

    async fn set_next_execution(&self, id: Uuid, next: Option<DateTime<Utc>>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE schedules SET next_execution_at = ?2 WHERE id = ?1",
            params![id.to_string(), opt_ts(&next)],
        )?;
        Ok(())
    }

    #[instrument(skip(self, exec), fields(execution_id = %exec.id, schedule_id = %exec.schedule_id))]
    async fn record_execution_start(&self, exec: &NewExecution) -> Result<Execution> {
        let mut conn = self.conn()?;
        let started = now();
        let tx = conn.transaction()?;
        insert_execution(&tx, exec, ExecutionStatus::Running, started)?;
        tx.execute(
            "UPDATE schedules SET last_executed_at = ?2 WHERE id = ?1",
            params![exec.schedule_id.to_string(), ts(&started)],
        )?;
        tx.commit()?;
        load_execution(&conn, exec.id)
    }

    async fn record_execution_skipped(&self, exec: &NewExecution) -> Result<Execution> {
        let conn = self.conn()?;
        insert_execution(&conn, exec, ExecutionStatus::Skipped, now())?;
        load_execution(&conn, exec.id)
    }

    #[instrument(skip(self, result), fields(execution_id = %id, status = %result.status))]
    async fn record_execution_terminal(&self, id: Uuid, result: &ExecutionResult) -> Result<Execution> {
        if !result.status.is_terminal() {
            return Err(StoreError::InvalidArgument(format!(
                "{} is not a terminal status",
                result.status
            )));
        }
        let conn = self.conn()?;
        let existing = load_execution(&conn, id)?;
        if existing.status.is_terminal() {
            if existing.status == result.status {
                return Ok(existing);
            }
            return Err(StoreError::Conflict(format!(
                "execution {id} is already {}",
                existing.status
            )));
        }

        let start = existing.start_time.unwrap_or(existing.created_at);
        let end = result.end_time.max(start);
        let duration = (end - start).num_milliseconds();
        conn.execute(
            "UPDATE executions SET status = ?2, response_code = ?3, response_body = ?4,
                response_truncated = ?5, error_message = ?6, end_time = ?7, duration_ms = ?8
             WHERE id = ?1 AND status IN ('pending', 'running')",
            params![
                id.to_string(),
                result.status.as_str(),
                result.response_code,
                result.response_body,
                result.response_truncated,
                result.error_message,
                ts(&end),
                duration,
            ],
        )?;
        load_execution(&conn, id)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        let conn = self.conn()?;
        load_execution(&conn, id)
    }

    async fn list_executions(&self, schedule_id: Option<Uuid>, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions
             WHERE ?1 IS NULL OR schedule_id = ?1
             ORDER BY created_at DESC, attempt_count DESC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![schedule_id.map(|id| id.to_string()), limit as i64],
                execution_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn has_running_execution(&self, schedule_id: Uuid) -> Result<bool> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM executions WHERE schedule_id = ?1 AND status = 'running')",
            [schedule_id.to_string()],
            |row| row.get(0),
        )?)
    }

    async fn latest_attempt(&self, schedule_id: Uuid, scheduled_time: DateTime<Utc>) -> Result<i32> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(attempt_count), 0) FROM executions
             WHERE schedule_id = ?1 AND scheduled_time = ?2",
            params![schedule_id.to_string(), ts(&scheduled_time)],
            |row| row.get(0),
        )?)
    }

    async fn fail_running_executions(&self, error: &str) -> Result<u64> {
        let conn = self.conn()?;
        let at = ts(&now());
        let n = conn.execute(
            "UPDATE executions SET status = 'failed', error_message = ?1, end_time = ?2,
                duration_ms = MAX(0, CAST((julianday(?2) - julianday(COALESCE(start_time, created_at)))
                                          * 86400000 AS INTEGER))
             WHERE status IN ('pending', 'running')",
            params![error, at],
        )?;
        Ok(n as u64)
    }

    async fn update_metrics(&self, schedule_id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut metrics = tx
            .query_row(
                "SELECT schedule_id, total_executions, success_count, failure_count, success_rate,
                        avg_duration_ms, consecutive_failures, health_score, last_success_at,
                        last_failure_at, updated_at
                 FROM schedule_metrics WHERE schedule_id = ?1",
                [schedule_id.to_string()],
                metrics_from_row,
            )
            .optional()?
            .unwrap_or_else(|| ScheduleMetrics::placeholder(schedule_id));
        metrics.record(outcome);
        tx.execute(
            "INSERT INTO schedule_metrics (schedule_id, total_executions, success_count,
                failure_count, success_rate, avg_duration_ms, consecutive_failures, health_score,
                last_success_at, last_failure_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT (schedule_id) DO UPDATE SET
                total_executions = excluded.total_executions,
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                success_rate = excluded.success_rate,
                avg_duration_ms = excluded.avg_duration_ms,
                consecutive_failures = excluded.consecutive_failures,
                health_score = excluded.health_score,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                updated_at = excluded.updated_at",
            params![
                schedule_id.to_string(),
                metrics.total_executions,
                metrics.success_count,
                metrics.failure_count,
                metrics.success_rate,
                metrics.avg_duration_ms,
                metrics.consecutive_failures,
                metrics.health_score,
                opt_ts(&metrics.last_success_at),
                opt_ts(&metrics.last_failure_at),
                opt_ts(&metrics.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_metrics(&self, schedule_id: Uuid) -> Result<Option<ScheduleMetrics>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT schedule_id, total_executions, success_count, failure_count, success_rate,
                        avg_duration_ms, consecutive_failures, health_score, last_success_at,
                        last_failure_at, updated_at
                 FROM schedule_metrics WHERE schedule_id = ?1",
                [schedule_id.to_string()],
                metrics_from_row,
            )
            .optional()?)
    }

    async fn find_active_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        query_schedules(&conn, "WHERE enabled = 1 AND status = 'active'", &[])
    }

    async fn find_failed_retryable(
        &self,
        now: DateTime<Utc>,
        window: Duration,
        limit: usize,
    ) -> Result<Vec<RetryCandidate>> {
        let conn = self.conn()?;
        let executions = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM executions e
                 JOIN schedules s ON s.id = e.schedule_id
                 WHERE e.status IN ('failed', 'timeout')
                   AND e.end_time > ?1
                   AND e.attempt_count < s.max_retries + 1
                   AND s.enabled = 1 AND s.status = 'active'
                   AND NOT EXISTS (
                       SELECT 1 FROM executions n
                       WHERE n.schedule_id = e.schedule_id AND n.created_at > e.created_at)
                 ORDER BY e.end_time ASC LIMIT ?2",
                EXECUTION_COLUMNS
                    .split(", ")
                    .map(|c| format!("e.{}", c.trim()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))?;
            let rows = stmt
                .query_map(params![ts(&(now - window)), limit as i64], execution_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        executions
            .into_iter()
            .map(|execution| {
                let schedule = load_schedule(&conn, execution.schedule_id)?;
                Ok(RetryCandidate { execution, schedule })
            })
            .collect()
    }

    async fn find_missed_firings(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<Schedule>> {
        let conn = self.conn()?;
        query_schedules(
            &conn,
            "WHERE enabled = 1 AND status = 'active' AND catch_up_missed = 1
               AND next_execution_at IS NOT NULL AND next_execution_at < ?1
               AND (last_executed_at IS NULL OR last_executed_at < next_execution_at)
             ORDER BY next_execution_at ASC",
            &[&ts(&(now - grace))],
        )
    }

    async fn list_presets(&self) -> Result<Vec<CronPreset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, expression, category, is_system, usage_count
             FROM cron_presets ORDER BY category, name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CronPreset {
                    id: col_parse(row, 0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    expression: row.get(3)?,
                    category: row.get(4)?,
                    is_system: row.get(5)?,
                    usage_count: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_log (id, schedule_id, action, performed_by, ip_address, details, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id.to_string(),
                entry.schedule_id.map(|id| id.to_string()),
                entry.action.as_str(),
                entry.performed_by,
                entry.ip_address,
                json_text(&entry.details)?,
                ts(&entry.occurred_at),
            ],
        )?;
        Ok(())
    }

    async fn list_audit(&self, schedule_id: Uuid, limit: usize) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, schedule_id, action, performed_by, ip_address, details, occurred_at
             FROM audit_log WHERE schedule_id = ?1 ORDER BY occurred_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![schedule_id.to_string(), limit as i64], audit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats> {
        let conn = self.conn()?;
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc())
            .unwrap_or(now);
        let (total, active, paused): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(enabled = 1 AND status = 'active'), 0),
                    COALESCE(SUM(enabled = 0 OR status = 'paused'), 0)
             FROM schedules",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let (today, running, failed): (i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(created_at >= ?1), 0),
                    COALESCE(SUM(status = 'running'), 0),
                    COALESCE(SUM(status IN ('failed', 'timeout') AND created_at >= ?2), 0)
             FROM executions",
            params![ts(&day_start), ts(&(now - Duration::hours(24)))],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let (rate, health): (f64, f64) = conn.query_row(
            "SELECT COALESCE(AVG(success_rate), 0.0), COALESCE(AVG(health_score), 100.0)
             FROM schedule_metrics",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(DashboardStats {
            total_schedules: total,
            active_schedules: active,
            paused_schedules: paused,
            executions_today: today,
            running_executions: running,
            failed_last_24h: failed,
            average_success_rate: rate,
            average_health_score: health,
        })
    }
}
