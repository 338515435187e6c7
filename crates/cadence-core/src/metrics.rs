//! Per-schedule execution metrics and the health score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::ExecutionStatus;

/// Consecutive failures at which the streak component of the health score
/// bottoms out.
pub const FAILURE_STREAK_FLOOR: i64 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleMetrics {
    pub schedule_id: Uuid,
    pub total_executions: i64,
    pub success_count: i64,
    pub failure_count: i64,
    /// `success_count / total_executions * 100`, 0 when nothing ran.
    pub success_rate: f64,
    /// Mean duration over successful and failed executions.
    pub avg_duration_ms: f64,
    pub consecutive_failures: i64,
    pub health_score: i32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What a terminal execution contributes to its schedule's metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub duration_ms: i64,
    pub finished_at: DateTime<Utc>,
}

impl ScheduleMetrics {
    /// Zeroed row reported before a schedule has any terminal execution.
    pub fn placeholder(schedule_id: Uuid) -> Self {
        Self {
            schedule_id,
            total_executions: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            consecutive_failures: 0,
            health_score: 100,
            last_success_at: None,
            last_failure_at: None,
            updated_at: None,
        }
    }

    /// Fold one terminal outcome into the row.
    pub fn record(&mut self, outcome: &ExecutionOutcome) {
        let decided_before = self.success_count + self.failure_count;
        self.total_executions += 1;

        match outcome.status {
            ExecutionStatus::Success => {
                self.success_count += 1;
                self.consecutive_failures = 0;
                self.last_success_at = Some(outcome.finished_at);
            }
            s if s.is_failure() => {
                self.failure_count += 1;
                self.consecutive_failures += 1;
                self.last_failure_at = Some(outcome.finished_at);
            }
            _ => {}
        }

        let decided = self.success_count + self.failure_count;
        if decided > decided_before {
            self.avg_duration_ms = (self.avg_duration_ms * decided_before as f64
                + outcome.duration_ms as f64)
                / decided as f64;
        }
        self.success_rate = success_rate(self.success_count, self.total_executions);
        self.health_score = health_score(
            self.success_count,
            self.failure_count,
            self.consecutive_failures,
        );
        self.updated_at = Some(outcome.finished_at);
    }
}

pub fn success_rate(success: i64, total: i64) -> f64 {
    if total > 0 {
        success as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// 60% weight on the success ratio among decided executions, 40% on the
/// current failure streak (full at zero failures, gone at
/// [`FAILURE_STREAK_FLOOR`]). A schedule with no decided executions scores
/// 100.
///
/// The Postgres store evaluates the same formula in SQL; keep them in sync.
pub fn health_score(success: i64, failure: i64, consecutive_failures: i64) -> i32 {
    let decided = success + failure;
    let ratio = if decided > 0 {
        success as f64 / decided as f64 * 100.0
    } else {
        100.0
    };
    let streak = consecutive_failures.clamp(0, FAILURE_STREAK_FLOOR) as f64;
    let score = 0.6 * ratio + 40.0 * (1.0 - streak / FAILURE_STREAK_FLOOR as f64);
    score.round().clamp(0.0, 100.0) as i32
}
