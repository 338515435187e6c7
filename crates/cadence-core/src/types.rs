use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wall-clock now, truncated to the microsecond precision of the stores so
/// values survive a round trip unchanged.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Closed string enumerations stored as TEXT and exchanged as JSON strings.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

string_enum! {
    /// What a schedule invokes when it fires.
    pub enum TargetType {
        Http => "http",
        Webhook => "webhook",
        /// Synthesizes `{N8N_BASE_URL}/webhook/{target_workflow_id}`.
        N8nWorkflow => "n8n_workflow",
        /// Synthesizes `http://localhost:{target_workflow_id}/api/execute`.
        Scenario => "scenario",
    }
}

impl TargetType {
    /// Variants addressed through `target_workflow_id` instead of a URL.
    pub fn uses_workflow_id(&self) -> bool {
        matches!(self, TargetType::N8nWorkflow | TargetType::Scenario)
    }
}

string_enum! {
    pub enum ScheduleStatus {
        Active => "active",
        Paused => "paused",
        Archived => "archived",
    }
}

string_enum! {
    /// What to do with a firing while an earlier execution is still running.
    pub enum OverlapPolicy {
        Skip => "skip",
        Allow => "allow",
        Queue => "queue",
    }
}

string_enum! {
    pub enum ExecutionStatus {
        Pending => "pending",
        Running => "running",
        Success => "success",
        Failed => "failed",
        Timeout => "timeout",
        Skipped => "skipped",
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Statuses that count against the failure bucket and may be retried.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Timeout)
    }
}

string_enum! {
    pub enum AuditAction {
        Created => "created",
        Updated => "updated",
        Enabled => "enabled",
        Disabled => "disabled",
        Triggered => "triggered",
        Deleted => "deleted",
        /// A firing was dropped because the dispatch queue stayed full.
        EnqueueTimeout => "enqueue_timeout",
    }
}

/// Backoff shape between attempts of one firing.
///
/// `Other` only appears for stored rows written with a strategy this build
/// does not know; new schedules must name one of the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Fixed,
    #[serde(other)]
    Other,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Other => "other",
        }
    }

    /// Lenient parse for stored values.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(RetryStrategy::Other)
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "exponential" => Ok(RetryStrategy::Exponential),
            "linear" => Ok(RetryStrategy::Linear),
            "fixed" => Ok(RetryStrategy::Fixed),
            other => Err(format!("unknown RetryStrategy: {other}")),
        }
    }
}

/// A durable schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub owner: Option<String>,
    pub team: Option<String>,
    pub tags: Vec<String>,
    /// 1-10; informational only.
    pub priority: i32,
    pub cron_expression: String,
    /// IANA zone name.
    pub timezone: String,
    pub target_type: TargetType,
    pub target_url: Option<String>,
    pub target_method: String,
    pub target_headers: Option<BTreeMap<String, String>>,
    pub target_payload: Option<Value>,
    pub target_workflow_id: Option<String>,
    pub enabled: bool,
    pub status: ScheduleStatus,
    pub overlap_policy: OverlapPolicy,
    pub max_retries: i32,
    pub retry_strategy: RetryStrategy,
    pub timeout_seconds: i32,
    pub catch_up_missed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
}

/// One attempt to invoke a schedule's target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    /// Nominal firing instant; shared by every attempt of one firing.
    pub scheduled_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: ExecutionStatus,
    pub attempt_count: i32,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub response_truncated: bool,
    pub error_message: Option<String>,
    pub is_manual_trigger: bool,
    pub is_catch_up: bool,
    pub triggered_by: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields a worker supplies when it claims a firing.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub scheduled_time: DateTime<Utc>,
    pub attempt_count: i32,
    pub is_manual_trigger: bool,
    pub is_catch_up: bool,
    pub triggered_by: String,
    pub metadata: Option<Value>,
}

/// Terminal write for an execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub response_truncated: bool,
    pub error_message: Option<String>,
    pub end_time: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>, end_time: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            response_code: None,
            response_body: None,
            response_truncated: false,
            error_message: Some(error.into()),
            end_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronPreset {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub expression: String,
    pub category: String,
    pub is_system: bool,
    pub usage_count: i64,
}

/// Append-only record of a control-plane action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub action: AuditAction,
    pub performed_by: String,
    pub ip_address: Option<String>,
    pub details: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(schedule_id: Option<Uuid>, action: AuditAction, performed_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            action,
            performed_by: performed_by.into(),
            ip_address: None,
            details: None,
            occurred_at: now(),
        }
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Filter for listing schedules. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleFilter {
    pub enabled: Option<bool>,
    pub status: Option<ScheduleStatus>,
    pub owner: Option<String>,
    pub team: Option<String>,
    pub tag: Option<String>,
}

impl ScheduleFilter {
    pub fn matches(&self, s: &Schedule) -> bool {
        self.enabled.is_none_or(|e| s.enabled == e)
            && self.status.is_none_or(|st| s.status == st)
            && self
                .owner
                .as_deref()
                .is_none_or(|o| s.owner.as_deref() == Some(o))
            && self
                .team
                .as_deref()
                .is_none_or(|t| s.team.as_deref() == Some(t))
            && self
                .tag
                .as_deref()
                .is_none_or(|t| s.tags.iter().any(|x| x == t))
    }
}

/// Aggregates for the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_schedules: i64,
    pub active_schedules: i64,
    pub paused_schedules: i64,
    pub executions_today: i64,
    pub running_executions: i64,
    pub failed_last_24h: i64,
    pub average_success_rate: f64,
    pub average_health_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for t in TargetType::ALL {
            assert_eq!(t.as_str().parse::<TargetType>().unwrap(), *t);
        }
        assert_eq!(
            serde_json::to_value(TargetType::N8nWorkflow).unwrap(),
            "n8n_workflow"
        );
        assert_eq!(AuditAction::EnqueueTimeout.to_string(), "enqueue_timeout");
        assert!("bogus".parse::<OverlapPolicy>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Timeout.is_failure());
        assert!(!ExecutionStatus::Skipped.is_failure());
    }

    #[test]
    fn unknown_stored_strategy_loads_as_other() {
        assert_eq!(RetryStrategy::from_stored("fibonacci"), RetryStrategy::Other);
        let parsed: RetryStrategy = serde_json::from_value("fibonacci".into()).unwrap();
        assert_eq!(parsed, RetryStrategy::Other);
        assert!("fibonacci".parse::<RetryStrategy>().is_err());
    }

    #[test]
    fn now_has_microsecond_precision() {
        assert_eq!(now().timestamp_subsec_nanos() % 1_000, 0);
    }
}
