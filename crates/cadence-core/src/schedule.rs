//! Write-side validation and defaults for [`Schedule`].

use std::collections::BTreeMap;
use std::time::Duration;

use cadence_cron::CronSchedule;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{OverlapPolicy, RetryStrategy, Schedule, ScheduleStatus, TargetType};

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_METHOD: &str = "POST";
pub const DEFAULT_PRIORITY: i32 = 5;
pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_TIMEOUT_SECS: i32 = 30;
pub const MAX_TIMEOUT_SECS: i32 = 3600;

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Body of a create request. Everything is optional at the type level so
/// missing required fields surface as [`CoreError::MissingField`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSchedule {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub target_method: Option<String>,
    #[serde(default)]
    pub target_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub target_payload: Option<Value>,
    #[serde(default)]
    pub target_workflow_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub catch_up_missed: Option<bool>,
}

impl NewSchedule {
    /// Apply defaults, validate, and stamp server-assigned fields.
    pub fn into_schedule(self, now: DateTime<Utc>) -> Result<Schedule> {
        let name = self.name.ok_or(CoreError::MissingField("name"))?;
        let cron_expression = self
            .cron_expression
            .ok_or(CoreError::MissingField("cron_expression"))?;
        let target_type = self
            .target_type
            .ok_or(CoreError::MissingField("target_type"))?;

        let mut schedule = Schedule {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name,
            description: self.description.unwrap_or_default(),
            owner: self.owner,
            team: self.team,
            tags: self.tags.unwrap_or_default(),
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY),
            cron_expression,
            timezone: self
                .timezone
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string()),
            target_type,
            target_url: self.target_url,
            target_method: self
                .target_method
                .unwrap_or_else(|| DEFAULT_METHOD.to_string()),
            target_headers: self.target_headers,
            target_payload: self.target_payload,
            target_workflow_id: self.target_workflow_id,
            enabled: self.enabled.unwrap_or(true),
            status: self.status.unwrap_or(ScheduleStatus::Active),
            overlap_policy: self.overlap_policy.unwrap_or(OverlapPolicy::Skip),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_strategy: self.retry_strategy.unwrap_or(RetryStrategy::Exponential),
            timeout_seconds: self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
            catch_up_missed: self.catch_up_missed.unwrap_or(false),
            created_at: now,
            updated_at: now,
            last_executed_at: None,
            next_execution_at: None,
        };
        schedule.normalize();
        schedule.validate()?;
        schedule.refresh_next_execution(now);
        Ok(schedule)
    }
}

/// Body of an update request. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub target_type: Option<TargetType>,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub target_method: Option<String>,
    #[serde(default)]
    pub target_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub target_payload: Option<Value>,
    #[serde(default)]
    pub target_workflow_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub status: Option<ScheduleStatus>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub retry_strategy: Option<RetryStrategy>,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub catch_up_missed: Option<bool>,
}

impl SchedulePatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }
}

macro_rules! patch_fields {
    ($target:expr, $patch:expr, plain: [$($p:ident),*], optional: [$($o:ident),*]) => {
        $(if let Some(v) = $patch.$p { $target.$p = v; })*
        $(if let Some(v) = $patch.$o { $target.$o = Some(v); })*
    };
}

impl Schedule {
    /// Apply `patch`, re-validate, and recompute the cached next firing.
    pub fn apply_patch(&mut self, patch: SchedulePatch, now: DateTime<Utc>) -> Result<()> {
        patch_fields!(self, patch,
            plain: [name, description, tags, priority, cron_expression, timezone, target_type,
                    target_method, enabled, status, overlap_policy, max_retries, retry_strategy,
                    timeout_seconds, catch_up_missed],
            optional: [owner, team, target_url, target_headers, target_payload, target_workflow_id]);
        self.normalize();
        self.validate()?;
        self.updated_at = now;
        self.refresh_next_execution(now);
        Ok(())
    }

    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.cron_expression = self.cron_expression.trim().to_string();
        self.timezone = self.timezone.trim().to_string();
        self.target_method = self.target_method.trim().to_string();
    }

    /// Write-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoreError::MissingField("name"));
        }
        CronSchedule::parse(&self.cron_expression).map_err(CoreError::InvalidCron)?;
        cadence_cron::parse_zone(&self.timezone)
            .map_err(|_| CoreError::InvalidTimezone(self.timezone.clone()))?;

        if !(1..=10).contains(&self.priority) {
            return Err(CoreError::InvalidArgument(
                "priority must be between 1 and 10".into(),
            ));
        }
        if self.max_retries < 0 {
            return Err(CoreError::InvalidArgument(
                "max_retries must not be negative".into(),
            ));
        }
        if self.retry_strategy == RetryStrategy::Other {
            return Err(CoreError::InvalidArgument(
                "retry_strategy must be one of exponential, linear, fixed".into(),
            ));
        }
        if !ALLOWED_METHODS
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&self.target_method))
        {
            return Err(CoreError::InvalidArgument(format!(
                "unsupported target_method: {}",
                self.target_method
            )));
        }
        if let Some(payload) = &self.target_payload {
            if !payload.is_object() {
                return Err(CoreError::InvalidArgument(
                    "target_payload must be a JSON object".into(),
                ));
            }
        }

        if self.target_type.uses_workflow_id() {
            if self.target_workflow_id.as_deref().is_none_or(str::is_empty) {
                return Err(CoreError::MissingField("target_workflow_id"));
            }
            if self.target_type == TargetType::Scenario {
                let id = self.target_workflow_id.as_deref().unwrap_or_default();
                if id.parse::<u16>().is_err() {
                    return Err(CoreError::InvalidArgument(
                        "scenario target_workflow_id must be a port number".into(),
                    ));
                }
            }
        } else {
            let url = self
                .target_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or(CoreError::MissingField("target_url"))?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::InvalidArgument(
                    "target_url must be an http(s) URL".into(),
                ));
            }
        }
        Ok(())
    }

    /// Only active, enabled schedules are held by the time wheel.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.status == ScheduleStatus::Active
    }

    /// The stored zone, or UTC when the stored name no longer resolves.
    pub fn zone(&self) -> Tz {
        cadence_cron::parse_zone(&self.timezone).unwrap_or_else(|_| {
            warn!(schedule_id = %self.id, timezone = %self.timezone, "unknown timezone, using UTC");
            Tz::UTC
        })
    }

    pub fn cron(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.cron_expression).map_err(CoreError::InvalidCron)
    }

    /// Next firing strictly after `after` in the schedule's zone.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let cron = self.cron().ok()?;
        let zone = self.zone();
        cron.next_after(&after.with_timezone(&zone))
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn refresh_next_execution(&mut self, now: DateTime<Utc>) {
        self.next_execution_at = if self.is_schedulable() {
            self.next_fire_after(now)
        } else {
            None
        };
    }

    /// Invocation deadline: clamped to 1..=3600 seconds, non-positive means
    /// the 30 second default.
    pub fn effective_timeout(&self) -> Duration {
        let secs = if self.timeout_seconds <= 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout_seconds.min(MAX_TIMEOUT_SECS)
        };
        Duration::from_secs(secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn nightly() -> NewSchedule {
        serde_json::from_value(json!({
            "name": "Nightly",
            "cron_expression": "0 2 * * *",
            "timezone": "UTC",
            "target_type": "webhook",
            "target_url": "http://example.com/run"
        }))
        .unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let s = nightly().into_schedule(at(12)).unwrap();
        assert_eq!(s.status, ScheduleStatus::Active);
        assert_eq!(s.overlap_policy, OverlapPolicy::Skip);
        assert_eq!(s.priority, 5);
        assert_eq!(s.target_method, "POST");
        assert!(s.enabled);
        assert_eq!(s.next_execution_at, Some(Utc.with_ymd_and_hms(2026, 4, 2, 2, 0, 0).unwrap()));
    }

    #[test]
    fn explicit_id_is_kept() {
        let id = Uuid::new_v4();
        let mut req = nightly();
        req.id = Some(id);
        assert_eq!(req.into_schedule(at(0)).unwrap().id, id);
    }

    #[test]
    fn invalid_cron_is_rejected_with_contract_message() {
        let mut req = nightly();
        req.cron_expression = Some("not a cron".into());
        let err = req.into_schedule(at(0)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidCron(_)));
        assert_eq!(err.to_string(), "Invalid cron expression");
    }

    #[test]
    fn missing_required_fields() {
        let mut req = nightly();
        req.name = None;
        assert!(matches!(req.into_schedule(at(0)), Err(CoreError::MissingField("name"))));

        let mut req = nightly();
        req.target_url = None;
        assert!(matches!(
            req.into_schedule(at(0)),
            Err(CoreError::MissingField("target_url"))
        ));

        let mut req = nightly();
        req.target_type = Some(TargetType::N8nWorkflow);
        assert!(matches!(
            req.into_schedule(at(0)),
            Err(CoreError::MissingField("target_workflow_id"))
        ));
    }

    #[test]
    fn target_method_is_stored_as_given() {
        let mut req = nightly();
        req.target_method = Some(" post ".into());
        let s = req.into_schedule(at(0)).unwrap();
        assert_eq!(s.target_method, "post");

        let mut req = nightly();
        req.target_method = Some("fetch".into());
        assert!(matches!(
            req.into_schedule(at(0)),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        let mut req = nightly();
        req.timezone = Some("Nowhere/City".into());
        assert!(matches!(req.into_schedule(at(0)), Err(CoreError::InvalidTimezone(_))));

        let mut req = nightly();
        req.priority = Some(11);
        assert!(req.into_schedule(at(0)).is_err());

        let mut req = nightly();
        req.target_payload = Some(json!([1, 2]));
        assert!(req.into_schedule(at(0)).is_err());

        let mut req = nightly();
        req.retry_strategy = Some(RetryStrategy::Other);
        assert!(req.into_schedule(at(0)).is_err());

        let mut req = nightly();
        req.target_type = Some(TargetType::Scenario);
        req.target_workflow_id = Some("not-a-port".into());
        assert!(req.into_schedule(at(0)).is_err());
    }

    #[test]
    fn disabled_schedule_has_no_next_execution() {
        let mut req = nightly();
        req.enabled = Some(false);
        assert_eq!(req.into_schedule(at(0)).unwrap().next_execution_at, None);
    }

    #[test]
    fn patch_keeps_absent_fields_and_recomputes_next() {
        let mut s = nightly().into_schedule(at(0)).unwrap();
        let patch = SchedulePatch {
            cron_expression: Some("0 5 * * *".into()),
            description: Some("moved".into()),
            ..Default::default()
        };
        s.apply_patch(patch, at(12)).unwrap();
        assert_eq!(s.name, "Nightly");
        assert_eq!(s.description, "moved");
        assert_eq!(s.updated_at, at(12));
        assert_eq!(s.next_execution_at, Some(Utc.with_ymd_and_hms(2026, 4, 2, 5, 0, 0).unwrap()));

        s.apply_patch(SchedulePatch::enabled(false), at(13)).unwrap();
        assert_eq!(s.next_execution_at, None);
    }

    #[test]
    fn patch_with_invalid_cron_fails() {
        let mut s = nightly().into_schedule(at(0)).unwrap();
        let patch = SchedulePatch {
            cron_expression: Some("61 * * * *".into()),
            ..Default::default()
        };
        assert!(matches!(s.apply_patch(patch, at(1)), Err(CoreError::InvalidCron(_))));
    }

    #[test]
    fn timeout_is_clamped() {
        let mut s = nightly().into_schedule(at(0)).unwrap();
        s.timeout_seconds = 0;
        assert_eq!(s.effective_timeout(), Duration::from_secs(30));
        s.timeout_seconds = -4;
        assert_eq!(s.effective_timeout(), Duration::from_secs(30));
        s.timeout_seconds = 99_999;
        assert_eq!(s.effective_timeout(), Duration::from_secs(3600));
        s.timeout_seconds = 1;
        assert_eq!(s.effective_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_stored_zone_falls_back_to_utc() {
        let mut s = nightly().into_schedule(at(0)).unwrap();
        s.timezone = "Atlantis/Capital".into();
        assert_eq!(s.zone(), Tz::UTC);
        assert_eq!(s.next_fire_after(at(3)), Some(Utc.with_ymd_and_hms(2026, 4, 2, 2, 0, 0).unwrap()));
    }
}
