//! `/api/schedules` CRUD and per-schedule actions. Every mutation keeps the
//! time wheel in step with the store and appends an audit entry.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use cadence_core::metrics::ScheduleMetrics;
use cadence_core::schedule::{NewSchedule, SchedulePatch};
use cadence_core::types::{now, AuditAction, AuditEntry, Execution, Schedule, ScheduleFilter};
use cadence_store::SCHEDULE_EXECUTION_LIST_CAP;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::http::error::ApiResult;
use crate::http::extract::{ApiJson, ApiPath, ApiQuery};
use crate::identity::Actor;

pub const NEXT_RUNS_COUNT: usize = 5;
pub const AUDIT_LIST_CAP: usize = 100;

fn audit_entry(id: Uuid, action: AuditAction, actor: &Actor) -> AuditEntry {
    AuditEntry::new(Some(id), action, actor.name.clone()).with_ip(actor.ip.clone())
}

/// Names of the fields a patch sets.
fn patched_fields(patch: &SchedulePatch) -> Vec<String> {
    match serde_json::to_value(patch) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, _)| k)
            .collect(),
        _ => Vec::new(),
    }
}

/// GET /api/schedules
pub async fn list(
    State(state): State<Arc<AppState>>,
    ApiQuery(filter): ApiQuery<ScheduleFilter>,
) -> ApiResult<Json<Vec<Schedule>>> {
    Ok(Json(state.store.list_schedules(&filter).await?))
}

/// POST /api/schedules
pub async fn create(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    ApiJson(new): ApiJson<NewSchedule>,
) -> ApiResult<(StatusCode, Json<Schedule>)> {
    let schedule = state.store.create_schedule(new).await?;
    state.scheduler.sync(&schedule);
    info!(schedule_id = %schedule.id, name = %schedule.name, actor = %actor.name, "schedule created");
    state
        .audit(
            audit_entry(schedule.id, AuditAction::Created, &actor)
                .with_details(json!({ "name": schedule.name, "cron_expression": schedule.cron_expression })),
        )
        .await;
    Ok((StatusCode::CREATED, Json(schedule)))
}

/// GET /api/schedules/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Schedule>> {
    Ok(Json(state.store.get_schedule(id).await?))
}

/// PUT /api/schedules/{id}
pub async fn update(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
    ApiJson(patch): ApiJson<SchedulePatch>,
) -> ApiResult<Json<Schedule>> {
    let fields = patched_fields(&patch);
    let schedule = state.store.update_schedule(id, patch).await?;
    state.scheduler.sync(&schedule);
    info!(schedule_id = %id, ?fields, actor = %actor.name, "schedule updated");
    state
        .audit(audit_entry(id, AuditAction::Updated, &actor).with_details(json!({ "fields": fields })))
        .await;
    Ok(Json(schedule))
}

/// DELETE /api/schedules/{id}
pub async fn delete(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
) -> ApiResult<Json<Value>> {
    state.store.delete_schedule(id).await?;
    state.scheduler.remove(id);
    info!(schedule_id = %id, actor = %actor.name, "schedule deleted");
    state.audit(audit_entry(id, AuditAction::Deleted, &actor)).await;
    Ok(Json(json!({ "result": "success", "id": id })))
}

async fn set_enabled(
    state: &AppState,
    id: Uuid,
    actor: &Actor,
    enabled: bool,
) -> ApiResult<Json<Schedule>> {
    let schedule = state
        .store
        .update_schedule(id, SchedulePatch::enabled(enabled))
        .await?;
    state.scheduler.sync(&schedule);
    let action = if enabled {
        AuditAction::Enabled
    } else {
        AuditAction::Disabled
    };
    info!(schedule_id = %id, %action, actor = %actor.name, "schedule toggled");
    state.audit(audit_entry(id, action, actor)).await;
    Ok(Json(schedule))
}

/// POST /api/schedules/{id}/enable
pub async fn enable(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
) -> ApiResult<Json<Schedule>> {
    set_enabled(&state, id, &actor, true).await
}

/// POST /api/schedules/{id}/disable
pub async fn disable(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
) -> ApiResult<Json<Schedule>> {
    set_enabled(&state, id, &actor, false).await
}

/// POST /api/schedules/{id}/trigger: queues a manual run; 503 when the
/// dispatcher queue stays full.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
) -> ApiResult<Json<Value>> {
    let execution_id = state.scheduler.trigger(id, &actor.name).await?;
    info!(schedule_id = %id, %execution_id, actor = %actor.name, "manual trigger queued");
    state
        .audit(
            audit_entry(id, AuditAction::Triggered, &actor)
                .with_details(json!({ "execution_id": execution_id })),
        )
        .await;
    Ok(Json(json!({ "result": "success", "execution_id": execution_id })))
}

/// GET /api/schedules/{id}/executions
pub async fn executions(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<Execution>>> {
    state.store.get_schedule(id).await?;
    let rows = state
        .store
        .list_executions(Some(id), SCHEDULE_EXECUTION_LIST_CAP)
        .await?;
    Ok(Json(rows))
}

/// GET /api/schedules/{id}/metrics: zeroed placeholder until the first
/// terminal execution.
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<ScheduleMetrics>> {
    state.store.get_schedule(id).await?;
    let metrics = state
        .store
        .get_metrics(id)
        .await?
        .unwrap_or_else(|| ScheduleMetrics::placeholder(id));
    Ok(Json(metrics))
}

/// GET /api/schedules/{id}/next-runs
pub async fn next_runs(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Value>> {
    let schedule = state.store.get_schedule(id).await?;
    let cron = schedule.cron()?;
    let runs = cadence_cron::next_runs(&cron, schedule.zone(), now(), NEXT_RUNS_COUNT);
    Ok(Json(json!({
        "schedule_id": id,
        "cron_expression": schedule.cron_expression,
        "timezone": schedule.timezone,
        "next_runs": runs,
    })))
}

/// GET /api/schedules/{id}/audit: entries outlive the schedule, so an
/// unknown id is an empty list.
pub async fn audit(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Vec<AuditEntry>>> {
    Ok(Json(state.store.list_audit(id, AUDIT_LIST_CAP).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patched_fields_lists_only_set_fields() {
        let patch = SchedulePatch {
            name: Some("renamed".into()),
            max_retries: Some(0),
            ..Default::default()
        };
        let mut fields = patched_fields(&patch);
        fields.sort();
        assert_eq!(fields, vec!["max_retries", "name"]);
        assert!(patched_fields(&SchedulePatch::default()).is_empty());
    }
}
