use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use cadence_core::types::{AuditAction, AuditEntry, Execution};
use cadence_store::EXECUTION_LIST_CAP;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::http::error::ApiResult;
use crate::http::extract::ApiPath;
use crate::identity::Actor;

/// GET /api/executions: most recent first.
pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Execution>>> {
    Ok(Json(state.store.list_executions(None, EXECUTION_LIST_CAP).await?))
}

/// GET /api/executions/{id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.store.get_execution(id).await?))
}

/// POST /api/executions/{id}/retry: another attempt of a failed firing.
pub async fn retry(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<Uuid>,
    actor: Actor,
) -> ApiResult<Json<Value>> {
    let execution_id = state.scheduler.retry_execution(id, &actor.name).await?;
    let schedule_id = state.store.get_execution(id).await?.schedule_id;
    info!(retry_of = %id, %execution_id, actor = %actor.name, "manual retry queued");
    state
        .audit(
            AuditEntry::new(Some(schedule_id), AuditAction::Triggered, actor.name.clone())
                .with_ip(actor.ip.clone())
                .with_details(json!({ "execution_id": execution_id, "retry_of": id })),
        )
        .await;
    Ok(Json(json!({ "result": "success", "execution_id": execution_id })))
}
