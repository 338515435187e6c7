use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use cadence_core::types::now;
use serde_json::{json, Value};
use tracing::warn;

use crate::app::AppState;

pub const SERVICE_NAME: &str = "cadence";

/// GET /health: liveness only; never touches the store.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("CADENCE_GIT_SHA"),
        "time": now(),
    }))
}

/// GET /api/system/db-status
pub async fn db_status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let backend = state.store.backend();
    let check = async {
        state.store.ping().await?;
        state.store.count_schedules().await
    };
    match check.await {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({
                "connected": true,
                "backend": backend,
                "schedule_count": count,
            })),
        ),
        Err(e) => {
            warn!(backend, error = %e, "store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "connected": false,
                    "backend": backend,
                    "error": e.to_string(),
                })),
            )
        }
    }
}
