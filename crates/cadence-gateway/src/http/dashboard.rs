use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use cadence_core::types::{now, DashboardStats};

use crate::app::AppState;
use crate::http::error::ApiResult;

/// GET /api/dashboard/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<DashboardStats>> {
    Ok(Json(state.store.dashboard_stats(now()).await?))
}
