use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use cadence_core::types::{now, CronPreset};
use cadence_cron::CronSchedule;
use chrono_tz::TZ_VARIANTS;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::http::error::{ApiError, ApiResult};
use crate::http::extract::ApiQuery;

pub const VALIDATE_RUNS_COUNT: usize = 3;

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub expression: Option<String>,
    /// Zone the preview is computed in; UTC when absent.
    pub timezone: Option<String>,
}

/// GET /api/cron/validate?expression=...
///
/// An unparseable expression is still a 200 with `valid: false`.
pub async fn validate(ApiQuery(query): ApiQuery<ValidateQuery>) -> ApiResult<Json<Value>> {
    let expression = query
        .expression
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("expression is required"))?;
    let zone = match query.timezone.as_deref() {
        Some(name) => cadence_cron::parse_zone(name)
            .map_err(|_| ApiError::bad_request(format!("Invalid timezone: {name}")))?,
        None => chrono_tz::Tz::UTC,
    };

    Ok(Json(match CronSchedule::parse(&expression) {
        Ok(cron) => json!({
            "expression": expression,
            "valid": true,
            "next_runs": cadence_cron::next_runs(&cron, zone, now(), VALIDATE_RUNS_COUNT),
        }),
        Err(e) => json!({
            "expression": expression,
            "valid": false,
            "next_runs": [],
            "error": e.to_string(),
        }),
    }))
}

/// GET /api/cron/presets
pub async fn presets(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<CronPreset>>> {
    Ok(Json(state.store.list_presets().await?))
}

/// GET /api/timezones: every IANA name the cron engine accepts.
pub async fn timezones() -> Json<Vec<&'static str>> {
    Json(TZ_VARIANTS.iter().map(|tz| tz.name()).collect())
}
