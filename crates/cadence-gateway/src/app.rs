use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use cadence_core::sinks::AuditSink;
use cadence_core::types::AuditEntry;
use cadence_scheduler::Scheduler;
use cadence_store::Store;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::http::{cron, dashboard, executions, extract, health, schedules};
use crate::identity::IdentityProvider;

/// Shared state handed to every handler as `Arc<AppState>`.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scheduler: Scheduler,
    pub audit: Arc<dyn AuditSink>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Scheduler,
        audit: Arc<dyn AuditSink>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            store,
            scheduler,
            audit,
            identity,
        }
    }

    /// Best-effort; sink failures are logged by the sink.
    pub async fn audit(&self, entry: AuditEntry) {
        self.audit.record(entry).await;
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/system/db-status", get(health::db_status))
        .route("/api/schedules", get(schedules::list).post(schedules::create))
        .route(
            "/api/schedules/{id}",
            get(schedules::get)
                .put(schedules::update)
                .delete(schedules::delete),
        )
        .route("/api/schedules/{id}/enable", post(schedules::enable))
        .route("/api/schedules/{id}/disable", post(schedules::disable))
        .route("/api/schedules/{id}/trigger", post(schedules::trigger))
        .route("/api/schedules/{id}/executions", get(schedules::executions))
        .route("/api/schedules/{id}/metrics", get(schedules::metrics))
        .route("/api/schedules/{id}/next-runs", get(schedules::next_runs))
        .route("/api/schedules/{id}/audit", get(schedules::audit))
        .route("/api/executions", get(executions::list))
        .route("/api/executions/{id}", get(executions::get))
        .route("/api/executions/{id}/retry", post(executions::retry))
        .route("/api/dashboard/stats", get(dashboard::stats))
        .route("/api/cron/validate", get(cron::validate))
        .route("/api/cron/presets", get(cron::presets))
        .route("/api/timezones", get(cron::timezones))
        .route_layer(middleware::from_fn(extract::require_json_body))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
