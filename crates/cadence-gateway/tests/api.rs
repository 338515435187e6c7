use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use cadence_core::config::CadenceConfig;
use cadence_core::sinks::LogNotifier;
use cadence_gateway::{build_router, AppState, HeaderIdentity};
use cadence_scheduler::{HttpInvoker, Scheduler};
use cadence_store::{SqliteStore, Store, StoreAuditSink};
use chrono::{DateTime, Timelike, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app() -> Router {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let audit = Arc::new(StoreAuditSink::new(store.clone()));
    let config = CadenceConfig {
        shutdown_budget_secs: 1,
        ..Default::default()
    };
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(HttpInvoker::new().unwrap()),
        audit.clone(),
        Arc::new(LogNotifier),
        &config,
    );
    scheduler.start().await.unwrap();
    build_router(Arc::new(AppState::new(
        store,
        scheduler,
        audit,
        Arc::new(HeaderIdentity),
    )))
}

/// A target that answers every POST with 200.
async fn live_target() -> String {
    let target = Router::new().route("/run", post(|| async { r#"{"ok":true}"# }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, target).await.unwrap() });
    format!("http://{addr}/run")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    (status, body)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", "alice");
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send(app, request).await
}

fn nightly(url: &str) -> Value {
    json!({
        "name": "Nightly",
        "cron_expression": "0 2 * * *",
        "timezone": "UTC",
        "target_type": "webhook",
        "target_url": url,
    })
}

fn instants(value: &Value) -> Vec<DateTime<Utc>> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().parse().unwrap())
        .collect()
}

#[tokio::test]
async fn create_then_enumerate_next_runs() {
    let app = app().await;
    let (status, created) =
        call(&app, Method::POST, "/api/schedules", Some(nightly("http://example.com/run"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "active");
    assert_eq!(created["overlap_policy"], "skip");
    assert_eq!(created["priority"], 5);
    assert_eq!(created["target_method"], "POST");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::GET, &format!("/api/schedules/{id}/next-runs"), None).await;
    assert_eq!(status, StatusCode::OK);
    let runs = instants(&body["next_runs"]);
    assert_eq!(runs.len(), 5);
    for run in &runs {
        assert_eq!((run.hour(), run.minute(), run.second()), (2, 0, 0));
    }
    for pair in runs.windows(2) {
        assert_eq!(pair[1] - pair[0], chrono::Duration::days(1));
    }

    let (status, fetched) = call(&app, Method::GET, &format!("/api/schedules/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "Nightly");
    assert_eq!(fetched["target_url"], "http://example.com/run");
}

#[tokio::test]
async fn invalid_cron_is_rejected_without_a_row() {
    let app = app().await;
    let mut body = nightly("http://example.com/run");
    body["cron_expression"] = json!("not a cron");
    let (status, error) = call(&app, Method::POST, "/api/schedules", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error, json!({"error": "Invalid cron expression"}));

    let (_, list) = call(&app, Method::GET, "/api/schedules", None).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn bad_bodies_get_json_errors() {
    let app = app().await;

    let (status, error) = call(&app, Method::POST, "/api/schedules", Some(json!({"cron_expression": "@daily"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"].as_str().unwrap().contains("name"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/schedules")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, error) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error["error"].is_string());

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/schedules")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(nightly("http://example.com/run").to_string()))
        .unwrap();
    let (status, error) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert!(error["error"].is_string());

    let mut body = nightly("http://example.com/run");
    body["target_type"] = json!("ftp");
    let (status, _) = call(&app, Method::POST, "/api/schedules", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let app = app().await;
    let missing = uuid::Uuid::new_v4();
    for uri in [
        format!("/api/schedules/{missing}"),
        format!("/api/schedules/{missing}/metrics"),
        format!("/api/executions/{missing}"),
    ] {
        let (status, body) = call(&app, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].is_string());
    }
    let (status, _) = call(&app, Method::DELETE, &format!("/api/schedules/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, Method::POST, &format!("/api/schedules/{missing}/trigger"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&app, Method::GET, "/api/schedules/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn manual_trigger_produces_a_terminal_execution() {
    let app = app().await;
    let url = live_target().await;
    let (_, created) = call(&app, Method::POST, "/api/schedules", Some(nightly(&url))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::POST, &format!("/api/schedules/{id}/trigger"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "success");
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let execution = loop {
        let (status, execution) =
            call(&app, Method::GET, &format!("/api/executions/{execution_id}"), None).await;
        if status == StatusCode::OK
            && !matches!(execution["status"].as_str(), Some("pending" | "running"))
        {
            break execution;
        }
        assert!(tokio::time::Instant::now() < deadline, "execution never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(execution["status"], "success");
    assert_eq!(execution["is_manual_trigger"], true);
    assert_eq!(execution["triggered_by"], "alice");
    assert_eq!(execution["response_code"], 200);
    assert_eq!(execution["metadata"]["url"], url.as_str());

    let (_, listed) = call(&app, Method::GET, &format!("/api/schedules/{id}/executions"), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, all) = call(&app, Method::GET, "/api/executions", None).await;
    assert_eq!(all[0]["id"], execution_id.as_str());

    // Only failures can be retried.
    let (status, body) =
        call(&app, Method::POST, &format!("/api/executions/{execution_id}/retry"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let (_, metrics) = call(&app, Method::GET, &format!("/api/schedules/{id}/metrics"), None).await;
    assert_eq!(metrics["total_executions"], 1);
    assert_eq!(metrics["success_count"], 1);
}

#[tokio::test]
async fn cron_validation_previews_runs() {
    let app = app().await;
    let (status, body) = call(&app, Method::GET, "/api/cron/validate?expression=*/5%20*%20*%20*%20*", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["expression"], "*/5 * * * *");
    let runs = instants(&body["next_runs"]);
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[1] - runs[0], chrono::Duration::minutes(5));
    assert_eq!(runs[2] - runs[1], chrono::Duration::minutes(5));

    let (status, body) = call(&app, Method::GET, "/api/cron/validate?expression=61%20*%20*%20*%20*", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
    assert_eq!(body["next_runs"], json!([]));

    let (status, _) = call(&app, Method::GET, "/api/cron/validate", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn action_routes_reject_non_json_bodies() {
    let app = app().await;
    let (_, created) =
        call(&app, Method::POST, "/api/schedules", Some(nightly("http://example.com/run"))).await;
    let id = created["id"].as_str().unwrap().to_string();

    for action in ["disable", "enable", "trigger"] {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/schedules/{id}/{action}"))
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("please"))
            .unwrap();
        let (status, error) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE, "{action}");
        assert!(error["error"].is_string());
    }
    let (_, current) = call(&app, Method::GET, &format!("/api/schedules/{id}"), None).await;
    assert_eq!(current["enabled"], true);

    let (status, disabled) = call(
        &app,
        Method::POST,
        &format!("/api/schedules/{id}/disable"),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(disabled["enabled"], false);
}

#[tokio::test]
async fn toggles_deletes_and_audits() {
    let app = app().await;
    let (_, created) =
        call(&app, Method::POST, "/api/schedules", Some(nightly("http://example.com/run"))).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, disabled) = call(&app, Method::POST, &format!("/api/schedules/{id}/disable"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(disabled["enabled"], false);
    assert!(disabled["next_execution_at"].is_null());

    let (_, enabled) = call(&app, Method::POST, &format!("/api/schedules/{id}/enable"), None).await;
    assert_eq!(enabled["enabled"], true);
    assert!(enabled["next_execution_at"].is_string());

    let (status, updated) = call(
        &app,
        Method::PUT,
        &format!("/api/schedules/{id}"),
        Some(json!({"cron_expression": "30 4 * * *", "max_retries": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["cron_expression"], "30 4 * * *");
    assert_eq!(updated["max_retries"], 0);
    assert_eq!(updated["name"], "Nightly");

    let (status, _) = call(
        &app,
        Method::PUT,
        &format!("/api/schedules/{id}"),
        Some(json!({"cron_expression": "bogus"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::DELETE, &format!("/api/schedules/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::GET, &format!("/api/schedules/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, audit) = call(&app, Method::GET, &format!("/api/schedules/{id}/audit"), None).await;
    let actions: Vec<&str> = audit
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["deleted", "updated", "enabled", "disabled", "created"]);
    assert!(audit
        .as_array()
        .unwrap()
        .iter()
        .all(|e| e["performed_by"] == "alice"));
}

#[tokio::test]
async fn list_filters_and_metrics_placeholder() {
    let app = app().await;
    for (name, team) in [("a", "ops"), ("b", "data")] {
        let mut body = nightly("http://example.com/run");
        body["name"] = json!(name);
        body["team"] = json!(team);
        call(&app, Method::POST, "/api/schedules", Some(body)).await;
    }
    let (_, ops) = call(&app, Method::GET, "/api/schedules?team=ops", None).await;
    assert_eq!(ops.as_array().unwrap().len(), 1);
    assert_eq!(ops[0]["name"], "a");

    let id = ops[0]["id"].as_str().unwrap();
    let (status, metrics) = call(&app, Method::GET, &format!("/api/schedules/{id}/metrics"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["health_score"], 100);
    assert_eq!(metrics["total_executions"], 0);

    let (_, stats) = call(&app, Method::GET, "/api/dashboard/stats", None).await;
    assert_eq!(stats["total_schedules"], 2);
}

#[tokio::test]
async fn system_endpoints() {
    let app = app().await;
    let (status, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "cadence");
    assert!(health["version"].is_string());
    assert!(health["time"].is_string());

    let (status, db) = call(&app, Method::GET, "/api/system/db-status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(db["connected"], true);
    assert_eq!(db["schedule_count"], 0);

    let (_, presets) = call(&app, Method::GET, "/api/cron/presets", None).await;
    assert!(!presets.as_array().unwrap().is_empty());

    let (_, zones) = call(&app, Method::GET, "/api/timezones", None).await;
    assert!(zones.as_array().unwrap().iter().any(|z| z == "Europe/Berlin"));
}
