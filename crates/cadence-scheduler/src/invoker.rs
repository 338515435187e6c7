//! Outgoing calls to schedule targets.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::types::{now, ExecutionResult, ExecutionStatus, Schedule, TargetType};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Response bodies are persisted up to this many bytes.
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024;
/// Appended to a body cut at [`MAX_RESPONSE_BYTES`].
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// A schedule's target turned into a concrete request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub target_type: TargetType,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ResolvedTarget {
    /// `http`/`webhook` use the stored URL and method. `n8n_workflow` and
    /// `scenario` synthesize their URL from the workflow id and always POST.
    pub fn resolve(schedule: &Schedule, n8n_base_url: Option<&str>) -> Result<Self, String> {
        let workflow_id = || {
            schedule
                .target_workflow_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| "target_workflow_id is not set".to_string())
        };
        let (url, method) = match schedule.target_type {
            TargetType::Http | TargetType::Webhook => {
                let url = schedule
                    .target_url
                    .clone()
                    .ok_or_else(|| "target_url is not set".to_string())?;
                (url, schedule.target_method.to_ascii_uppercase())
            }
            TargetType::N8nWorkflow => {
                let base = n8n_base_url
                    .filter(|b| !b.is_empty())
                    .ok_or_else(|| "N8N_BASE_URL is not configured".to_string())?;
                let url = format!("{}/webhook/{}", base.trim_end_matches('/'), workflow_id()?);
                (url, "POST".to_string())
            }
            TargetType::Scenario => {
                let url = format!("http://localhost:{}/api/execute", workflow_id()?);
                (url, "POST".to_string())
            }
        };
        let body = schedule
            .target_payload
            .as_ref()
            .map(|p| serde_json::to_vec(p).map_err(|e| e.to_string()))
            .transpose()?;
        Ok(Self {
            target_type: schedule.target_type,
            url,
            method,
            headers: schedule.target_headers.clone().unwrap_or_default(),
            body,
            timeout: schedule.effective_timeout(),
        })
    }

    /// Stored on the execution row.
    pub fn metadata(&self) -> Value {
        json!({
            "url": self.url,
            "method": self.method,
            "target_type": self.target_type,
        })
    }
}

/// Performs one invocation. Never fails: every outcome, including network
/// errors and deadlines, is reported as an [`ExecutionResult`].
#[async_trait]
pub trait TargetInvoker: Send + Sync {
    async fn invoke(&self, target: &ResolvedTarget) -> ExecutionResult;
}

pub struct HttpInvoker {
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn build_headers(target: &ResolvedTarget) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &target.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, url = %target.url, "skipping invalid target header"),
            }
        }
        headers
    }

    async fn send(&self, target: &ResolvedTarget) -> reqwest::Result<(u16, String, bool)> {
        let method = Method::from_bytes(target.method.as_bytes()).unwrap_or(Method::POST);
        let mut request = self
            .client
            .request(method, &target.url)
            .headers(Self::build_headers(target));
        if let Some(body) = &target.body {
            request = request.body(body.clone());
        }

        let mut response = request.send().await?;
        let code = response.status().as_u16();

        let mut buf = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_RESPONSE_BYTES - buf.len();
            if chunk.len() > room {
                buf.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }
        let mut body = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            body.push_str(TRUNCATION_MARKER);
        }
        Ok((code, body, truncated))
    }
}

#[async_trait]
impl TargetInvoker for HttpInvoker {
    async fn invoke(&self, target: &ResolvedTarget) -> ExecutionResult {
        debug!(url = %target.url, method = %target.method, "invoking target");
        let timeout_error = || {
            format!("request timed out after {}s", target.timeout.as_secs())
        };
        match tokio::time::timeout(target.timeout, self.send(target)).await {
            Ok(Ok((code, body, truncated))) => {
                let success = (100..400).contains(&code);
                ExecutionResult {
                    status: if success {
                        ExecutionStatus::Success
                    } else {
                        ExecutionStatus::Failed
                    },
                    response_code: Some(i32::from(code)),
                    response_body: Some(body),
                    response_truncated: truncated,
                    error_message: (!success).then(|| format!("target responded with HTTP {code}")),
                    end_time: now(),
                }
            }
            Ok(Err(e)) if e.is_timeout() => ExecutionResult {
                status: ExecutionStatus::Timeout,
                ..ExecutionResult::failed(timeout_error(), now())
            },
            Ok(Err(e)) => ExecutionResult::failed(format!("request failed: {e}"), now()),
            Err(_) => ExecutionResult {
                status: ExecutionStatus::Timeout,
                ..ExecutionResult::failed(timeout_error(), now())
            },
        }
    }
}
