use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::NotifyConfig;
use cadence_core::sinks::{LogNotifier, Notification, Notifier};
use tracing::{debug, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs each notification as JSON to a fixed URL. Delivery failures are
/// logged and otherwise ignored.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: Notification) {
        // Keep the failure in the log even when the webhook is down.
        LogNotifier.notify(notification.clone()).await;
        match self.client.post(&self.url).json(&notification).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(url = %self.url, "notification delivered");
            }
            Ok(resp) => warn!(url = %self.url, status = %resp.status(), "notification rejected"),
            Err(e) => warn!(url = %self.url, error = %e, "notification failed"),
        }
    }
}

/// Webhook notifier when a URL is configured, log-only otherwise.
pub fn build_notifier(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match config.webhook_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => match WebhookNotifier::new(url) {
            Ok(notifier) => Arc::new(notifier),
            Err(e) => {
                warn!(error = %e, "webhook notifier unavailable, logging only");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}
