//! Collaborator interfaces the scheduler calls out to. Both are best-effort:
//! implementations log their own failures and never return errors to the
//! operation that produced the event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{AuditEntry, ExecutionStatus};

/// Receives append-only audit entries for control-plane actions.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Events worth telling a human about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// A firing failed and has no retry budget left.
    ExecutionFailed {
        schedule_id: Uuid,
        schedule_name: String,
        execution_id: Uuid,
        status: ExecutionStatus,
        attempt_count: i32,
        error: Option<String>,
        scheduled_time: DateTime<Utc>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: Notification) {
        match notification {
            Notification::ExecutionFailed {
                schedule_id,
                schedule_name,
                execution_id,
                status,
                attempt_count,
                error,
                ..
            } => {
                warn!(
                    %schedule_id,
                    %execution_id,
                    %status,
                    attempt_count,
                    schedule = %schedule_name,
                    error = error.as_deref().unwrap_or(""),
                    "execution failed with no retries left"
                );
            }
        }
    }
}

/// Audit sink that only logs; used when no durable sink is wired.
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, entry: AuditEntry) {
        info!(
            schedule_id = ?entry.schedule_id,
            action = %entry.action,
            performed_by = %entry.performed_by,
            "audit"
        );
    }
}
