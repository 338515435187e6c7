use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::sinks::AuditSink;
use cadence_core::types::AuditEntry;
use tracing::{debug, warn};

use crate::store::Store;

/// Persists audit entries through the store. Write failures are logged and
/// dropped so they never fail the action being audited.
#[derive(Clone)]
pub struct StoreAuditSink {
    store: Arc<dyn Store>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, entry: AuditEntry) {
        match self.store.append_audit(&entry).await {
            Ok(()) => debug!(
                schedule_id = ?entry.schedule_id,
                action = %entry.action,
                performed_by = %entry.performed_by,
                "audit recorded"
            ),
            Err(e) => warn!(
                schedule_id = ?entry.schedule_id,
                action = %entry.action,
                error = %e,
                "audit write failed"
            ),
        }
    }
}
