//! Best-effort audit trail.
//!
//! Every create, transition, assign, respond and complete records
//! `{actor, action, entity_id, before, after, timestamp}`. A missing or
//! failing sink never blocks the operation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{queries, AuditRecord, SharedStore, StoreError};

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

/// Persists audit records next to the data they describe.
#[derive(Clone)]
pub struct StoreAuditSink {
    store: SharedStore,
}

impl StoreAuditSink {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for StoreAuditSink {
    async fn record(&self, record: &AuditRecord) -> Result<(), StoreError> {
        info!(
            target: "audit",
            actor = %record.actor,
            action = %record.action,
            entity = %record.entity_id,
            "audit"
        );
        queries::put_audit_record(self.store.as_ref(), record).await
    }
}

/// Handle services use to emit audit records.
#[derive(Clone, Default)]
pub struct Auditor {
    sink: Option<Arc<dyn AuditSink>>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// An auditor that drops everything.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        entity_id: impl ToString,
        before: Option<Value>,
        after: Option<Value>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };

        let record = AuditRecord {
            id: Uuid::new_v4(),
            actor: actor.to_string(),
            action: action.to_string(),
            entity_id: entity_id.to_string(),
            before,
            after,
            timestamp: Utc::now(),
        };

        if let Err(e) = sink.record(&record).await {
            warn!("Audit record for {} {} dropped: {}", action, record.entity_id, e);
        }
    }
}

/// Snapshot a record for the audit trail. Serialization failure yields `None`.
pub fn snapshot<T: serde::Serialize>(record: &T) -> Option<Value> {
    serde_json::to_value(record).ok()
}
