//! Audit decorator for optimistic updates.
//!
//! [`AuditedStore`] wraps a [`ScopedStore`] and reports the serialized
//! before/after values of every committed `guaranteed_update` to an
//! [`AuditSink`]. It never changes what the wrapped store returns: retry
//! counts, errors, and results pass through untouched, and a failing sink
//! is logged rather than surfaced.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tessera_core::{Preconditions, Resource, ScopeName, StorageError, TesseraResult};

use crate::context::StorageContext;
use crate::kv::KeyValueStore;
use crate::store::ScopedStore;

/// One committed update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub key: String,
    pub scope: ScopeName,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    /// Attempt on which the update committed (1 = no conflict).
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), StorageError>;
}

/// Audit sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: tokio::sync::RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    /// Records for one scope, oldest first.
    pub async fn records_for(&self, scope: &ScopeName) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| &record.scope == scope)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<(), StorageError> {
        self.records.write().await.push(record);
        Ok(())
    }
}

/// A [`ScopedStore`] whose updates are audited.
///
/// Reads, creates, and deletes go to the inner store through
/// [`inner`](Self::inner).
pub struct AuditedStore<T, K: ?Sized> {
    inner: ScopedStore<T, K>,
    sink: Arc<dyn AuditSink>,
}

impl<T, K> AuditedStore<T, K>
where
    T: Resource,
    K: KeyValueStore + ?Sized,
{
    pub fn new(inner: ScopedStore<T, K>, sink: Arc<dyn AuditSink>) -> Self {
        Self { inner, sink }
    }

    pub fn inner(&self) -> &ScopedStore<T, K> {
        &self.inner
    }

    /// Same contract as [`ScopedStore::guaranteed_update`].
    pub async fn guaranteed_update<F>(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<&Preconditions>,
        try_update: F,
    ) -> TesseraResult<T>
    where
        F: FnMut(T) -> TesseraResult<T> + Send,
    {
        let outcome = self
            .inner
            .update_with_outcome(ctx, namespace, name, preconditions, try_update)
            .await?;

        if outcome.committed {
            if let Some(scope) = outcome.object.meta().scope().ok().flatten() {
                let record = AuditRecord {
                    key: outcome.key.clone(),
                    scope,
                    before: as_json(&outcome.before),
                    after: as_json(&outcome.after),
                    attempts: outcome.attempts,
                    recorded_at: Utc::now(),
                };
                if let Err(e) = self.sink.record(record).await {
                    tracing::warn!(key = %outcome.key, error = %e, "Failed to record audit entry");
                }
            }
        }
        Ok(outcome.object)
    }
}

fn as_json(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null)
}
