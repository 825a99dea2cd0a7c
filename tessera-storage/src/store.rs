//! Scope-aware object store on top of a [`KeyValueStore`].
//!
//! Every operation takes a [`StorageContext`]. Single-object operations
//! need a concrete scope and fail with a scope-misuse error before touching
//! the store when handed the wildcard. `list` and `watch` accept the
//! wildcard, scan one segment higher in the key space, and stamp every
//! returned object with the scope recovered from its own key.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use tessera_core::{
    ConfigError, LabelSelector, Preconditions, Resource, ResourceDescriptor, Scope, ScopeName,
    StorageError, TesseraConfig, TesseraError, TesseraResult,
};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::codec::{decode_object, encode_object, ItemDecoder, ScanPlan};
use crate::context::{effective_scope, StorageContext};
use crate::keys::KeyTranslator;
use crate::kv::{CasOutcome, KeyValue, KeyValueStore, KvEvent, KvWatch};
use crate::scope_capability::StorageScope;
use crate::watch::{WatchEvent, WatchStream};

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Options for [`ScopedStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub selector: LabelSelector,
    /// Caller only needs identity metadata; wildcard scans then use the
    /// identity-less prefix and cover every schema identity of the kind.
    pub partial_metadata: bool,
}

impl ListOptions {
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn partial_metadata(mut self) -> Self {
        self.partial_metadata = true;
        self
    }
}

/// An item a wildcard list could not attribute to a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedItem {
    pub key: String,
    pub error: TesseraError,
}

/// Result of [`ScopedStore::list`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectList<T> {
    /// Matching objects in key order.
    pub items: Vec<T>,
    /// Store revision the list observed; watch from here to stay consistent.
    pub resource_version: i64,
    /// Items dropped from a wildcard list. Always empty for concrete scopes.
    pub rejected: Vec<RejectedItem>,
}

/// Outcome of one optimistic update, before and after bytes included.
#[derive(Debug, Clone)]
pub(crate) struct UpdateOutcome<T> {
    pub key: String,
    pub object: T,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
    /// False when the update produced identical bytes and nothing was written.
    pub committed: bool,
    pub attempts: u32,
}

// ============================================================================
// STORE
// ============================================================================

/// Object store for one resource kind.
pub struct ScopedStore<T, K: ?Sized> {
    kv: Arc<K>,
    descriptor: ResourceDescriptor,
    keys: KeyTranslator,
    config: Arc<TesseraConfig>,
    _resource: PhantomData<fn() -> T>,
}

impl<T, K: ?Sized> Clone for ScopedStore<T, K> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            descriptor: self.descriptor.clone(),
            keys: self.keys.clone(),
            config: Arc::clone(&self.config),
            _resource: PhantomData,
        }
    }
}

impl<T, K> ScopedStore<T, K>
where
    T: Resource,
    K: KeyValueStore + ?Sized,
{
    /// Create a store for the kind described by `descriptor`.
    pub fn new(
        kv: Arc<K>,
        descriptor: ResourceDescriptor,
        config: &TesseraConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            kv,
            keys: KeyTranslator::from_config(&config.storage),
            descriptor,
            config: Arc::new(config.clone()),
            _resource: PhantomData,
        })
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    pub fn keys(&self) -> &KeyTranslator {
        &self.keys
    }

    pub fn config(&self) -> &TesseraConfig {
        &self.config
    }

    /// Resolve the scope of a single-object operation, rejecting the wildcard.
    fn concrete_scope(&self, ctx: &StorageContext, operation: &str) -> TesseraResult<ScopeName> {
        let scope = effective_scope(ctx, &self.config)?;
        Ok(scope.require_concrete(operation)?.clone())
    }

    fn object_key(&self, scope: &ScopeName, namespace: Option<&str>, name: &str) -> TesseraResult<String> {
        self.keys
            .build_key(&self.descriptor, &Scope::Concrete(scope.clone()), namespace, name)
    }

    /// Decode the current value of a single key read under `scope`.
    fn decode_current(&self, scope: &ScopeName, kv: &KeyValue) -> TesseraResult<T> {
        let mut object: T = decode_object(&kv.key, &kv.value, kv.mod_revision)?;
        Scope::Concrete(scope.clone()).post_decode(&kv.key, &mut object)?;
        Ok(object)
    }

    /// Force identity fields of an object about to be written under `scope`.
    fn stamp_for_write(&self, scope: &ScopeName, object: &mut T) -> TesseraResult<()> {
        let meta = object.meta_mut();
        if let Some(claimed) = meta.scope_annotation() {
            if claimed != scope.as_str() {
                return Err(StorageError::InvalidObject {
                    reason: format!(
                        "object {} is annotated with scope {claimed} but is written to {scope}",
                        meta.name
                    ),
                }
                .into());
            }
        }
        meta.set_scope(scope);
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.config.storage.max_update_retries
    }

    // ------------------------------------------------------------------------
    // Single-object operations
    // ------------------------------------------------------------------------

    /// Create `object`; fails with `AlreadyExists` if the identity is taken.
    pub async fn create(&self, ctx: &StorageContext, mut object: T) -> TesseraResult<T> {
        let scope = self.concrete_scope(ctx, "create")?;
        let key = {
            let meta = object.meta();
            self.object_key(&scope, meta.namespace.as_deref(), &meta.name)?
        };

        self.stamp_for_write(&scope, &mut object)?;
        let meta = object.meta_mut();
        meta.uid.get_or_insert_with(Uuid::now_v7);
        meta.creation_timestamp.get_or_insert_with(Utc::now);

        let bytes = encode_object(&key, &object)?;
        match self.kv.create(&key, bytes).await? {
            CasOutcome::Committed { revision } => {
                object.meta_mut().resource_version = Some(revision.to_string());
                tracing::debug!(scope = %scope, key = %key, revision, "Created object");
                Ok(object)
            }
            CasOutcome::Conflict { .. } => Err(StorageError::AlreadyExists { key }.into()),
        }
    }

    /// Read one object. `Ok(None)` is the normal not-found outcome.
    pub async fn get(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        name: &str,
    ) -> TesseraResult<Option<T>> {
        let scope = self.concrete_scope(ctx, "get")?;
        let key = self.object_key(&scope, namespace, name)?;
        match self.kv.get(&key).await? {
            Some(kv) => Ok(Some(self.decode_current(&scope, &kv)?)),
            None => Ok(None),
        }
    }

    /// Create or unconditionally replace `object`.
    ///
    /// An existing object keeps its uid and creation timestamp.
    pub async fn put(&self, ctx: &StorageContext, mut object: T) -> TesseraResult<T> {
        let scope = self.concrete_scope(ctx, "put")?;
        let key = {
            let meta = object.meta();
            self.object_key(&scope, meta.namespace.as_deref(), &meta.name)?
        };
        self.stamp_for_write(&scope, &mut object)?;

        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            let current = self.kv.get(&key).await?;
            let outcome = match &current {
                None => {
                    let meta = object.meta_mut();
                    meta.uid.get_or_insert_with(Uuid::now_v7);
                    meta.creation_timestamp.get_or_insert_with(Utc::now);
                    self.kv.create(&key, encode_object(&key, &object)?).await?
                }
                Some(kv) => {
                    let existing: T = decode_object(&kv.key, &kv.value, kv.mod_revision)?;
                    let meta = object.meta_mut();
                    meta.uid = existing.meta().uid;
                    meta.creation_timestamp = existing.meta().creation_timestamp;
                    self.kv
                        .compare_and_swap(&key, kv.mod_revision, encode_object(&key, &object)?)
                        .await?
                }
            };
            match outcome {
                CasOutcome::Committed { revision } => {
                    object.meta_mut().resource_version = Some(revision.to_string());
                    tracing::debug!(scope = %scope, key = %key, revision, attempt, "Put object");
                    return Ok(object);
                }
                CasOutcome::Conflict { .. } => {
                    tracing::debug!(key = %key, attempt, "Put raced with another writer, retrying");
                }
            }
        }
        Err(StorageError::Conflict {
            key,
            attempts: max_attempts,
        }
        .into())
    }

    /// Optimistic read-modify-write with bounded retries.
    ///
    /// `try_update` receives the current object and returns the desired one.
    /// It may run more than once. An error from it aborts the update
    /// unchanged. The identity, uid, and creation timestamp of the current
    /// object are preserved. When the result serializes to the stored bytes
    /// nothing is written.
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
        self.update_with_outcome(ctx, namespace, name, preconditions, try_update)
            .await
            .map(|outcome| outcome.object)
    }

    pub(crate) async fn update_with_outcome<F>(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<&Preconditions>,
        mut try_update: F,
    ) -> TesseraResult<UpdateOutcome<T>>
    where
        F: FnMut(T) -> TesseraResult<T> + Send,
    {
        let scope = self.concrete_scope(ctx, "guaranteed_update")?;
        let key = self.object_key(&scope, namespace, name)?;

        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            let current_kv = self
                .kv
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;
            let current = self.decode_current(&scope, &current_kv)?;

            if let Some(reason) = preconditions.and_then(|p| p.check(current.meta())) {
                return Err(StorageError::PreconditionFailed { key, reason }.into());
            }

            let mut updated = try_update(current.clone())?;
            {
                let (before, after) = (current.meta(), updated.meta_mut());
                after.name = before.name.clone();
                after.namespace = before.namespace.clone();
                after.uid = before.uid;
                after.creation_timestamp = before.creation_timestamp;
            }
            self.stamp_for_write(&scope, &mut updated)?;

            let after = encode_object(&key, &updated)?;
            if after == current_kv.value {
                tracing::debug!(key = %key, "Update is a no-op, skipping write");
                return Ok(UpdateOutcome {
                    key,
                    object: current,
                    before: current_kv.value,
                    after,
                    committed: false,
                    attempts: attempt,
                });
            }

            match self
                .kv
                .compare_and_swap(&key, current_kv.mod_revision, after.clone())
                .await?
            {
                CasOutcome::Committed { revision } => {
                    updated.meta_mut().resource_version = Some(revision.to_string());
                    tracing::debug!(scope = %scope, key = %key, revision, attempt, "Updated object");
                    return Ok(UpdateOutcome {
                        key,
                        object: updated,
                        before: current_kv.value,
                        after,
                        committed: true,
                        attempts: attempt,
                    });
                }
                CasOutcome::Conflict { .. } => {
                    tracing::debug!(key = %key, attempt, "Update conflicted, retrying");
                }
            }
        }

        tracing::warn!(key = %key, attempts = max_attempts, "Update gave up after repeated conflicts");
        Err(StorageError::Conflict {
            key,
            attempts: max_attempts,
        }
        .into())
    }

    /// Delete one object and return its last state.
    pub async fn delete(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        name: &str,
        preconditions: Option<&Preconditions>,
    ) -> TesseraResult<T> {
        let scope = self.concrete_scope(ctx, "delete")?;
        let key = self.object_key(&scope, namespace, name)?;

        let max_attempts = self.max_attempts();
        for attempt in 1..=max_attempts {
            let current_kv = self
                .kv
                .get(&key)
                .await?
                .ok_or_else(|| StorageError::NotFound { key: key.clone() })?;
            let mut current = self.decode_current(&scope, &current_kv)?;

            if let Some(reason) = preconditions.and_then(|p| p.check(current.meta())) {
                return Err(StorageError::PreconditionFailed { key, reason }.into());
            }

            match self
                .kv
                .compare_and_delete(&key, current_kv.mod_revision)
                .await?
            {
                CasOutcome::Committed { revision } => {
                    current.meta_mut().resource_version = Some(revision.to_string());
                    tracing::debug!(scope = %scope, key = %key, revision, "Deleted object");
                    return Ok(current);
                }
                CasOutcome::Conflict { .. } => {
                    tracing::debug!(key = %key, attempt, "Delete raced with another writer, retrying");
                }
            }
        }
        Err(StorageError::Conflict {
            key,
            attempts: max_attempts,
        }
        .into())
    }

    // ------------------------------------------------------------------------
    // Scans
    // ------------------------------------------------------------------------

    /// Work out the scan prefix and the decoding rules for a list or watch.
    fn scan_plan(&self, scope: Scope, namespace: Option<&str>, partial_metadata: bool) -> (ScanPlan, String) {
        let partial = partial_metadata && scope.is_wildcard() && self.descriptor.identity.is_some();
        let (scan_prefix, key_prefix) = if partial {
            let prefix = self.keys.partial_metadata_prefix(&self.descriptor);
            (prefix.clone(), prefix)
        } else {
            let scan_prefix = match namespace {
                Some(ns) => self.keys.namespace_prefix(&self.descriptor, &scope, ns),
                None => self.keys.scope_prefix(&self.descriptor, &scope),
            };
            (scan_prefix, self.keys.resource_prefix(&self.descriptor))
        };
        let plan = ScanPlan {
            scope,
            namespace: namespace.map(str::to_string),
            prefix: key_prefix,
            skip_identity: partial,
        };
        (plan, scan_prefix)
    }

    fn decoder(&self, plan: ScanPlan) -> ItemDecoder {
        ItemDecoder::new(self.keys.clone(), self.descriptor.clone(), plan)
    }

    /// List objects visible through the context's scope.
    ///
    /// A concrete-scope list is atomic: any undecodable item fails the call.
    /// A wildcard list drops such items into [`ObjectList::rejected`] and
    /// carries on.
    pub async fn list(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        options: &ListOptions,
    ) -> TesseraResult<ObjectList<T>> {
        let scope = effective_scope(ctx, &self.config)?;
        let (plan, scan_prefix) = self.scan_plan(scope, namespace, options.partial_metadata);
        let decoder = self.decoder(plan);
        let wildcard = decoder.plan().scope.is_wildcard();

        let range = self.kv.range(&scan_prefix).await?;
        let mut items = Vec::new();
        let mut rejected = Vec::new();
        for kv in &range.kvs {
            match decoder.decode_item::<T>(&kv.key, &kv.value, kv.mod_revision) {
                Ok(Some(object)) => {
                    if options.selector.matches(&object.meta().labels) {
                        items.push(object);
                    }
                }
                Ok(None) => {}
                Err(error) if wildcard => {
                    tracing::warn!(key = %kv.key, error = %error, "Dropping item from wildcard list");
                    rejected.push(RejectedItem {
                        key: kv.key.clone(),
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
        }

        tracing::debug!(
            scope = %decoder.plan().scope,
            prefix = %scan_prefix,
            items = items.len(),
            rejected = rejected.len(),
            revision = range.revision,
            "Listed objects"
        );
        Ok(ObjectList {
            items,
            resource_version: range.revision,
            rejected,
        })
    }

    /// Watch changes visible through the context's scope.
    ///
    /// Events after `resource_version` are delivered (the current revision
    /// when `None`). The watch runs until `shutdown` flips to `true` or its
    /// sender is dropped, the returned stream is dropped, or the store ends
    /// the subscription. A wildcard watch is one continuous prefix
    /// subscription.
    pub async fn watch(
        &self,
        ctx: &StorageContext,
        namespace: Option<&str>,
        selector: LabelSelector,
        resource_version: Option<i64>,
        shutdown: watch::Receiver<bool>,
    ) -> TesseraResult<WatchStream<T>> {
        let scope = effective_scope(ctx, &self.config)?;
        let (plan, scan_prefix) = self.scan_plan(scope, namespace, false);
        let decoder = self.decoder(plan);

        let after = match resource_version {
            Some(rv) => rv,
            None => self.kv.current_revision().await?,
        };
        let kv_watch = self.kv.watch(&scan_prefix, after).await?;

        let (tx, rx) = mpsc::channel(self.config.storage.watch_channel_capacity);
        tracing::debug!(scope = %decoder.plan().scope, prefix = %scan_prefix, after, "Starting watch");
        let task = tokio::spawn(run_watch::<T>(kv_watch, decoder, selector, tx, shutdown));
        Ok(WatchStream::new(rx, task))
    }
}

// ============================================================================
// WATCH TASK
// ============================================================================

async fn run_watch<T: Resource>(
    mut kv_watch: KvWatch,
    decoder: ItemDecoder,
    selector: LabelSelector,
    tx: mpsc::Sender<WatchEvent<T>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let wildcard = decoder.plan().scope.is_wildcard();
    loop {
        let event = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(prefix = %kv_watch.prefix(), "Watch cancelled");
                    return;
                }
                continue;
            }
            _ = tx.closed() => {
                tracing::debug!(prefix = %kv_watch.prefix(), "Watch consumer went away");
                return;
            }
            event = kv_watch.next() => event,
        };

        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(error)) => {
                tracing::warn!(prefix = %kv_watch.prefix(), error = %error, "Watch ended with a store error");
                let _ = tx.send(WatchEvent::Error(error.into())).await;
                return;
            }
            None => return,
        };

        match translate_event(&decoder, &selector, &event) {
            Ok(Some(watch_event)) => {
                if tx.send(watch_event).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(error) if wildcard => {
                tracing::warn!(key = %event.key(), error = %error, "Dropping item from wildcard watch");
            }
            Err(error) => {
                let _ = tx.send(WatchEvent::Error(error)).await;
                return;
            }
        }
    }
}

/// Map a raw event to a typed one, applying selector transitions.
///
/// An object that stops matching the selector surfaces as `Deleted`, one
/// that starts matching as `Added`.
fn translate_event<T: Resource>(
    decoder: &ItemDecoder,
    selector: &LabelSelector,
    event: &KvEvent,
) -> TesseraResult<Option<WatchEvent<T>>> {
    let decode_prev = |prev: &Option<KeyValue>| -> TesseraResult<Option<T>> {
        match prev {
            Some(kv) => decoder.decode_item::<T>(&kv.key, &kv.value, kv.mod_revision),
            None => Ok(None),
        }
    };
    let matches = |object: &T| selector.matches(&object.meta().labels);

    match event {
        KvEvent::Put { kv, prev } => {
            let Some(current) = decoder.decode_item::<T>(&kv.key, &kv.value, kv.mod_revision)? else {
                return Ok(None);
            };
            let previous = decode_prev(prev)?;
            let was = previous.as_ref().is_some_and(matches);
            let is = matches(&current);
            Ok(match (previous.is_some(), was, is) {
                (false, _, true) => Some(WatchEvent::Added(current)),
                (true, true, true) => Some(WatchEvent::Modified(current)),
                (true, false, true) => Some(WatchEvent::Added(current)),
                (true, true, false) => Some(WatchEvent::Deleted(current)),
                _ => None,
            })
        }
        KvEvent::Delete { revision, prev, .. } => {
            let Some(mut previous) = decode_prev(prev)? else {
                return Ok(None);
            };
            if !matches(&previous) {
                return Ok(None);
            }
            previous.meta_mut().resource_version = Some(revision.to_string());
            Ok(Some(WatchEvent::Deleted(previous)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKeyValueStore;
    use tessera_core::{DynamicObject, ObjectMeta, ScopeError};

    type Store = ScopedStore<DynamicObject, InMemoryKeyValueStore>;

    fn store(descriptor: ResourceDescriptor) -> Store {
        let config = TesseraConfig::default();
        ScopedStore::new(Arc::new(InMemoryKeyValueStore::new(&config.storage)), descriptor, &config).unwrap()
    }

    fn ctx(scope: &str) -> StorageContext {
        StorageContext::background().with_scope(Scope::parse(scope).unwrap())
    }

    fn cm(ns: &str, name: &str) -> DynamicObject {
        DynamicObject::new(ObjectMeta::namespaced(ns, name), serde_json::json!({"v": 0}))
    }

    #[tokio::test]
    async fn test_create_get_roundtrip() {
        let s = store(ResourceDescriptor::custom("group", "resource", true));
        let created = s.create(&ctx("root:org:ws"), cm("default", "cm1")).await.unwrap();
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));

        let got = s.get(&ctx("root:org:ws"), Some("default"), "cm1").await.unwrap().unwrap();
        assert_eq!(got.metadata.scope_annotation(), Some("root:org:ws"));
        assert_eq!(got.metadata.uid, created.metadata.uid);
    }

    #[tokio::test]
    async fn test_create_twice_is_already_exists() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        s.create(&ctx("root"), cm("default", "a")).await.unwrap();
        let err = s.create(&ctx("root"), cm("default", "a")).await.unwrap_err();
        assert!(matches!(err, TesseraError::Storage(StorageError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        assert!(s.get(&ctx("root"), Some("default"), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unscoped_context_without_default_fails() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let err = s
            .get(&StorageContext::background(), Some("default"), "x")
            .await
            .unwrap_err();
        assert_eq!(err, TesseraError::Scope(ScopeError::Missing));
    }

    #[tokio::test]
    async fn test_wildcard_writes_are_scope_misuse() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let wild = ctx("*");
        assert!(s.create(&wild, cm("default", "a")).await.unwrap_err().is_scope_misuse());
        assert!(s.put(&wild, cm("default", "a")).await.unwrap_err().is_scope_misuse());
        assert!(s.get(&wild, Some("default"), "a").await.unwrap_err().is_scope_misuse());
        assert!(s
            .delete(&wild, Some("default"), "a", None)
            .await
            .unwrap_err()
            .is_scope_misuse());
        assert!(s
            .guaranteed_update(&wild, Some("default"), "a", None, Ok)
            .await
            .unwrap_err()
            .is_scope_misuse());
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_annotation() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let mut obj = cm("default", "a");
        obj.metadata.set_scope(&ScopeName::new("root:other").unwrap());
        let err = s.create(&ctx("root:org"), obj).await.unwrap_err();
        assert!(matches!(err, TesseraError::Storage(StorageError::InvalidObject { .. })));
    }

    #[tokio::test]
    async fn test_put_preserves_uid() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let created = s.create(&ctx("root"), cm("default", "a")).await.unwrap();

        let mut replacement = cm("default", "a");
        replacement.data = serde_json::json!({"v": 9});
        let replaced = s.put(&ctx("root"), replacement).await.unwrap();
        assert_eq!(replaced.metadata.uid, created.metadata.uid);
        assert_eq!(replaced.data["v"], 9);

        let fresh = s.put(&ctx("root"), cm("default", "b")).await.unwrap();
        assert!(fresh.metadata.uid.is_some());
    }

    #[tokio::test]
    async fn test_guaranteed_update_applies_and_preserves_identity() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let created = s.create(&ctx("root"), cm("default", "a")).await.unwrap();

        let updated = s
            .guaranteed_update(&ctx("root"), Some("default"), "a", None, |mut obj| {
                obj.data["v"] = serde_json::json!(1);
                obj.metadata.name = "renamed".to_string();
                obj.metadata.uid = None;
                Ok(obj)
            })
            .await
            .unwrap();
        assert_eq!(updated.metadata.name, "a");
        assert_eq!(updated.metadata.uid, created.metadata.uid);
        assert_eq!(updated.data["v"], 1);
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_guaranteed_update_noop_does_not_write() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        s.create(&ctx("root"), cm("default", "a")).await.unwrap();
        let outcome = s
            .update_with_outcome(&ctx("root"), Some("default"), "a", None, Ok)
            .await
            .unwrap();
        assert!(!outcome.committed);
        assert_eq!(outcome.object.metadata.resource_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_guaranteed_update_missing_and_preconditions() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let err = s
            .guaranteed_update(&ctx("root"), Some("default"), "a", None, Ok)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        s.create(&ctx("root"), cm("default", "a")).await.unwrap();
        let stale = Preconditions::resource_version("99");
        let err = s
            .guaranteed_update(&ctx("root"), Some("default"), "a", Some(&stale), Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Storage(StorageError::PreconditionFailed { .. })));
    }

    #[tokio::test]
    async fn test_guaranteed_update_propagates_closure_error() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        s.create(&ctx("root"), cm("default", "a")).await.unwrap();
        let err = s
            .guaranteed_update(&ctx("root"), Some("default"), "a", None, |_| {
                Err(StorageError::InvalidObject {
                    reason: "nope".to_string(),
                }
                .into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Storage(StorageError::InvalidObject { .. })));
    }

    #[tokio::test]
    async fn test_delete_with_uid_precondition() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let created = s.create(&ctx("root"), cm("default", "a")).await.unwrap();

        let wrong = Preconditions::uid(Uuid::now_v7());
        assert!(s
            .delete(&ctx("root"), Some("default"), "a", Some(&wrong))
            .await
            .is_err());

        let right = Preconditions::uid(created.metadata.uid.unwrap());
        let deleted = s
            .delete(&ctx("root"), Some("default"), "a", Some(&right))
            .await
            .unwrap();
        assert_eq!(deleted.metadata.name, "a");
        assert!(s.get(&ctx("root"), Some("default"), "a").await.unwrap().is_none());
        assert!(s
            .delete(&ctx("root"), Some("default"), "a", None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_list_concrete_and_namespace() {
        let s = store(ResourceDescriptor::builtin("", "configmaps", true));
        s.create(&ctx("root:org"), cm("default", "a")).await.unwrap();
        s.create(&ctx("root:org"), cm("team", "b")).await.unwrap();
        s.create(&ctx("root:org:ws"), cm("default", "c")).await.unwrap();

        let all = s.list(&ctx("root:org"), None, &ListOptions::default()).await.unwrap();
        let names: Vec<_> = all.items.iter().map(|o| o.metadata.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(all.resource_version, 3);

        let team = s.list(&ctx("root:org"), Some("team"), &ListOptions::default()).await.unwrap();
        assert_eq!(team.items.len(), 1);
        assert_eq!(team.items[0].metadata.name, "b");
    }

    #[tokio::test]
    async fn test_list_selector() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let mut labelled = cm("default", "a");
        labelled.metadata.labels.insert("tier".to_string(), "web".to_string());
        s.create(&ctx("root"), labelled).await.unwrap();
        s.create(&ctx("root"), cm("default", "b")).await.unwrap();

        let options = ListOptions::default().with_selector(LabelSelector::everything().with("tier", "web"));
        let list = s.list(&ctx("*"), None, &options).await.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].metadata.name, "a");
    }

    #[tokio::test]
    async fn test_partial_metadata_wildcard_spans_identities() {
        let config = TesseraConfig::default();
        let kv = Arc::new(InMemoryKeyValueStore::new(&config.storage));
        let v1 = ResourceDescriptor::custom("example.dev", "widgets", true).with_identity("one");
        let v2 = ResourceDescriptor::custom("example.dev", "widgets", true).with_identity("two");
        let s1: Store = ScopedStore::new(Arc::clone(&kv), v1, &config).unwrap();
        let s2: Store = ScopedStore::new(Arc::clone(&kv), v2, &config).unwrap();

        s1.create(&ctx("root:a"), cm("default", "w1")).await.unwrap();
        s2.create(&ctx("root:b"), cm("default", "w2")).await.unwrap();

        let full = s1.list(&ctx("*"), None, &ListOptions::default()).await.unwrap();
        assert_eq!(full.items.len(), 1);

        let partial = s1
            .list(&ctx("*"), None, &ListOptions::default().partial_metadata())
            .await
            .unwrap();
        let scopes: Vec<_> = partial
            .items
            .iter()
            .map(|o| o.metadata.scope_annotation().unwrap().to_string())
            .collect();
        assert_eq!(scopes, vec!["root:a", "root:b"]);
    }

    #[tokio::test]
    async fn test_watch_scoped_events() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stream = s
            .watch(&ctx("root:a"), None, LabelSelector::everything(), None, shutdown_rx)
            .await
            .unwrap();

        s.create(&ctx("root:b"), cm("default", "other")).await.unwrap();
        s.create(&ctx("root:a"), cm("default", "mine")).await.unwrap();
        s.guaranteed_update(&ctx("root:a"), Some("default"), "mine", None, |mut o| {
            o.data["v"] = serde_json::json!(5);
            Ok(o)
        })
        .await
        .unwrap();
        s.delete(&ctx("root:a"), Some("default"), "mine", None).await.unwrap();

        match stream.next().await.unwrap() {
            WatchEvent::Added(obj) => assert_eq!(obj.metadata.name, "mine"),
            other => panic!("expected added, got {other:?}"),
        }
        assert!(matches!(stream.next().await.unwrap(), WatchEvent::Modified(_)));
        match stream.next().await.unwrap() {
            WatchEvent::Deleted(obj) => assert_eq!(obj.metadata.resource_version.as_deref(), Some("4")),
            other => panic!("expected deleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_selector_transitions() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let selector = LabelSelector::everything().with("tier", "web");
        let mut stream = s.watch(&ctx("*"), None, selector, None, shutdown_rx).await.unwrap();

        s.create(&ctx("root"), cm("default", "a")).await.unwrap();
        s.guaranteed_update(&ctx("root"), Some("default"), "a", None, |mut o| {
            o.metadata.labels.insert("tier".to_string(), "web".to_string());
            Ok(o)
        })
        .await
        .unwrap();
        s.guaranteed_update(&ctx("root"), Some("default"), "a", None, |mut o| {
            o.metadata.labels.clear();
            Ok(o)
        })
        .await
        .unwrap();

        assert!(matches!(stream.next().await.unwrap(), WatchEvent::Added(_)));
        assert!(matches!(stream.next().await.unwrap(), WatchEvent::Deleted(_)));
    }

    #[tokio::test]
    async fn test_watch_stops_on_shutdown() {
        let s = store(ResourceDescriptor::custom("g", "r", true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut stream = s
            .watch(&ctx("*"), None, LabelSelector::everything(), None, shutdown_rx)
            .await
            .unwrap();

        shutdown_tx.send(true).unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_from_compacted_revision_fails() {
        let config = TesseraConfig::default().with_storage(
            tessera_core::StorageConfig::default().with_watch_history(1),
        );
        let kv = Arc::new(InMemoryKeyValueStore::new(&config.storage));
        let s: Store = ScopedStore::new(kv, ResourceDescriptor::custom("g", "r", true), &config).unwrap();
        for name in ["a", "b", "c"] {
            s.create(&ctx("root"), cm("default", name)).await.unwrap();
        }
        let (_tx, rx) = watch::channel(false);
        let err = s
            .watch(&ctx("root"), None, LabelSelector::everything(), Some(0), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Storage(StorageError::Compacted { .. })));
    }
}
