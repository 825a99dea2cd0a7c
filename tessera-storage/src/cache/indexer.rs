//! Scoped in-memory indexer.
//!
//! Mirrors the store's key space so lists and gets can be served without a
//! store round trip. One writer (the reflector) and many readers share the
//! state behind a reader-writer lock; every mutation computes its new index
//! values first and then applies the whole transition under one write lock,
//! so readers never see an object filed under both its old and new values.
//!
//! Handles are cheap: [`ScopedIndexer::scoped`] returns a view bound to one
//! scope that shares the same state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tessera_core::{IndexError, LabelSelector, Resource, Scope, ScopeError, ScopeName};

use super::index_funcs::{
    default_indexers, scope_namespace_value, IndexFunc, Indexers, MATCH_ALL_SCOPES,
    SCOPE_INDEX, SCOPE_NAMESPACE_INDEX, UNSCOPED_BUCKET,
};
use super::key::{cache_key, object_cache_key};
use crate::watch::WatchEvent;

/// Index values an entry was filed under, by index name.
type IndexValues = BTreeMap<String, Vec<String>>;

struct Entry<T> {
    object: T,
    values: IndexValues,
}

struct IndexerState<T> {
    indexers: Indexers<T>,
    entries: BTreeMap<String, Entry<T>>,
    /// index name -> index value -> cache keys
    indices: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    resource_version: i64,
}

impl<T: Resource> IndexerState<T> {
    fn compute(&self, object: &T) -> Result<(String, IndexValues), IndexError> {
        let key = object_cache_key(object)?;
        let mut values = IndexValues::new();
        for (name, func) in &self.indexers {
            values.insert(name.clone(), func(object)?);
        }
        Ok((key, values))
    }

    fn file(&mut self, key: &str, values: &IndexValues) {
        for (name, index_values) in values {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_values {
                index.entry(value.clone()).or_default().insert(key.to_string());
            }
        }
    }

    fn unfile(&mut self, key: &str, values: &IndexValues) {
        for (name, index_values) in values {
            if let Some(index) = self.indices.get_mut(name) {
                for value in index_values {
                    if let Some(keys) = index.get_mut(value) {
                        keys.remove(key);
                        if keys.is_empty() {
                            index.remove(value);
                        }
                    }
                }
            }
        }
    }

    fn upsert(&mut self, key: String, entry: Entry<T>) {
        if let Some(old) = self.entries.remove(&key) {
            self.unfile(&key, &old.values);
        }
        self.file(&key, &entry.values);
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<T> {
        let old = self.entries.remove(key)?;
        self.unfile(key, &old.values);
        Some(old.object)
    }

    fn observe_revision(&mut self, object: &T) {
        self.resource_version = self.resource_version.max(object.meta().revision());
    }
}

/// Scope-aware object cache with secondary indices.
pub struct ScopedIndexer<T> {
    state: Arc<RwLock<IndexerState<T>>>,
    scope: Option<ScopeName>,
}

impl<T> Clone for ScopedIndexer<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            scope: self.scope.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ScopedIndexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedIndexer")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl<T: Resource> Default for ScopedIndexer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> ScopedIndexer<T> {
    /// An empty indexer with the built-in indices.
    pub fn new() -> Self {
        Self::with_indexers(default_indexers())
    }

    /// An empty indexer with exactly `indexers`.
    pub fn with_indexers(indexers: Indexers<T>) -> Self {
        Self {
            state: Arc::new(RwLock::new(IndexerState {
                indexers,
                entries: BTreeMap::new(),
                indices: BTreeMap::new(),
                resource_version: 0,
            })),
            scope: None,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, IndexerState<T>>, IndexError> {
        self.state.read().map_err(|_| IndexError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, IndexerState<T>>, IndexError> {
        self.state.write().map_err(|_| IndexError::LockPoisoned)
    }

    /// Register an extra index. Only allowed while the indexer is empty.
    pub fn add_indexer(&self, name: impl Into<String>, func: IndexFunc<T>) -> Result<(), IndexError> {
        let name = name.into();
        let mut state = self.write()?;
        if !state.entries.is_empty() {
            return Err(IndexError::IndexerAfterStart);
        }
        if state.indexers.contains_key(&name) {
            return Err(IndexError::DuplicateIndex { name });
        }
        state.indexers.insert(name, func);
        Ok(())
    }

    /// A view bound to one concrete scope, sharing this indexer's state.
    pub fn scoped(&self, scope: &Scope) -> Result<Self, ScopeError> {
        let scope = scope.require_concrete("narrowing an indexer")?;
        Ok(Self {
            state: Arc::clone(&self.state),
            scope: Some(scope.clone()),
        })
    }

    /// Scope this handle is bound to; `None` for the cluster-wide handle.
    pub fn scope(&self) -> Option<&ScopeName> {
        self.scope.as_ref()
    }

    // ------------------------------------------------------------------------
    // Mutation (reflector side)
    // ------------------------------------------------------------------------

    /// Insert or replace an object.
    pub fn add(&self, object: T) -> Result<(), IndexError> {
        let mut state = self.write()?;
        let (key, values) = state.compute(&object)?;
        state.observe_revision(&object);
        state.upsert(key, Entry { object, values });
        Ok(())
    }

    pub fn update(&self, object: T) -> Result<(), IndexError> {
        self.add(object)
    }

    /// Remove an object; returns the cached copy if there was one.
    pub fn delete(&self, object: &T) -> Result<Option<T>, IndexError> {
        let key = object_cache_key(object)?;
        let mut state = self.write()?;
        state.observe_revision(object);
        Ok(state.remove(&key))
    }

    /// Swap the whole contents for `objects`, as after a full relist.
    ///
    /// All index values are computed before the swap; on error the indexer
    /// is left untouched.
    pub fn replace(&self, objects: Vec<T>, resource_version: i64) -> Result<(), IndexError> {
        let mut state = self.write()?;
        let mut staged = Vec::with_capacity(objects.len());
        for object in objects {
            let (key, values) = state.compute(&object)?;
            staged.push((key, Entry { object, values }));
        }

        state.entries.clear();
        state.indices.clear();
        for (key, entry) in staged {
            state.upsert(key, entry);
        }
        state.resource_version = resource_version;
        Ok(())
    }

    /// Apply one watch event.
    pub fn apply(&self, event: WatchEvent<T>) -> Result<(), IndexError> {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => self.add(object),
            WatchEvent::Deleted(object) => self.delete(&object).map(|_| ()),
            WatchEvent::Error(error) => {
                tracing::debug!(error = %error, "Ignoring watch error event in indexer");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Exact lookup of `(scope, namespace, name)` for this handle's scope.
    pub fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>, IndexError> {
        self.get_by_key(&cache_key(self.scope.as_ref(), namespace, name))
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<T>, IndexError> {
        Ok(self.read()?.entries.get(key).map(|entry| entry.object.clone()))
    }

    /// Objects filed under `value` in index `name`, in cache-key order.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<T>, IndexError> {
        let state = self.read()?;
        if !state.indexers.contains_key(name) {
            return Err(IndexError::UnknownIndex {
                name: name.to_string(),
            });
        }
        let keys = state.indices.get(name).and_then(|index| index.get(value));
        Ok(keys
            .into_iter()
            .flatten()
            .filter_map(|key| state.entries.get(key))
            .map(|entry| entry.object.clone())
            .collect())
    }

    /// Index values currently in use by index `name`.
    pub fn index_values(&self, name: &str) -> Result<Vec<String>, IndexError> {
        let state = self.read()?;
        if !state.indexers.contains_key(name) {
            return Err(IndexError::UnknownIndex {
                name: name.to_string(),
            });
        }
        Ok(state
            .indices
            .get(name)
            .map(|index| index.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn bucket(&self) -> &str {
        self.scope.as_ref().map_or(UNSCOPED_BUCKET, ScopeName::as_str)
    }

    /// Objects in this handle's bucket: its scope, or the unscoped bucket.
    pub fn list(&self, selector: &LabelSelector) -> Result<Vec<T>, IndexError> {
        Ok(select(self.by_index(SCOPE_INDEX, self.bucket())?, selector))
    }

    /// Objects in one namespace of this handle's bucket.
    pub fn list_namespace(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<T>, IndexError> {
        let value = scope_namespace_value(self.bucket(), namespace);
        Ok(select(self.by_index(SCOPE_NAMESPACE_INDEX, &value)?, selector))
    }

    /// Every object regardless of scope.
    pub fn list_all(&self, selector: &LabelSelector) -> Result<Vec<T>, IndexError> {
        Ok(select(self.by_index(SCOPE_INDEX, MATCH_ALL_SCOPES)?, selector))
    }

    /// All cache keys, in order.
    pub fn keys(&self) -> Result<Vec<String>, IndexError> {
        Ok(self.read()?.entries.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest resource version applied so far.
    pub fn resource_version(&self) -> i64 {
        self.read().map(|state| state.resource_version).unwrap_or(0)
    }
}

fn select<T: Resource>(objects: Vec<T>, selector: &LabelSelector) -> Vec<T> {
    if selector.is_empty() {
        return objects;
    }
    objects
        .into_iter()
        .filter(|object| selector.matches(&object.meta().labels))
        .collect()
}
