//! Key-value store abstraction underneath the scoped store.
//!
//! The contract mirrors what an etcd-like store provides: a single store-wide
//! revision that increases with every write, linearizable single-key reads,
//! a conditional write keyed on a value's `mod_revision`, ordered prefix
//! scans, and prefix watches that can resume from a past revision.
//!
//! Backends:
//! - [`InMemoryKeyValueStore`] for tests and single-process deployments
//! - [`LmdbKeyValueStore`] for a persistent, memory-mapped store (heed)

pub mod hub;
pub mod lmdb;
pub mod memory;

use async_trait::async_trait;
use tessera_core::StorageError;

pub use hub::{KvWatch, WatchHub};
pub use lmdb::{LmdbKeyValueStore, LmdbStoreError};
pub use memory::InMemoryKeyValueStore;

/// Result type for raw key-value operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A stored value with its revision bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision of the write that created this key.
    pub create_revision: i64,
    /// Revision of the most recent write to this key.
    pub mod_revision: i64,
}

/// Result of an ordered prefix scan.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    /// Matching entries in lexicographic key order.
    pub kvs: Vec<KeyValue>,
    /// Store revision the scan observed.
    pub revision: i64,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied at `revision`.
    Committed { revision: i64 },
    /// The condition did not hold; `current` is what the store holds now.
    Conflict { current: Option<KeyValue> },
}

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Put {
        kv: KeyValue,
        prev: Option<KeyValue>,
    },
    Delete {
        key: String,
        revision: i64,
        prev: Option<KeyValue>,
    },
}

impl KvEvent {
    pub fn key(&self) -> &str {
        match self {
            KvEvent::Put { kv, .. } => &kv.key,
            KvEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            KvEvent::Put { kv, .. } => kv.mod_revision,
            KvEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// Key-value store trait for pluggable backends.
///
/// Implementations must be thread-safe. Every successful write advances the
/// store revision by exactly one and is published to watchers in revision
/// order. Store-internal failures surface as [`StorageError::Backend`] and
/// are never retried by the implementation.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>>;

    /// Read every key starting with `prefix`, in key order.
    async fn range(&self, prefix: &str) -> StorageResult<RangeResponse>;

    /// Write `value` only if `key` does not exist.
    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<CasOutcome>;

    /// Write `value` only if `key` exists with `expected_mod_revision`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: i64,
        value: Vec<u8>,
    ) -> StorageResult<CasOutcome>;

    /// Delete `key` only if it exists with `expected_mod_revision`.
    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: i64,
    ) -> StorageResult<CasOutcome>;

    /// Stream changes under `prefix` with a revision greater than `after_revision`.
    ///
    /// Fails with [`StorageError::Compacted`] when the requested history is
    /// no longer retained.
    async fn watch(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch>;

    /// The latest committed revision.
    async fn current_revision(&self) -> StorageResult<i64>;
}
