//! TESSERA Storage - Scope-Aware Object Store
//!
//! Stores objects of every scope in one key-value keyspace. The key layout
//! is decided per kind by its [`ResourceDescriptor`](tessera_core::ResourceDescriptor);
//! concrete-scope operations touch exactly one scope's keys, while wildcard
//! list/watch span all scopes and recover each object's owner from its key.
//!
//! The [`cache`] module holds the scoped indexer that client-side listers
//! read from.

pub mod audit;
pub mod cache;
mod codec;
pub mod context;
pub mod keys;
pub mod kv;
pub mod scope_capability;
pub mod store;
pub mod watch;

pub use audit::{AuditRecord, AuditSink, AuditedStore, InMemoryAuditLog};
pub use cache::{
    cache_key, default_indexers, needs_relist, object_cache_key, split_cache_key, CacheKeyParts,
    IndexFunc, Indexers, Reflector, ReflectorHandle, ScopedIndexer, MATCH_ALL_SCOPES,
    NAMESPACE_INDEX, SCOPE_INDEX, SCOPE_NAMESPACE_INDEX,
};
pub use context::{effective_scope, StorageContext, StorageLayer};
pub use keys::{DecodedKey, KeyTranslator, LEGACY_NAMESPACE_SEPARATOR};
pub use kv::{
    CasOutcome, InMemoryKeyValueStore, KeyValue, KeyValueStore, KvEvent, KvWatch,
    LmdbKeyValueStore, LmdbStoreError, RangeResponse, StorageResult, WatchHub,
};
pub use scope_capability::StorageScope;
pub use store::{ListOptions, ObjectList, RejectedItem, ScopedStore};
pub use watch::{WatchEvent, WatchStream};
