//! Scoped indexer and the reflector that feeds it.
//!
//! One [`ScopedIndexer`] holds every scope's objects for a kind. Handles
//! obtained through [`ScopedIndexer::scoped`] share the same state but read
//! only their own scope's bucket, so a lister built for `root:a` can never
//! return an object owned by `root:b`.
//!
//! # Example
//!
//! ```ignore
//! let indexer = ScopedIndexer::new();
//! let handle = Reflector::new(store, indexer.clone(), &config.cache).spawn(shutdown);
//!
//! let org = indexer.scoped(&Scope::concrete("root:org")?)?;
//! let widgets = org.list_namespace("default", &LabelSelector::everything())?;
//! ```

pub mod index_funcs;
pub mod indexer;
pub mod key;
pub mod reflector;

pub use index_funcs::{
    default_indexers, namespace_index_func, scope_index_func, scope_namespace_index_func,
    scope_namespace_value, IndexFunc, Indexers, MATCH_ALL_SCOPES, NAMESPACE_INDEX, SCOPE_INDEX,
    SCOPE_NAMESPACE_INDEX, UNSCOPED_BUCKET,
};
pub use indexer::ScopedIndexer;
pub use key::{
    cache_key, object_cache_key, scoped_cache_key, split_cache_key, CacheKeyParts,
    SCOPE_KEY_SEPARATOR,
};
pub use reflector::{needs_relist, Reflector, ReflectorHandle};
