//! Built-in index functions.
//!
//! Index functions must be pure and deterministic: the indexer stores the
//! values they returned when an object was added and relies on them when
//! the object is later moved or removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use tessera_core::{IndexError, Resource};

/// Maps an object to the index values it is filed under.
pub type IndexFunc<T> = Arc<dyn Fn(&T) -> Result<Vec<String>, IndexError> + Send + Sync>;

/// Named index functions.
pub type Indexers<T> = BTreeMap<String, IndexFunc<T>>;

/// Objects by owning scope.
pub const SCOPE_INDEX: &str = "scope";
/// Objects by namespace, regardless of scope.
pub const NAMESPACE_INDEX: &str = "namespace";
/// Objects by `<scope>|<namespace>`.
pub const SCOPE_NAMESPACE_INDEX: &str = "scope-namespace";

/// Reserved [`SCOPE_INDEX`] value every object is filed under.
pub const MATCH_ALL_SCOPES: &str = "*";
/// [`SCOPE_INDEX`] value of objects without a scope.
pub const UNSCOPED_BUCKET: &str = "";

fn owning_scope<T: Resource>(object: &T) -> Result<String, IndexError> {
    match object.meta().scope() {
        Ok(scope) => Ok(scope.map(|s| s.to_string()).unwrap_or_default()),
        Err(e) => Err(IndexError::IndexFunc {
            name: SCOPE_INDEX.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Files an object under its scope and under [`MATCH_ALL_SCOPES`].
pub fn scope_index_func<T: Resource>(object: &T) -> Result<Vec<String>, IndexError> {
    Ok(vec![owning_scope(object)?, MATCH_ALL_SCOPES.to_string()])
}

/// Files an object under its namespace (empty for cluster-scoped objects).
pub fn namespace_index_func<T: Resource>(object: &T) -> Result<Vec<String>, IndexError> {
    Ok(vec![object.meta().namespace.clone().unwrap_or_default()])
}

/// Files an object under `<scope>|<namespace>`.
pub fn scope_namespace_index_func<T: Resource>(object: &T) -> Result<Vec<String>, IndexError> {
    Ok(vec![scope_namespace_value(
        &owning_scope(object)?,
        object.meta().namespace.as_deref().unwrap_or_default(),
    )])
}

/// Index value used by [`SCOPE_NAMESPACE_INDEX`].
pub fn scope_namespace_value(scope: &str, namespace: &str) -> String {
    format!("{scope}|{namespace}")
}

/// The three built-in indexers.
pub fn default_indexers<T: Resource>() -> Indexers<T> {
    let mut indexers: Indexers<T> = BTreeMap::new();
    indexers.insert(SCOPE_INDEX.to_string(), Arc::new(scope_index_func::<T>));
    indexers.insert(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index_func::<T>));
    indexers.insert(
        SCOPE_NAMESPACE_INDEX.to_string(),
        Arc::new(scope_namespace_index_func::<T>),
    );
    indexers
}
