//! Cache keys: `[<scope>|][<namespace>/]<name>`.
//!
//! The `(namespace, name)` part is the same pair the store addresses; the
//! scope part is left out for unscoped entries. Scope names never contain
//! `|` and namespaces never contain `/`, so splitting on the first of each is
//! unambiguous.

use tessera_core::{IndexError, Resource, ScopeName, WILDCARD};

/// Separator between the scope and the rest of a cache key.
pub const SCOPE_KEY_SEPARATOR: char = '|';

/// Build a cache key.
pub fn cache_key(scope: Option<&ScopeName>, namespace: Option<&str>, name: &str) -> String {
    let identity = match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    };
    match scope {
        Some(scope) => format!("{scope}{SCOPE_KEY_SEPARATOR}{identity}"),
        None => identity,
    }
}

/// Qualify a plain `namespace/name` (or `name`) key with a scope.
pub fn scoped_cache_key(scope: &ScopeName, key: &str) -> String {
    format!("{scope}{SCOPE_KEY_SEPARATOR}{key}")
}

/// Cache key of an object, taken from its scope annotation and metadata.
///
/// An object annotated with the wildcard is refused: the wildcard is never
/// a stored index key.
pub fn object_cache_key<T: Resource>(object: &T) -> Result<String, IndexError> {
    let meta = object.meta();
    if meta.scope_annotation() == Some(WILDCARD) {
        return Err(IndexError::WildcardKey {
            key: cache_key(None, meta.namespace.as_deref(), &meta.name),
        });
    }
    let scope = meta.scope().map_err(|e| IndexError::IndexFunc {
        name: "cache-key".to_string(),
        reason: e.to_string(),
    })?;
    Ok(cache_key(scope.as_ref(), meta.namespace.as_deref(), &meta.name))
}

/// Components of a cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyParts {
    pub scope: Option<ScopeName>,
    pub namespace: Option<String>,
    pub name: String,
}

/// Split a cache key into scope, namespace, and name.
pub fn split_cache_key(key: &str) -> Result<CacheKeyParts, tessera_core::ScopeError> {
    let (scope, rest) = match key.split_once(SCOPE_KEY_SEPARATOR) {
        Some((scope, rest)) => (Some(ScopeName::new(scope)?), rest),
        None => (None, key),
    };
    let (namespace, name) = match rest.split_once('/') {
        Some((ns, name)) => (Some(ns.to_string()), name.to_string()),
        None => (None, rest.to_string()),
    };
    Ok(CacheKeyParts {
        scope,
        namespace,
        name,
    })
}
