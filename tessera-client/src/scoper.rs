//! Factory for client scopes.

use tessera_core::{Scope, ScopeError};
use tessera_storage::cache::split_cache_key;

use crate::error::ClientResult;

/// Builds scopes from names and from cache keys.
pub trait Scoper: Send + Sync {
    /// Parse a scope name; `*` yields the wildcard.
    fn new_scope(&self, name: &str) -> ClientResult<Scope>;

    /// Recover the owning scope from a scoped cache key (`scope|ns/name`).
    fn scope_from_key(&self, key: &str) -> ClientResult<Scope>;
}

/// [`Scoper`] for the `scope|namespace/name` cache key format.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultScoper;

impl Scoper for DefaultScoper {
    fn new_scope(&self, name: &str) -> ClientResult<Scope> {
        Ok(Scope::parse(name)?)
    }

    fn scope_from_key(&self, key: &str) -> ClientResult<Scope> {
        let parts = split_cache_key(key)?;
        match parts.scope {
            Some(scope) => Ok(Scope::Concrete(scope)),
            None => Err(ScopeError::Missing.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_scope() {
        let scoper = DefaultScoper;
        assert_eq!(scoper.new_scope("root:org").unwrap().name(), "root:org");
        assert!(scoper.new_scope("*").unwrap().is_wildcard());
        assert!(scoper.new_scope("Root").is_err());
    }

    #[test]
    fn test_scope_from_key() {
        let scoper = DefaultScoper;
        assert_eq!(scoper.scope_from_key("root:a|default/x").unwrap().name(), "root:a");
        assert_eq!(scoper.scope_from_key("root:a|x").unwrap().name(), "root:a");
        assert!(scoper.scope_from_key("default/x").is_err());
        assert!(scoper.scope_from_key("*|default/x").is_err());
    }
}
