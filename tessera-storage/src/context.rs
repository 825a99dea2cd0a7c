//! Storage-layer scope context.

use tessera_core::{ContextLayer, Scope, ScopeError, ScopedContext, TesseraConfig};

/// Marker for the storage layer's context carrier.
#[derive(Debug, Clone, Copy)]
pub struct StorageLayer;

impl ContextLayer for StorageLayer {
    const NAME: &'static str = "storage";
}

/// Context carried by every [`ScopedStore`](crate::ScopedStore) operation.
pub type StorageContext = ScopedContext<StorageLayer>;

/// Resolve the scope an operation runs under.
///
/// An attached scope wins; otherwise the configured default applies. No
/// scope at all is a [`ScopeError::Missing`].
pub fn effective_scope(ctx: &StorageContext, config: &TesseraConfig) -> Result<Scope, ScopeError> {
    match ctx.scope() {
        Some(scope) => Ok(scope.clone()),
        None => config
            .default_scope
            .clone()
            .map(Scope::Concrete)
            .ok_or(ScopeError::Missing),
    }
}
