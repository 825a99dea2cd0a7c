//! Client-layer scope context.

use tessera_core::{ContextLayer, Scope, ScopeError, ScopedContext};

/// Marker for the outbound client's context carrier.
#[derive(Debug, Clone, Copy)]
pub struct ClientLayer;

impl ContextLayer for ClientLayer {
    const NAME: &'static str = "client";
}

/// Context carried by outbound calls. Distinct from
/// [`StorageContext`](tessera_storage::StorageContext).
pub type ClientContext = ScopedContext<ClientLayer>;

/// The scope attached to `ctx`; outbound calls have no default scope.
pub fn require_scope(ctx: &ClientContext) -> Result<&Scope, ScopeError> {
    ctx.scope().ok_or(ScopeError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_scope() {
        let ctx = ClientContext::background();
        assert_eq!(require_scope(&ctx), Err(ScopeError::Missing));

        let scoped = ctx.with_scope(Scope::concrete("root:org").unwrap());
        assert_eq!(require_scope(&scoped).unwrap().name(), "root:org");
        assert!(ctx.scope().is_none());
    }
}
