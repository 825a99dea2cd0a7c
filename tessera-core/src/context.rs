//! Scope context carrier.
//!
//! A [`ScopedContext`] attaches a [`Scope`] to an in-flight operation so it
//! does not have to be threaded through every signature. The carrier is
//! parameterised by a layer marker: the storage layer and the outbound client
//! layer each get their own context type, and the compiler refuses to hand
//! one to the other.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::scope::Scope;

/// Marker for a layer that owns a context type.
pub trait ContextLayer: Send + Sync + 'static {
    /// Human-readable layer name, used in debug output.
    const NAME: &'static str;
}

#[derive(Debug)]
struct Frame {
    scope: Scope,
    parent: Option<Arc<Frame>>,
}

/// Immutable carrier of the nearest enclosing scope.
///
/// `with_scope` returns a child and never mutates the parent. Cloning is an
/// `Arc` bump.
pub struct ScopedContext<L: ContextLayer> {
    frame: Option<Arc<Frame>>,
    _layer: PhantomData<fn() -> L>,
}

impl<L: ContextLayer> ScopedContext<L> {
    /// A context with no scope attached.
    pub fn background() -> Self {
        Self {
            frame: None,
            _layer: PhantomData,
        }
    }

    /// Derive a child context carrying `scope`.
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self {
            frame: Some(Arc::new(Frame {
                scope,
                parent: self.frame.clone(),
            })),
            _layer: PhantomData,
        }
    }

    /// The nearest enclosing scope.
    ///
    /// `None` means "unscoped, use the default"; it never means wildcard.
    pub fn scope(&self) -> Option<&Scope> {
        self.frame.as_ref().map(|frame| &frame.scope)
    }

    /// Number of scopes pushed onto this context chain.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.frame.as_deref();
        while let Some(frame) = current {
            depth += 1;
            current = frame.parent.as_deref();
        }
        depth
    }
}

impl<L: ContextLayer> Clone for ScopedContext<L> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            _layer: PhantomData,
        }
    }
}

impl<L: ContextLayer> Default for ScopedContext<L> {
    fn default() -> Self {
        Self::background()
    }
}

impl<L: ContextLayer> fmt::Debug for ScopedContext<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedContext")
            .field("layer", &L::NAME)
            .field("scope", &self.scope())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestLayer;

    impl ContextLayer for TestLayer {
        const NAME: &'static str = "test";
    }

    type TestContext = ScopedContext<TestLayer>;

    #[test]
    fn test_background_has_no_scope() {
        let ctx = TestContext::background();
        assert!(ctx.scope().is_none());
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_with_scope_does_not_mutate_parent() {
        let parent = TestContext::background();
        let child = parent.with_scope(Scope::concrete("root:a").unwrap());

        assert!(parent.scope().is_none());
        assert_eq!(child.scope().unwrap().name(), "root:a");
    }

    #[test]
    fn test_nearest_scope_wins() {
        let outer = TestContext::background().with_scope(Scope::concrete("root:a").unwrap());
        let inner = outer.with_scope(Scope::Wildcard);

        assert_eq!(outer.scope().unwrap().name(), "root:a");
        assert!(inner.scope().unwrap().is_wildcard());
        assert_eq!(inner.depth(), 2);
    }

    #[test]
    fn test_clone_shares_scope() {
        let ctx = TestContext::background().with_scope(Scope::concrete("root").unwrap());
        let cloned = ctx.clone();
        assert_eq!(ctx.scope(), cloned.scope());
    }
}
