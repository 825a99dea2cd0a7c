//! Cache-backed listers over a [`ScopedIndexer`].
//!
//! A [`ClusterLister`] reads every tenant's objects; [`ClusterLister::cluster`]
//! narrows it to a [`ScopedLister`] that only ever sees one scope's bucket.

use tessera_core::{LabelSelector, Resource, Scope};
use tessera_storage::cache::{ScopedIndexer, SCOPE_INDEX};

use crate::context::{require_scope, ClientContext};
use crate::error::ClientResult;

/// Lister across every scope.
pub struct ClusterLister<T> {
    indexer: ScopedIndexer<T>,
}

impl<T: Resource> ClusterLister<T> {
    pub fn new(indexer: ScopedIndexer<T>) -> Self {
        Self { indexer }
    }

    /// Narrow to one scope. The wildcard scope is refused.
    pub fn cluster(&self, scope: &Scope) -> ClientResult<ScopedLister<T>> {
        Ok(ScopedLister {
            indexer: self.indexer.scoped(scope)?,
        })
    }

    pub fn from_context(&self, ctx: &ClientContext) -> ClientResult<ScopedLister<T>> {
        self.cluster(require_scope(ctx)?)
    }

    /// Every cached object regardless of scope.
    pub fn list_all(&self, selector: &LabelSelector) -> ClientResult<Vec<T>> {
        Ok(self.indexer.list_all(selector)?)
    }

    /// Scopes that currently own at least one cached object.
    pub fn scopes(&self) -> ClientResult<Vec<Scope>> {
        let values = self.indexer.index_values(SCOPE_INDEX)?;
        Ok(values
            .iter()
            .filter_map(|value| Scope::parse(value).ok())
            .filter(|scope| !scope.is_wildcard())
            .collect())
    }
}

/// Lister bound to one scope.
pub struct ScopedLister<T> {
    indexer: ScopedIndexer<T>,
}

impl<T: Resource> ScopedLister<T> {
    /// Objects owned by this scope, across namespaces.
    pub fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<T>> {
        Ok(self.indexer.list(selector)?)
    }

    /// Cluster-scoped lookup.
    pub fn get(&self, name: &str) -> ClientResult<Option<T>> {
        Ok(self.indexer.get(None, name)?)
    }

    pub fn namespaced(&self, namespace: impl Into<String>) -> NamespaceLister<T> {
        NamespaceLister {
            indexer: self.indexer.clone(),
            namespace: namespace.into(),
        }
    }
}

/// Lister bound to one scope and one namespace.
pub struct NamespaceLister<T> {
    indexer: ScopedIndexer<T>,
    namespace: String,
}

impl<T: Resource> NamespaceLister<T> {
    pub fn list(&self, selector: &LabelSelector) -> ClientResult<Vec<T>> {
        Ok(self.indexer.list_namespace(&self.namespace, selector)?)
    }

    pub fn get(&self, name: &str) -> ClientResult<Option<T>> {
        Ok(self.indexer.get(Some(&self.namespace), name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{DynamicObject, ObjectMeta, ScopeName};

    fn object(scope: &str, ns: &str, name: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(ObjectMeta::namespaced(ns, name), serde_json::json!({}));
        obj.metadata.set_scope(&ScopeName::new(scope).unwrap());
        obj
    }

    fn lister() -> ClusterLister<DynamicObject> {
        let indexer = ScopedIndexer::new();
        indexer.add(object("root:a", "default", "x")).unwrap();
        indexer.add(object("root:a", "team", "y")).unwrap();
        indexer.add(object("root:b", "default", "x")).unwrap();
        ClusterLister::new(indexer)
    }

    #[test]
    fn test_scoped_lister_sees_only_its_scope() {
        let lister = lister();
        let a = lister.cluster(&Scope::concrete("root:a").unwrap()).unwrap();
        let names: Vec<_> = a
            .list(&LabelSelector::everything())
            .unwrap()
            .into_iter()
            .map(|o| o.metadata.name)
            .collect();
        assert_eq!(names, vec!["x", "y"]);

        let got = a.namespaced("default").get("x").unwrap().unwrap();
        assert_eq!(got.metadata.scope_annotation(), Some("root:a"));
        assert!(a.namespaced("team").get("x").unwrap().is_none());
        assert_eq!(a.namespaced("team").list(&LabelSelector::everything()).unwrap().len(), 1);
    }

    #[test]
    fn test_same_identity_in_two_scopes() {
        let lister = lister();
        let b = lister.cluster(&Scope::concrete("root:b").unwrap()).unwrap();
        let got = b.namespaced("default").get("x").unwrap().unwrap();
        assert_eq!(got.metadata.scope_annotation(), Some("root:b"));
        let c = lister.cluster(&Scope::concrete("root:c").unwrap()).unwrap();
        assert!(c.namespaced("default").get("x").unwrap().is_none());
    }

    #[test]
    fn test_cluster_lister() {
        let lister = lister();
        assert_eq!(lister.list_all(&LabelSelector::everything()).unwrap().len(), 3);
        let scopes: Vec<String> = lister.scopes().unwrap().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(scopes, vec!["root:a", "root:b"]);
        assert!(lister.cluster(&Scope::Wildcard).is_err());
    }

    #[test]
    fn test_from_context() {
        let lister = lister();
        let ctx = ClientContext::background().with_scope(Scope::concrete("root:b").unwrap());
        assert_eq!(
            lister.from_context(&ctx).unwrap().list(&LabelSelector::everything()).unwrap().len(),
            1
        );
        assert!(lister.from_context(&ClientContext::background()).is_err());
    }
}
