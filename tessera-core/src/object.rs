//! Object model shared by the store, the indexer, and the client surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScopeError;
use crate::scope::ScopeName;

/// Annotation that records the owning scope of an object.
pub const SCOPE_ANNOTATION: &str = "tessera.dev/scope";

/// Namespace implied by the legacy key layout when none is encoded.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identity and bookkeeping metadata carried by every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,
    /// Store revision of the last write, rendered as a string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Raw value of the scope annotation, if any.
    pub fn scope_annotation(&self) -> Option<&str> {
        self.annotations.get(SCOPE_ANNOTATION).map(String::as_str)
    }

    /// The owning scope recorded on the object.
    ///
    /// `Ok(None)` when unannotated; an error when the annotation holds the
    /// wildcard or an invalid name.
    pub fn scope(&self) -> Result<Option<ScopeName>, ScopeError> {
        self.scope_annotation().map(ScopeName::new).transpose()
    }

    pub fn set_scope(&mut self, scope: &ScopeName) {
        self.annotations
            .insert(SCOPE_ANNOTATION.to_string(), scope.as_str().to_string());
    }

    /// Parsed `resource_version`, or 0 when unset or malformed.
    pub fn revision(&self) -> i64 {
        self.resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(0)
    }
}

/// An object that can be stored, watched, and cached.
///
/// The kind itself is described by a [`ResourceDescriptor`](crate::ResourceDescriptor)
/// handed to the store or indexer at construction, so one Rust type can
/// serve many kinds (see [`DynamicObject`]).
///
/// # Implementation Requirements
///
/// - `meta()`/`meta_mut()` expose the object's metadata
/// - Implementations must be `Clone`, `Serialize`, and `DeserializeOwned`
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Untyped object: metadata plus an opaque JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicObject {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    pub fn new(metadata: ObjectMeta, data: serde_json::Value) -> Self {
        Self { metadata, data }
    }
}

impl Resource for DynamicObject {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Preconditions checked by conditional updates and deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preconditions {
    pub uid: Option<Uuid>,
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn uid(uid: Uuid) -> Self {
        Self {
            uid: Some(uid),
            resource_version: None,
        }
    }

    pub fn resource_version(rv: impl Into<String>) -> Self {
        Self {
            uid: None,
            resource_version: Some(rv.into()),
        }
    }

    /// Returns a reason string when `meta` violates these preconditions.
    pub fn check(&self, meta: &ObjectMeta) -> Option<String> {
        if let Some(uid) = self.uid {
            if meta.uid != Some(uid) {
                return Some(format!("uid {} does not match {:?}", uid, meta.uid));
            }
        }
        if let Some(rv) = &self.resource_version {
            if meta.resource_version.as_deref() != Some(rv.as_str()) {
                return Some(format!(
                    "resourceVersion {} does not match {:?}",
                    rv, meta.resource_version
                ));
            }
        }
        None
    }
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_annotation_roundtrip() {
        let mut meta = ObjectMeta::namespaced("default", "cm1");
        assert_eq!(meta.scope().unwrap(), None);

        let scope = ScopeName::new("root:org:ws").unwrap();
        meta.set_scope(&scope);
        assert_eq!(meta.scope_annotation(), Some("root:org:ws"));
        assert_eq!(meta.scope().unwrap(), Some(scope));
    }

    #[test]
    fn test_wildcard_annotation_is_rejected() {
        let mut meta = ObjectMeta::new("x");
        meta.annotations
            .insert(SCOPE_ANNOTATION.to_string(), "*".to_string());
        assert!(meta.scope().is_err());
    }

    #[test]
    fn test_revision_parsing() {
        let mut meta = ObjectMeta::new("x");
        assert_eq!(meta.revision(), 0);
        meta.resource_version = Some("42".to_string());
        assert_eq!(meta.revision(), 42);
        meta.resource_version = Some("garbage".to_string());
        assert_eq!(meta.revision(), 0);
    }

    #[test]
    fn test_preconditions() {
        let uid = Uuid::now_v7();
        let mut meta = ObjectMeta::new("x");
        meta.uid = Some(uid);
        meta.resource_version = Some("7".to_string());

        assert!(Preconditions::default().check(&meta).is_none());
        assert!(Preconditions::uid(uid).check(&meta).is_none());
        assert!(Preconditions::uid(Uuid::now_v7()).check(&meta).is_some());
        assert!(Preconditions::resource_version("7").check(&meta).is_none());
        assert!(Preconditions::resource_version("8").check(&meta).is_some());
    }

    #[test]
    fn test_label_selector() {
        let meta = ObjectMeta::new("x").with_label("app", "web").with_label("tier", "1");
        assert!(LabelSelector::everything().matches(&meta.labels));
        assert!(LabelSelector::default().with("app", "web").matches(&meta.labels));
        assert!(!LabelSelector::default().with("app", "db").matches(&meta.labels));
        assert!(!LabelSelector::default().with("missing", "x").matches(&meta.labels));
    }

    #[test]
    fn test_meta_serde_camel_case() {
        let mut meta = ObjectMeta::namespaced("default", "cm1");
        meta.resource_version = Some("3".to_string());
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["resourceVersion"], "3");
        assert!(json.get("labels").is_none());
    }
}
