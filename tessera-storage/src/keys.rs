//! Storage key translation.
//!
//! Maps `(scope, namespace, name)` to a storage key and back, driven only by
//! the kind's [`ResourceDescriptor`].
//!
//! # Key Format
//!
//! ```text
//! scope-aware:  <root>/<group>/<resource>[/<identity>]/<scope>/<namespace>/<name>
//!               <root>/<group>/<resource>[/<identity>]/<scope>/<name>          (cluster-scoped)
//! legacy:       <root>/<group>/<resource>/<scope>/<name>                       (namespace "default" or cluster-scoped)
//!               <root>/<group>/<resource>/<scope>~<namespace>/<name>
//! ```
//!
//! Scope names are `:`-separated DNS labels and namespaces are DNS labels, so
//! neither can contain `/` or `~`; both separators are unambiguous.

use tessera_core::{
    KeyError, KeyLayout, ResourceDescriptor, Scope, ScopeName, StorageConfig, TesseraResult,
    DEFAULT_NAMESPACE,
};

/// Separator between scope and namespace in a legacy folded segment.
pub const LEGACY_NAMESPACE_SEPARATOR: char = '~';

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// Identity recovered from a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedKey {
    pub scope: ScopeName,
    pub namespace: Option<String>,
    pub name: String,
}

/// Builds and parses storage keys under one key root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTranslator {
    root: String,
}

impl KeyTranslator {
    /// `root` must start with `/` and must not end with one; [`StorageConfig::validate`]
    /// enforces this for configured roots.
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.key_root.clone())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix shared by every key of this kind, with a trailing `/`.
    pub fn resource_prefix(&self, descriptor: &ResourceDescriptor) -> String {
        match &descriptor.identity {
            Some(identity) => format!(
                "{}/{}/{}/{}/",
                self.root,
                descriptor.group_segment(),
                descriptor.resource,
                identity
            ),
            None => self.partial_metadata_prefix(descriptor),
        }
    }

    /// Prefix without the identity segment, used by partial-metadata scans.
    pub fn partial_metadata_prefix(&self, descriptor: &ResourceDescriptor) -> String {
        format!(
            "{}/{}/{}/",
            self.root,
            descriptor.group_segment(),
            descriptor.resource
        )
    }

    /// Narrowest prefix covering every key visible through `scope`.
    ///
    /// For legacy kinds the folded segment is not terminated by `/`, so the
    /// prefix also covers longer scope names (`root:org` covers `root:org:ws`)
    /// and scanners must compare the decoded scope.
    pub fn scope_prefix(&self, descriptor: &ResourceDescriptor, scope: &Scope) -> String {
        let prefix = self.resource_prefix(descriptor);
        match (scope, descriptor.layout) {
            (Scope::Wildcard, _) => prefix,
            (Scope::Concrete(name), KeyLayout::ScopeAware) => format!("{prefix}{name}/"),
            (Scope::Concrete(name), KeyLayout::Legacy) => format!("{prefix}{name}"),
        }
    }

    /// Exact prefix of one namespace inside one concrete scope.
    ///
    /// Wildcard scopes have no such prefix and fall back to [`scope_prefix`](Self::scope_prefix).
    pub fn namespace_prefix(
        &self,
        descriptor: &ResourceDescriptor,
        scope: &Scope,
        namespace: &str,
    ) -> String {
        let name = match scope {
            Scope::Concrete(name) if descriptor.namespaced => name,
            _ => return self.scope_prefix(descriptor, scope),
        };
        let prefix = self.resource_prefix(descriptor);
        match descriptor.layout {
            KeyLayout::ScopeAware => format!("{prefix}{name}/{namespace}/"),
            KeyLayout::Legacy => format!(
                "{prefix}{}/",
                fold_legacy_segment(name, Some(namespace), descriptor.namespaced)
            ),
        }
    }

    /// Build the storage key for one object.
    ///
    /// Fails with a scope-misuse error for the wildcard and with
    /// [`KeyError::InvalidSegment`] for a malformed identity.
    pub fn build_key(
        &self,
        descriptor: &ResourceDescriptor,
        scope: &Scope,
        namespace: Option<&str>,
        name: &str,
    ) -> TesseraResult<String> {
        let scope = scope.require_concrete("building a storage key")?;
        validate_name(name)?;
        let namespace = match (descriptor.namespaced, namespace) {
            (true, Some(ns)) => {
                validate_namespace(ns)?;
                Some(ns)
            }
            (true, None) => {
                return Err(KeyError::InvalidSegment {
                    segment: "namespace",
                    value: String::new(),
                    reason: format!("{} is namespaced", descriptor.group_resource()),
                }
                .into())
            }
            (false, Some(ns)) => {
                return Err(KeyError::InvalidSegment {
                    segment: "namespace",
                    value: ns.to_string(),
                    reason: format!("{} is cluster-scoped", descriptor.group_resource()),
                }
                .into())
            }
            (false, None) => None,
        };

        let prefix = self.resource_prefix(descriptor);
        let key = match (descriptor.layout, namespace) {
            (KeyLayout::ScopeAware, Some(ns)) => format!("{prefix}{scope}/{ns}/{name}"),
            (KeyLayout::ScopeAware, None) => format!("{prefix}{scope}/{name}"),
            (KeyLayout::Legacy, ns) => format!(
                "{prefix}{}/{name}",
                fold_legacy_segment(scope, ns, descriptor.namespaced)
            ),
        };
        Ok(key)
    }

    /// Recover the owning scope of a key returned by a scan over `key_prefix`.
    ///
    /// `skip_identity` drops the identity segment that follows an
    /// identity-less (partial-metadata) prefix.
    pub fn recover_scope(
        &self,
        key: &str,
        key_prefix: &str,
        layout: KeyLayout,
        skip_identity: bool,
    ) -> Result<ScopeName, KeyError> {
        let segments = split_after_prefix(key, key_prefix, skip_identity)?;
        let first = segments.first().copied().unwrap_or_default();
        match layout {
            KeyLayout::ScopeAware => parse_scope_segment(key, first),
            // Namespacing does not affect the scope part of a folded segment.
            KeyLayout::Legacy => unfold_legacy_segment(key, first, true).map(|(scope, _)| scope),
        }
    }

    /// Decode a key with the descriptor's own layout.
    pub fn decode_key(
        &self,
        key: &str,
        descriptor: &ResourceDescriptor,
        key_prefix: &str,
        skip_identity: bool,
    ) -> Result<DecodedKey, KeyError> {
        self.decode_key_as(key, descriptor, descriptor.layout, key_prefix, skip_identity)
    }

    /// Decode a key as if the kind used `layout`.
    ///
    /// Used to retry a failed scope-aware decode with the legacy rule.
    pub fn decode_key_as(
        &self,
        key: &str,
        descriptor: &ResourceDescriptor,
        layout: KeyLayout,
        key_prefix: &str,
        skip_identity: bool,
    ) -> Result<DecodedKey, KeyError> {
        let segments = split_after_prefix(key, key_prefix, skip_identity)?;
        let expected = match (layout, descriptor.namespaced) {
            (KeyLayout::ScopeAware, true) => 3,
            _ => 2,
        };
        if segments.len() != expected {
            return Err(KeyError::TooFewSegments {
                key: key.to_string(),
                expected,
                got: segments.len(),
            });
        }

        let (scope, namespace, name) = match layout {
            KeyLayout::ScopeAware if descriptor.namespaced => (
                parse_scope_segment(key, segments[0])?,
                Some(segments[1].to_string()),
                segments[2],
            ),
            KeyLayout::ScopeAware => (parse_scope_segment(key, segments[0])?, None, segments[1]),
            KeyLayout::Legacy => {
                let (scope, namespace) =
                    unfold_legacy_segment(key, segments[0], descriptor.namespaced)?;
                (scope, namespace, segments[1])
            }
        };
        if let Some(ns) = &namespace {
            validate_namespace(ns)?;
        }
        validate_name(name)?;

        Ok(DecodedKey {
            scope,
            namespace,
            name: name.to_string(),
        })
    }
}

/// Fold scope and namespace into a legacy key segment.
///
/// The implicit namespace (`default` for namespaced kinds, none for
/// cluster-scoped kinds) is left out.
pub fn fold_legacy_segment(scope: &ScopeName, namespace: Option<&str>, namespaced: bool) -> String {
    match namespace {
        Some(ns) if namespaced && ns != DEFAULT_NAMESPACE => {
            format!("{scope}{LEGACY_NAMESPACE_SEPARATOR}{ns}")
        }
        _ => scope.to_string(),
    }
}

/// Split a legacy folded segment into scope and namespace.
///
/// A segment with no `~` suffix maps to `default` for namespaced kinds.
pub fn unfold_legacy_segment(
    key: &str,
    segment: &str,
    namespaced: bool,
) -> Result<(ScopeName, Option<String>), KeyError> {
    let invalid = |reason: &str| KeyError::InvalidLegacySegment {
        key: key.to_string(),
        segment: segment.to_string(),
        reason: reason.to_string(),
    };

    match segment.split_once(LEGACY_NAMESPACE_SEPARATOR) {
        Some((scope, namespace)) => {
            if !namespaced {
                return Err(invalid("cluster-scoped kinds carry no namespace"));
            }
            if namespace.is_empty() {
                return Err(invalid("empty namespace suffix"));
            }
            let scope = ScopeName::new(scope).map_err(|e| invalid(&e.to_string()))?;
            Ok((scope, Some(namespace.to_string())))
        }
        None => {
            let scope = ScopeName::new(segment).map_err(|e| invalid(&e.to_string()))?;
            Ok((scope, namespaced.then(|| DEFAULT_NAMESPACE.to_string())))
        }
    }
}

fn split_after_prefix<'k>(
    key: &'k str,
    key_prefix: &str,
    skip_identity: bool,
) -> Result<Vec<&'k str>, KeyError> {
    let rest = key
        .strip_prefix(key_prefix)
        .ok_or_else(|| KeyError::PrefixMismatch {
            key: key.to_string(),
            prefix: key_prefix.to_string(),
        })?;
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    let mut segments: Vec<&str> = rest.split('/').collect();
    if skip_identity {
        if segments.len() < 2 {
            return Err(KeyError::TooFewSegments {
                key: key.to_string(),
                expected: 2,
                got: segments.len(),
            });
        }
        segments.remove(0);
    }
    Ok(segments)
}

fn parse_scope_segment(key: &str, segment: &str) -> Result<ScopeName, KeyError> {
    ScopeName::new(segment).map_err(|e| KeyError::InvalidSegment {
        segment: "scope",
        value: segment.to_string(),
        reason: format!("{e} (in {key})"),
    })
}

/// Namespaces are lowercase DNS labels.
pub fn validate_namespace(namespace: &str) -> Result<(), KeyError> {
    let invalid = |reason: &str| KeyError::InvalidSegment {
        segment: "namespace",
        value: namespace.to_string(),
        reason: reason.to_string(),
    };
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(invalid("must be 1-63 characters"));
    }
    let valid_chars = namespace
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !valid_chars || namespace.starts_with('-') || namespace.ends_with('-') {
        return Err(invalid("must be a lowercase DNS label"));
    }
    Ok(())
}

/// Names are non-empty path segments.
pub fn validate_name(name: &str) -> Result<(), KeyError> {
    let invalid = |reason: &str| KeyError::InvalidSegment {
        segment: "name",
        value: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid("must be 1-253 characters"));
    }
    if name.contains('/') {
        return Err(invalid("must not contain '/'"));
    }
    if name == "." || name == ".." {
        return Err(invalid("must not be a relative path"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TesseraError;

    fn translator() -> KeyTranslator {
        KeyTranslator::new("/registry")
    }

    fn scope(name: &str) -> Scope {
        Scope::concrete(name).unwrap()
    }

    #[test]
    fn test_scope_aware_key_scenario() {
        let kt = translator();
        let d = ResourceDescriptor::custom("group", "resource", true);
        let key = kt
            .build_key(&d, &scope("root:org:ws"), Some("default"), "cm1")
            .unwrap();
        assert_eq!(key, "/registry/group/resource/root:org:ws/default/cm1");

        let prefix = kt.resource_prefix(&d);
        assert_eq!(prefix, "/registry/group/resource/");
        let recovered = kt
            .recover_scope(&key, &prefix, KeyLayout::ScopeAware, false)
            .unwrap();
        assert_eq!(recovered.as_str(), "root:org:ws");
    }

    #[test]
    fn test_legacy_key_scenario() {
        let kt = translator();
        let d = ResourceDescriptor::builtin("", "configmaps", true);
        let key = "/registry/core/configmaps/root:org:ws/somename";
        let prefix = kt.resource_prefix(&d);

        let recovered = kt.recover_scope(key, &prefix, KeyLayout::Legacy, false).unwrap();
        assert_eq!(recovered.as_str(), "root:org:ws");

        let decoded = kt.decode_key(key, &d, &prefix, false).unwrap();
        assert_eq!(decoded.namespace.as_deref(), Some("default"));
        assert_eq!(decoded.name, "somename");
    }

    #[test]
    fn test_legacy_non_default_namespace_is_folded() {
        let kt = translator();
        let d = ResourceDescriptor::builtin("", "configmaps", true);
        let key = kt
            .build_key(&d, &scope("root:org"), Some("kube-system"), "cfg")
            .unwrap();
        assert_eq!(key, "/registry/core/configmaps/root:org~kube-system/cfg");

        let decoded = kt
            .decode_key(&key, &d, &kt.resource_prefix(&d), false)
            .unwrap();
        assert_eq!(decoded.scope.as_str(), "root:org");
        assert_eq!(decoded.namespace.as_deref(), Some("kube-system"));
    }

    #[test]
    fn test_cluster_scoped_keys() {
        let kt = translator();
        let legacy = ResourceDescriptor::builtin("", "namespaces", false);
        let key = kt.build_key(&legacy, &scope("root"), None, "team-a").unwrap();
        assert_eq!(key, "/registry/core/namespaces/root/team-a");
        let decoded = kt
            .decode_key(&key, &legacy, &kt.resource_prefix(&legacy), false)
            .unwrap();
        assert_eq!(decoded.namespace, None);

        let custom = ResourceDescriptor::custom("example.dev", "widgets", false);
        let key = kt.build_key(&custom, &scope("root"), None, "w").unwrap();
        assert_eq!(key, "/registry/example.dev/widgets/root/w");
    }

    #[test]
    fn test_wildcard_build_key_is_scope_misuse() {
        let kt = translator();
        let d = ResourceDescriptor::custom("group", "resource", true);
        let err = kt
            .build_key(&d, &Scope::Wildcard, Some("default"), "cm1")
            .unwrap_err();
        assert!(err.is_scope_misuse());
    }

    #[test]
    fn test_namespace_mismatch_with_kind() {
        let kt = translator();
        let namespaced = ResourceDescriptor::custom("g", "r", true);
        let cluster = ResourceDescriptor::custom("g", "c", false);

        let err = kt.build_key(&namespaced, &scope("root"), None, "x").unwrap_err();
        assert!(matches!(err, TesseraError::Key(KeyError::InvalidSegment { segment: "namespace", .. })));

        let err = kt
            .build_key(&cluster, &scope("root"), Some("default"), "x")
            .unwrap_err();
        assert!(matches!(err, TesseraError::Key(KeyError::InvalidSegment { segment: "namespace", .. })));
    }

    #[test]
    fn test_invalid_segments() {
        let kt = translator();
        let d = ResourceDescriptor::custom("g", "r", true);
        for (ns, name) in [("default", ""), ("default", "a/b"), ("Bad", "x"), ("a~b", "x"), ("default", "..")] {
            assert!(
                kt.build_key(&d, &scope("root"), Some(ns), name).is_err(),
                "{ns}/{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_identity_and_partial_metadata_prefix() {
        let kt = translator();
        let d = ResourceDescriptor::custom("example.dev", "widgets", true).with_identity("id-123");
        let key = kt.build_key(&d, &scope("root:a"), Some("ns1"), "w1").unwrap();
        assert_eq!(key, "/registry/example.dev/widgets/id-123/root:a/ns1/w1");

        let partial = kt.partial_metadata_prefix(&d);
        assert_eq!(partial, "/registry/example.dev/widgets/");
        let recovered = kt.recover_scope(&key, &partial, KeyLayout::ScopeAware, true).unwrap();
        assert_eq!(recovered.as_str(), "root:a");

        let decoded = kt.decode_key(&key, &d, &partial, true).unwrap();
        assert_eq!(decoded.name, "w1");
    }

    #[test]
    fn test_prefix_mismatch() {
        let kt = translator();
        let err = kt
            .recover_scope("/other/x/y", "/registry/g/r/", KeyLayout::ScopeAware, false)
            .unwrap_err();
        assert!(matches!(err, KeyError::PrefixMismatch { .. }));
    }

    #[test]
    fn test_scope_aware_decode_of_legacy_key_fails_then_legacy_succeeds() {
        let kt = translator();
        let d = ResourceDescriptor::custom("g", "r", true);
        let prefix = kt.resource_prefix(&d);
        let key = "/registry/g/r/root:org~team/thing";

        assert!(kt.decode_key(key, &d, &prefix, false).is_err());
        let decoded = kt
            .decode_key_as(key, &d, KeyLayout::Legacy, &prefix, false)
            .unwrap();
        assert_eq!(decoded.scope.as_str(), "root:org");
        assert_eq!(decoded.namespace.as_deref(), Some("team"));
    }

    #[test]
    fn test_scope_and_namespace_prefixes() {
        let kt = translator();
        let custom = ResourceDescriptor::custom("g", "r", true);
        let legacy = ResourceDescriptor::builtin("", "secrets", true);

        assert_eq!(kt.scope_prefix(&custom, &scope("root")), "/registry/g/r/root/");
        assert_eq!(kt.scope_prefix(&custom, &Scope::Wildcard), "/registry/g/r/");
        assert_eq!(kt.scope_prefix(&legacy, &scope("root")), "/registry/core/secrets/root");
        assert_eq!(
            kt.namespace_prefix(&custom, &scope("root"), "ns"),
            "/registry/g/r/root/ns/"
        );
        assert_eq!(
            kt.namespace_prefix(&legacy, &scope("root"), "default"),
            "/registry/core/secrets/root/"
        );
        assert_eq!(
            kt.namespace_prefix(&legacy, &scope("root"), "ns"),
            "/registry/core/secrets/root~ns/"
        );
    }

    #[test]
    fn test_unfold_rejects_namespace_on_cluster_kind() {
        let err = unfold_legacy_segment("/k", "root~ns", false).unwrap_err();
        assert!(matches!(err, KeyError::InvalidLegacySegment { .. }));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn label() -> impl Strategy<Value = String> {
        "[a-z0-9]([a-z0-9-]{0,8}[a-z0-9])?"
    }

    fn scope_name() -> impl Strategy<Value = ScopeName> {
        prop::collection::vec(label(), 1..4).prop_map(|labels| {
            ScopeName::new(labels.join(":")).expect("generated labels form a valid scope")
        })
    }

    fn object_name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9][a-zA-Z0-9._~-]{0,20}"
    }

    fn descriptor() -> impl Strategy<Value = ResourceDescriptor> {
        prop_oneof![
            Just(ResourceDescriptor::custom("example.dev", "widgets", true)),
            Just(ResourceDescriptor::custom("example.dev", "gadgets", false)),
            Just(ResourceDescriptor::custom("example.dev", "tagged", true).with_identity("abc")),
            Just(ResourceDescriptor::builtin("", "configmaps", true)),
            Just(ResourceDescriptor::builtin("", "namespaces", false)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_build_recover_roundtrip(
            d in descriptor(),
            scope in scope_name(),
            ns in label(),
            name in object_name(),
        ) {
            let kt = KeyTranslator::new("/registry");
            let namespace = d.namespaced.then_some(ns.as_str());
            let key = kt.build_key(&d, &Scope::Concrete(scope.clone()), namespace, &name)
                .expect("valid identity builds a key");

            let prefix = kt.resource_prefix(&d);
            let recovered = kt.recover_scope(&key, &prefix, d.layout, false)
                .expect("own keys always recover");
            prop_assert_eq!(&recovered, &scope);

            let decoded = kt.decode_key(&key, &d, &prefix, false).expect("own keys decode");
            prop_assert_eq!(decoded.scope, scope);
            prop_assert_eq!(decoded.namespace.as_deref(), namespace);
            prop_assert_eq!(decoded.name, name);
        }

        #[test]
        fn prop_distinct_scopes_never_share_keys(
            a in scope_name(),
            b in scope_name(),
            name in object_name(),
        ) {
            prop_assume!(a != b);
            let kt = KeyTranslator::new("/registry");
            let d = ResourceDescriptor::builtin("", "configmaps", true);
            let ka = kt.build_key(&d, &Scope::Concrete(a), Some("default"), &name).expect("key");
            let kb = kt.build_key(&d, &Scope::Concrete(b), Some("default"), &name).expect("key");
            prop_assert_ne!(ka, kb);
        }
    }
}
