//! Resource descriptors: the declarative table that decides key layout.
//!
//! Every resource kind is described once by a [`ResourceDescriptor`]. The key
//! translator never special-cases a kind; it reads the descriptor.
//!
//! # Layout classification
//!
//! | Registered via | Layout | Key |
//! |----------------|--------|-----|
//! | [`ResourceRegistry::register_builtin`] | [`KeyLayout::Legacy`] | `<root>/<group>/<resource>/<scope[~ns]>/<name>` |
//! | [`ResourceRegistry::register_custom`] | [`KeyLayout::ScopeAware`] | `<root>/<group>/<resource>[/<identity>]/<scope>/<ns>/<name>` |
//!
//! Built-in kinds are those in the core (empty) group, the fixed set of
//! upstream API groups in [`BUILTIN_GROUPS`], or any `*.k8s.io` group. The
//! registry refuses to register a built-in group as custom and vice versa,
//! so the classification has exactly one source of truth.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, KeyError};

/// Path segment used for the empty (core) API group.
pub const CORE_GROUP_SEGMENT: &str = "core";

/// Upstream API groups whose storage layout predates scoping.
pub const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "coordination.k8s.io",
    "rbac.authorization.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
];

/// Returns true if `group` belongs to the built-in (legacy layout) set.
pub fn is_builtin_group(group: &str) -> bool {
    BUILTIN_GROUPS.contains(&group) || group.ends_with(".k8s.io")
}

/// Where a kind's storage key keeps its tenant identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyLayout {
    /// Dedicated scope segment directly after the resource prefix.
    ScopeAware,
    /// Scope folded into the namespace segment, with `default` implied.
    Legacy,
}

impl KeyLayout {
    pub fn is_legacy(&self) -> bool {
        matches!(self, KeyLayout::Legacy)
    }
}

/// Declarative description of one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub resource: String,
    pub namespaced: bool,
    pub layout: KeyLayout,
    /// Schema identity of a scope-aware custom kind. Two kinds with the same
    /// group/resource but different identities never share keys.
    pub identity: Option<String>,
}

impl ResourceDescriptor {
    pub fn builtin(group: impl Into<String>, resource: impl Into<String>, namespaced: bool) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespaced,
            layout: KeyLayout::Legacy,
            identity: None,
        }
    }

    pub fn custom(group: impl Into<String>, resource: impl Into<String>, namespaced: bool) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            namespaced,
            layout: KeyLayout::ScopeAware,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Group as it appears in a key (`core` for the empty group).
    pub fn group_segment(&self) -> &str {
        if self.group.is_empty() {
            CORE_GROUP_SEGMENT
        } else {
            &self.group
        }
    }

    /// `group/resource` lookup key.
    pub fn group_resource(&self) -> String {
        format!("{}/{}", self.group_segment(), self.resource)
    }
}

/// Table of every resource kind the process serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRegistry {
    kinds: BTreeMap<String, ResourceDescriptor>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the common built-in kinds.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins = [
            ("", "configmaps", true),
            ("", "secrets", true),
            ("", "serviceaccounts", true),
            ("", "events", true),
            ("", "namespaces", false),
            ("apps", "deployments", true),
            ("rbac.authorization.k8s.io", "roles", true),
            ("rbac.authorization.k8s.io", "clusterroles", false),
            ("apiextensions.k8s.io", "customresourcedefinitions", false),
        ];
        for (group, resource, namespaced) in builtins {
            let descriptor = ResourceDescriptor::builtin(group, resource, namespaced);
            registry.kinds.insert(descriptor.group_resource(), descriptor);
        }
        registry
    }

    /// Register a built-in kind with the legacy layout.
    pub fn register_builtin(
        &mut self,
        group: &str,
        resource: &str,
        namespaced: bool,
    ) -> Result<&ResourceDescriptor, ConfigError> {
        if !is_builtin_group(group) {
            return Err(ConfigError::InvalidValue {
                field: "group".to_string(),
                value: group.to_string(),
                reason: "not a built-in API group; register it as custom".to_string(),
            });
        }
        self.insert(ResourceDescriptor::builtin(group, resource, namespaced))
    }

    /// Register a custom kind with the scope-aware layout.
    pub fn register_custom(
        &mut self,
        group: &str,
        resource: &str,
        namespaced: bool,
        identity: Option<&str>,
    ) -> Result<&ResourceDescriptor, ConfigError> {
        if is_builtin_group(group) {
            return Err(ConfigError::InvalidValue {
                field: "group".to_string(),
                value: group.to_string(),
                reason: "built-in API groups use the legacy layout".to_string(),
            });
        }
        let mut descriptor = ResourceDescriptor::custom(group, resource, namespaced);
        if let Some(identity) = identity {
            descriptor = descriptor.with_identity(identity);
        }
        self.insert(descriptor)
    }

    fn insert(&mut self, descriptor: ResourceDescriptor) -> Result<&ResourceDescriptor, ConfigError> {
        if descriptor.resource.is_empty() || descriptor.resource.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "resource".to_string(),
                value: descriptor.resource,
                reason: "must be a non-empty path segment".to_string(),
            });
        }
        let key = descriptor.group_resource();
        if self.kinds.contains_key(&key) {
            return Err(ConfigError::InvalidValue {
                field: "resource".to_string(),
                value: key,
                reason: "already registered".to_string(),
            });
        }
        Ok(self.kinds.entry(key).or_insert(descriptor))
    }

    /// Look up a kind by group and resource.
    pub fn get(&self, group: &str, resource: &str) -> Result<&ResourceDescriptor, KeyError> {
        let group_segment = if group.is_empty() {
            CORE_GROUP_SEGMENT
        } else {
            group
        };
        let key = format!("{}/{}", group_segment, resource);
        self.kinds
            .get(&key)
            .ok_or(KeyError::UnknownResource { resource: key })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.kinds.values()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
