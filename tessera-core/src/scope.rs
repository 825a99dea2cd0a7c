//! Scope values: the tenant identity every key and cached object carries.
//!
//! A [`Scope`] is either a concrete, validated [`ScopeName`] or the wildcard.
//! The wildcard is a query-time marker meaning "every tenant". It is legal
//! as a read parameter and nowhere else, so every write path and every
//! single-tenant narrowing goes through [`Scope::require_concrete`].

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScopeError;

/// Textual form of the wildcard scope.
pub const WILDCARD: &str = "*";

/// Separator between the segments of a hierarchical scope name.
pub const SCOPE_PATH_SEPARATOR: char = ':';

static SCOPE_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(:[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$")
        .expect("scope name pattern is a valid regex")
});

/// A validated, concrete tenant name such as `root:org:ws`.
///
/// Segments are DNS labels joined by `:`. The wildcard `*` can never be a
/// `ScopeName`, which is what keeps it out of storage keys and cache indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeName(String);

impl ScopeName {
    /// Validate and wrap a scope name.
    pub fn new(name: impl Into<String>) -> Result<Self, ScopeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ScopeError::InvalidName {
                name,
                reason: "must not be empty".to_string(),
            });
        }
        if name == WILDCARD {
            return Err(ScopeError::InvalidName {
                name,
                reason: "the wildcard is not a concrete scope name".to_string(),
            });
        }
        if !SCOPE_NAME_PATTERN.is_match(&name) {
            return Err(ScopeError::InvalidName {
                name,
                reason: "must be ':'-separated lowercase DNS labels".to_string(),
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The enclosing scope, e.g. `root:org` for `root:org:ws`.
    pub fn parent(&self) -> Option<ScopeName> {
        self.0
            .rsplit_once(SCOPE_PATH_SEPARATOR)
            .map(|(parent, _)| ScopeName(parent.to_string()))
    }

    /// Last path segment, e.g. `ws` for `root:org:ws`.
    pub fn base(&self) -> &str {
        self.0
            .rsplit_once(SCOPE_PATH_SEPARATOR)
            .map(|(_, base)| base)
            .unwrap_or(&self.0)
    }

    /// Append a child segment.
    pub fn join(&self, child: &str) -> Result<ScopeName, ScopeError> {
        ScopeName::new(format!("{}{}{}", self.0, SCOPE_PATH_SEPARATOR, child))
    }
}

impl fmt::Display for ScopeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ScopeName {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ScopeName::new(value)
    }
}

impl From<ScopeName> for String {
    fn from(value: ScopeName) -> Self {
        value.0
    }
}

impl FromStr for ScopeName {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScopeName::new(s)
    }
}

/// A tenant selector: one concrete tenant, or every tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scope {
    Concrete(ScopeName),
    Wildcard,
}

impl Scope {
    /// Parse a scope; `*` yields the wildcard.
    pub fn parse(value: &str) -> Result<Self, ScopeError> {
        if value == WILDCARD {
            Ok(Scope::Wildcard)
        } else {
            ScopeName::new(value).map(Scope::Concrete)
        }
    }

    pub fn concrete(name: impl Into<String>) -> Result<Self, ScopeError> {
        ScopeName::new(name).map(Scope::Concrete)
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Scope::Wildcard)
    }

    /// Name of the scope; `*` for the wildcard.
    pub fn name(&self) -> &str {
        match self {
            Scope::Concrete(name) => name.as_str(),
            Scope::Wildcard => WILDCARD,
        }
    }

    pub fn as_concrete(&self) -> Option<&ScopeName> {
        match self {
            Scope::Concrete(name) => Some(name),
            Scope::Wildcard => None,
        }
    }

    /// Borrow the concrete name or fail with a scope-misuse error naming `operation`.
    pub fn require_concrete(&self, operation: &str) -> Result<&ScopeName, ScopeError> {
        self.as_concrete().ok_or_else(|| ScopeError::WildcardMisuse {
            operation: operation.to_string(),
        })
    }

    /// Whether an object owned by `owner` is visible through this scope.
    pub fn matches(&self, owner: &ScopeName) -> bool {
        match self {
            Scope::Concrete(name) => name == owner,
            Scope::Wildcard => true,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<ScopeName> for Scope {
    fn from(value: ScopeName) -> Self {
        Scope::Concrete(value)
    }
}

impl TryFrom<String> for Scope {
    type Error = ScopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Scope::parse(&value)
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.name().to_string()
    }
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::parse(s)
    }
}
