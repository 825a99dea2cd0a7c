//! The outbound client's view of a [`Scope`].
//!
//! Scoping a request rewrites its path under `/clusters/<scope>` and tags it
//! with the [`SCOPE_HEADER`]. The wildcard scope may only be attached to read
//! verbs; anything else is refused before the transport sees it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::Scope;
use tessera_storage::cache::scoped_cache_key;

use crate::error::{ClientError, ClientResult};

/// Header naming the scope an outbound request targets.
pub const SCOPE_HEADER: &str = "x-tessera-scope";

/// Path prefix under which scoped requests are routed.
pub const CLUSTERS_PATH_PREFIX: &str = "/clusters";

/// Request verbs understood by the client surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn is_read(self) -> bool {
        matches!(self, Verb::Get | Verb::List | Verb::Watch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request on its way to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub verb: Verb,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl OutboundRequest {
    pub fn new(verb: Verb, path: impl Into<String>) -> Self {
        Self {
            verb,
            path: path.into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// The scope header, if the request has been scoped.
    pub fn scope_header(&self) -> Option<&str> {
        self.headers.get(SCOPE_HEADER).map(String::as_str)
    }
}

/// What the client layer asks of a scope.
pub trait ClientScope {
    fn name(&self) -> &str;

    /// Qualify a `namespace/name` cache key with this scope.
    fn cache_key(&self, key: &str) -> ClientResult<String>;

    /// Route `request` to this scope.
    fn scope_request(&self, request: &mut OutboundRequest) -> ClientResult<()>;
}

impl ClientScope for Scope {
    fn name(&self) -> &str {
        Scope::name(self)
    }

    fn cache_key(&self, key: &str) -> ClientResult<String> {
        match self {
            Scope::Concrete(name) => Ok(scoped_cache_key(name, key)),
            Scope::Wildcard => Err(ClientError::scope_misuse(
                "cache key",
                "the wildcard scope never owns a cache entry",
            )),
        }
    }

    fn scope_request(&self, request: &mut OutboundRequest) -> ClientResult<()> {
        if self.is_wildcard() && !request.verb.is_read() {
            return Err(ClientError::scope_misuse(
                request.verb.as_str(),
                "the wildcard scope only serves get, list, and watch",
            ));
        }
        if let Some(existing) = request.scope_header() {
            return Err(ClientError::scope_misuse(
                request.verb.as_str(),
                format!("request is already scoped to {existing}"),
            ));
        }
        request.path = format!("{CLUSTERS_PATH_PREFIX}/{}{}", self.name(), request.path);
        request
            .headers
            .insert(SCOPE_HEADER.to_string(), self.name().to_string());
        Ok(())
    }
}
