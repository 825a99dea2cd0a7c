//! TESSERA Client - Scoped Client Surface
//!
//! Outbound, tenant-aware access to one resource kind:
//! - [`ClusterClient`]/[`ScopedClient`] over a pluggable [`Transport`]
//! - [`ClusterLister`]/[`ScopedLister`] over the shared scoped indexer
//! - the client-layer scope capability ([`ClientScope`]) and [`Scoper`] factory
//!
//! Narrowing to a single tenant with the wildcard scope is an error value
//! ([`ClientError::ScopeMisuse`]), never a panic.

pub mod client;
pub mod context;
pub mod error;
pub mod lister;
pub mod scope;
pub mod scoper;

pub use client::{
    ClientWatch, ClusterClient, RawEventReceiver, RawEventType, RawWatchEvent, ScopedClient,
    Transport, TransportResponse,
};
pub use context::{require_scope, ClientContext, ClientLayer};
pub use error::{ClientError, ClientResult};
pub use lister::{ClusterLister, NamespaceLister, ScopedLister};
pub use scope::{ClientScope, OutboundRequest, Verb, CLUSTERS_PATH_PREFIX, SCOPE_HEADER};
pub use scoper::{DefaultScoper, Scoper};
