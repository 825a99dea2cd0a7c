//! Scoped client surface over a pluggable [`Transport`].
//!
//! [`ClusterClient`] is the entry point for one resource kind. It narrows to
//! a single tenant with [`ClusterClient::cluster`] and reads across every
//! tenant with [`ClusterClient::list_all`] / [`ClusterClient::watch_all`].
//! Every request is scoped through [`ClientScope::scope_request`] before it is
//! handed to the transport, and every object that comes back is checked
//! against the scope it was requested under.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{
    DecodeError, KeyError, LabelSelector, Preconditions, Resource, ResourceDescriptor, Scope,
    ScopeName, StorageError, TesseraError,
};
use tessera_storage::cache::cache_key;
use tessera_storage::keys::{validate_name, validate_namespace};
use tessera_storage::{ObjectList, RejectedItem, StorageScope, WatchEvent};
use tokio::sync::mpsc;

use crate::context::{require_scope, ClientContext};
use crate::error::{ClientError, ClientResult};
use crate::scope::{ClientScope, OutboundRequest, Verb};

// ============================================================================
// TRANSPORT
// ============================================================================

/// Response to a unary request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub status: u16,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl TransportResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Kind of a raw watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawEventType {
    Added,
    Modified,
    Deleted,
    Error,
}

/// A watch event as the transport delivers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWatchEvent {
    #[serde(rename = "type")]
    pub event_type: RawEventType,
    pub object: serde_json::Value,
}

/// Receiver of raw watch events.
pub type RawEventReceiver = mpsc::Receiver<ClientResult<RawWatchEvent>>;

/// Carries scoped requests to a server.
///
/// Implementations see requests only after they have been scoped. Errors
/// are returned as-is; the client never retries on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> ClientResult<TransportResponse>;

    async fn watch(&self, request: OutboundRequest) -> ClientResult<RawEventReceiver>;
}

// ============================================================================
// SHARED REQUEST PLUMBING
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListBody {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default, rename = "resourceVersion")]
    resource_version: Option<String>,
}

fn collection_path(descriptor: &ResourceDescriptor, namespace: Option<&str>) -> String {
    let mut path = format!("/apis/{}", descriptor.group_segment());
    if let Some(ns) = namespace {
        path.push_str("/namespaces/");
        path.push_str(ns);
    }
    path.push('/');
    path.push_str(&descriptor.resource);
    path
}

fn selector_query(selector: &LabelSelector) -> Option<String> {
    if selector.is_empty() {
        return None;
    }
    let pairs: Vec<String> = selector
        .match_labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    Some(pairs.join(","))
}

fn error_message(body: &serde_json::Value) -> String {
    body.get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

fn check_status(verb: Verb, key: &str, response: TransportResponse) -> ClientResult<serde_json::Value> {
    let key = key.to_string();
    match response.status {
        200..=299 => Ok(response.body),
        404 => Err(StorageError::NotFound { key }.into()),
        409 if verb == Verb::Create => Err(StorageError::AlreadyExists { key }.into()),
        409 => Err(StorageError::Conflict { key, attempts: 1 }.into()),
        412 => Err(StorageError::PreconditionFailed {
            key,
            reason: error_message(&response.body),
        }
        .into()),
        status => Err(ClientError::Transport {
            status: Some(status),
            reason: error_message(&response.body),
        }),
    }
}

/// Decode a returned object and check it against the requesting scope.
fn decode_scoped<T: Resource>(scope: &Scope, key: &str, value: serde_json::Value) -> ClientResult<T> {
    let mut object: T = serde_json::from_value(value).map_err(|e| DecodeError::Codec {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    scope.post_decode(key, &mut object)?;
    Ok(object)
}

fn item_key(value: &serde_json::Value, index: usize) -> String {
    let meta = value.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(serde_json::Value::as_str);
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(serde_json::Value::as_str);
    match name {
        Some(name) => cache_key(None, namespace, name),
        None => format!("items[{index}]"),
    }
}

async fn send(
    transport: &dyn Transport,
    scope: &Scope,
    mut request: OutboundRequest,
    key: &str,
) -> ClientResult<serde_json::Value> {
    scope.scope_request(&mut request)?;
    let verb = request.verb;
    tracing::debug!(verb = %verb, path = %request.path, scope = %scope, "Sending request");
    let response = transport.execute(request).await?;
    check_status(verb, key, response)
}

async fn list_scoped<T: Resource>(
    transport: &dyn Transport,
    scope: &Scope,
    path: String,
    selector: &LabelSelector,
) -> ClientResult<ObjectList<T>> {
    let mut request = OutboundRequest::new(Verb::List, path.as_str());
    if let Some(query) = selector_query(selector) {
        request = request.with_query("labelSelector", query);
    }
    let body = send(transport, scope, request, &path).await?;
    let list: ListBody = serde_json::from_value(body).map_err(|e| DecodeError::Codec {
        key: path.clone(),
        reason: e.to_string(),
    })?;
    let resource_version = list
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0);

    let mut items = Vec::with_capacity(list.items.len());
    let mut rejected = Vec::new();
    for (index, value) in list.items.into_iter().enumerate() {
        let key = item_key(&value, index);
        match decode_scoped::<T>(scope, &key, value) {
            Ok(object) => items.push(object),
            // A single-tenant list is all or nothing.
            Err(e) if !scope.is_wildcard() => return Err(e),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping item from wildcard list");
                rejected.push(RejectedItem {
                    key,
                    error: into_tessera(e),
                });
            }
        }
    }

    Ok(ObjectList {
        items,
        resource_version,
        rejected,
    })
}

async fn open_watch<T: Resource>(
    transport: &dyn Transport,
    scope: &Scope,
    path: String,
    resource_version: Option<i64>,
) -> ClientResult<ClientWatch<T>> {
    let mut request = OutboundRequest::new(Verb::Watch, path);
    if let Some(rv) = resource_version {
        request = request.with_query("resourceVersion", rv.to_string());
    }
    scope.scope_request(&mut request)?;
    tracing::debug!(path = %request.path, scope = %scope, "Opening watch");
    let rx = transport.watch(request).await?;
    Ok(ClientWatch {
        rx,
        scope: scope.clone(),
        done: false,
        _marker: PhantomData,
    })
}

// ============================================================================
// WATCH
// ============================================================================

/// Typed watch over a transport event stream.
pub struct ClientWatch<T> {
    rx: RawEventReceiver,
    scope: Scope,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> ClientWatch<T> {
    /// Next event, or `None` once the watch has ended.
    ///
    /// A wildcard watch skips objects it cannot attribute to a scope. A
    /// concrete watch reports them as a terminal [`WatchEvent::Error`].
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        while !self.done {
            let raw = match self.rx.recv().await? {
                Ok(raw) => raw,
                Err(e) => return Some(self.fail(into_tessera(e))),
            };
            if raw.event_type == RawEventType::Error {
                let reason = error_message(&raw.object);
                return Some(self.fail(StorageError::Backend { reason }.into()));
            }

            let key = item_key(&raw.object, 0);
            let object = match decode_scoped::<T>(&self.scope, &key, raw.object) {
                Ok(object) => object,
                Err(e) if self.scope.is_wildcard() => {
                    tracing::warn!(key = %key, error = %e, "Skipping watch event without a scope");
                    continue;
                }
                Err(e) => return Some(self.fail(into_tessera(e))),
            };
            return Some(match raw.event_type {
                RawEventType::Added => WatchEvent::Added(object),
                RawEventType::Modified => WatchEvent::Modified(object),
                _ => WatchEvent::Deleted(object),
            });
        }
        None
    }

    fn fail(&mut self, error: TesseraError) -> WatchEvent<T> {
        self.done = true;
        self.rx.close();
        WatchEvent::Error(error)
    }
}

fn into_tessera(error: ClientError) -> TesseraError {
    match error {
        ClientError::Tessera(e) => e,
        other => StorageError::Backend {
            reason: other.to_string(),
        }
        .into(),
    }
}

// ============================================================================
// CLUSTER CLIENT
// ============================================================================

/// Client for one resource kind across every tenant.
pub struct ClusterClient<T> {
    transport: Arc<dyn Transport>,
    descriptor: ResourceDescriptor,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ClusterClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            descriptor: self.descriptor.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> ClusterClient<T> {
    pub fn new(transport: Arc<dyn Transport>, descriptor: ResourceDescriptor) -> Self {
        Self {
            transport,
            descriptor,
            _marker: PhantomData,
        }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Narrow to one tenant. The wildcard scope is refused.
    pub fn cluster(&self, scope: &Scope) -> ClientResult<ScopedClient<T>> {
        let name = scope
            .as_concrete()
            .ok_or_else(|| ClientError::scope_misuse("cluster", "a single-tenant client needs a concrete scope"))?;
        Ok(ScopedClient {
            transport: Arc::clone(&self.transport),
            descriptor: self.descriptor.clone(),
            scope: Scope::Concrete(name.clone()),
            namespace: None,
            _marker: PhantomData,
        })
    }

    /// Narrow to the scope attached to `ctx`.
    pub fn from_context(&self, ctx: &ClientContext) -> ClientResult<ScopedClient<T>> {
        self.cluster(require_scope(ctx)?)
    }

    /// List every tenant's objects. Items that carry no concrete scope are
    /// dropped into [`ObjectList::rejected`].
    pub async fn list_all(&self, selector: &LabelSelector) -> ClientResult<ObjectList<T>> {
        let path = collection_path(&self.descriptor, None);
        list_scoped(self.transport.as_ref(), &Scope::Wildcard, path, selector).await
    }

    /// Watch every tenant's objects.
    pub async fn watch_all(&self, resource_version: Option<i64>) -> ClientResult<ClientWatch<T>> {
        let path = collection_path(&self.descriptor, None);
        open_watch(self.transport.as_ref(), &Scope::Wildcard, path, resource_version).await
    }
}

// ============================================================================
// SCOPED CLIENT
// ============================================================================

/// Client bound to one concrete scope and, optionally, one namespace.
pub struct ScopedClient<T> {
    transport: Arc<dyn Transport>,
    descriptor: ResourceDescriptor,
    scope: Scope,
    namespace: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ScopedClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            descriptor: self.descriptor.clone(),
            scope: self.scope.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Resource> ScopedClient<T> {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// The same client restricted to `namespace`.
    pub fn namespaced(&self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..self.clone()
        }
    }

    fn scope_name(&self) -> Option<&ScopeName> {
        self.scope.as_concrete()
    }

    fn checked_namespace<'a>(&self, namespace: Option<&'a str>) -> ClientResult<Option<&'a str>> {
        match (self.descriptor.namespaced, namespace) {
            (true, Some(ns)) => {
                validate_namespace(ns)?;
                Ok(Some(ns))
            }
            (true, None) => Err(KeyError::InvalidSegment {
                segment: "namespace",
                value: String::new(),
                reason: format!("{} is namespaced", self.descriptor.group_resource()),
            }
            .into()),
            (false, None) => Ok(None),
            (false, Some(ns)) => Err(KeyError::InvalidSegment {
                segment: "namespace",
                value: ns.to_string(),
                reason: format!("{} is cluster-scoped", self.descriptor.group_resource()),
            }
            .into()),
        }
    }

    fn object_path(&self, namespace: Option<&str>, name: &str) -> ClientResult<(String, String)> {
        validate_name(name)?;
        let namespace = self.checked_namespace(namespace)?;
        let path = format!("{}/{name}", collection_path(&self.descriptor, namespace));
        Ok((path, cache_key(self.scope_name(), namespace, name)))
    }

    /// Resolve the namespace of an outgoing object and stamp its scope.
    fn prepare(&self, object: &mut T) -> ClientResult<()> {
        let meta = object.meta_mut();
        if let Some(bound) = &self.namespace {
            match meta.namespace.clone() {
                Some(own) if &own != bound => {
                    return Err(StorageError::InvalidObject {
                        reason: format!("object namespace {own} differs from client namespace {bound}"),
                    }
                    .into());
                }
                Some(_) => {}
                None => meta.namespace = Some(bound.clone()),
            }
        }
        if let Some(scope) = self.scope.as_concrete() {
            match meta.scope_annotation().map(str::to_string) {
                Some(claimed) if claimed != scope.as_str() => {
                    return Err(StorageError::InvalidObject {
                        reason: format!("object is annotated with scope {claimed}, client is bound to {scope}"),
                    }
                    .into());
                }
                Some(_) => {}
                None => meta.set_scope(scope),
            }
        }
        Ok(())
    }

    fn encode(&self, key: &str, object: &T) -> ClientResult<serde_json::Value> {
        serde_json::to_value(object).map_err(|e| {
            StorageError::Codec {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Fetch one object; `Ok(None)` when it does not exist in this scope.
    pub async fn get(&self, name: &str) -> ClientResult<Option<T>> {
        let (path, key) = self.object_path(self.namespace.as_deref(), name)?;
        let request = OutboundRequest::new(Verb::Get, path);
        match send(self.transport.as_ref(), &self.scope, request, &key).await {
            Ok(body) => decode_scoped(&self.scope, &key, body).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List this scope's objects, restricted to the bound namespace if any.
    pub async fn list(&self, selector: &LabelSelector) -> ClientResult<ObjectList<T>> {
        if let Some(ns) = self.namespace.as_deref() {
            self.checked_namespace(Some(ns))?;
        }
        let path = collection_path(&self.descriptor, self.namespace.as_deref());
        list_scoped(self.transport.as_ref(), &self.scope, path, selector).await
    }

    pub async fn create(&self, mut object: T) -> ClientResult<T> {
        self.prepare(&mut object)?;
        let (_, key) = self.object_path(object.meta().namespace.as_deref(), &object.meta().name)?;
        let path = collection_path(&self.descriptor, object.meta().namespace.as_deref());
        let request = OutboundRequest::new(Verb::Create, path).with_body(self.encode(&key, &object)?);
        let body = send(self.transport.as_ref(), &self.scope, request, &key).await?;
        decode_scoped(&self.scope, &key, body)
    }

    /// Replace an object. A stale `resource_version` comes back as a conflict.
    pub async fn update(&self, mut object: T) -> ClientResult<T> {
        self.prepare(&mut object)?;
        let (path, key) = self.object_path(object.meta().namespace.as_deref(), &object.meta().name)?;
        let request = OutboundRequest::new(Verb::Update, path).with_body(self.encode(&key, &object)?);
        let body = send(self.transport.as_ref(), &self.scope, request, &key).await?;
        decode_scoped(&self.scope, &key, body)
    }

    pub async fn delete(&self, name: &str, preconditions: Option<&Preconditions>) -> ClientResult<()> {
        let (path, key) = self.object_path(self.namespace.as_deref(), name)?;
        let mut request = OutboundRequest::new(Verb::Delete, path);
        if let Some(preconditions) = preconditions {
            request = request.with_body(serde_json::json!({ "preconditions": preconditions }));
        }
        send(self.transport.as_ref(), &self.scope, request, &key).await?;
        Ok(())
    }

    pub async fn watch(&self, resource_version: Option<i64>) -> ClientResult<ClientWatch<T>> {
        let path = collection_path(&self.descriptor, self.namespace.as_deref());
        open_watch(self.transport.as_ref(), &self.scope, path, resource_version).await
    }
}
