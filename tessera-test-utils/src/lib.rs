//! TESSERA Test Utilities
//!
//! Centralized test infrastructure for the TESSERA workspace:
//! - Fixture resource kinds and descriptors
//! - Proptest generators for scopes, namespaces, and names
//! - Call-counting and always-contended key-value store wrappers
//! - A loopback transport that serves client requests from a `ScopedStore`
//! - Tracing setup for tests

// Re-export core types for convenience
pub use tessera_core::{
    DynamicObject, LabelSelector, ObjectMeta, Preconditions, Resource, ResourceDescriptor,
    ResourceRegistry, Scope, ScopeName, StorageError, TesseraConfig, TesseraError, TesseraResult,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_client::{
    ClientError, ClientResult, OutboundRequest, RawEventReceiver, RawEventType, RawWatchEvent,
    Transport, TransportResponse, Verb, CLUSTERS_PATH_PREFIX, SCOPE_HEADER,
};
use tessera_storage::{
    CasOutcome, InMemoryKeyValueStore, KeyValue, KeyValueStore, KvWatch, ListOptions,
    RangeResponse, ScopedStore, StorageContext, StorageResult, WatchEvent,
};
use tokio::sync::{mpsc, watch};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURE KINDS
// ============================================================================

/// Built-in, legacy-layout kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Resource for ConfigMap {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub size: u32,
    #[serde(default)]
    pub color: String,
}

/// Custom, scope-aware kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WidgetSpec,
}

impl Resource for Widget {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub mod fixtures {
    //! Ready-made descriptors, objects, and stores.

    use super::*;

    pub fn configmaps() -> ResourceDescriptor {
        ResourceDescriptor::builtin("", "configmaps", true)
    }

    pub fn widgets() -> ResourceDescriptor {
        ResourceDescriptor::custom("example.dev", "widgets", true)
    }

    /// Cluster-scoped custom kind.
    pub fn gadgets() -> ResourceDescriptor {
        ResourceDescriptor::custom("example.dev", "gadgets", false)
    }

    /// Registry with the built-ins plus the fixture kinds.
    pub fn registry() -> ResourceRegistry {
        let mut registry = ResourceRegistry::with_builtins();
        for descriptor in [widgets(), gadgets()] {
            registry
                .register_custom(&descriptor.group, &descriptor.resource, descriptor.namespaced, None)
                .expect("fixture kinds register cleanly");
        }
        registry
    }

    pub fn scope(name: &str) -> Scope {
        Scope::concrete(name).expect("fixture scope names are valid")
    }

    pub fn scope_name(name: &str) -> ScopeName {
        ScopeName::new(name).expect("fixture scope names are valid")
    }

    pub fn ctx(name: &str) -> StorageContext {
        StorageContext::background().with_scope(scope(name))
    }

    pub fn wildcard_ctx() -> StorageContext {
        StorageContext::background().with_scope(Scope::Wildcard)
    }

    pub fn config_map(namespace: &str, name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta::namespaced(namespace, name),
            data: BTreeMap::new(),
        }
    }

    pub fn widget(namespace: &str, name: &str, size: u32) -> Widget {
        Widget {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: WidgetSpec {
                size,
                color: String::new(),
            },
        }
    }

    pub fn dynamic(namespace: &str, name: &str) -> DynamicObject {
        DynamicObject::new(ObjectMeta::namespaced(namespace, name), serde_json::json!({}))
    }

    /// A store over a fresh in-memory backend with default configuration.
    pub fn memory_store<T: Resource>(descriptor: ResourceDescriptor) -> ScopedStore<T, InMemoryKeyValueStore> {
        let config = TesseraConfig::default();
        ScopedStore::new(
            Arc::new(InMemoryKeyValueStore::new(&config.storage)),
            descriptor,
            &config,
        )
        .expect("default configuration is valid")
    }
}

pub mod generators {
    //! Proptest strategies for generating TESSERA identities.

    use super::*;
    use proptest::prelude::*;

    /// A lowercase DNS label.
    pub fn arb_dns_label() -> impl Strategy<Value = String> {
        "[a-z0-9]([a-z0-9-]{0,10}[a-z0-9])?"
    }

    /// A hierarchical scope name such as `root:org:ws`.
    pub fn arb_scope_name() -> impl Strategy<Value = ScopeName> {
        prop::collection::vec(arb_dns_label(), 1..4).prop_map(|segments| {
            ScopeName::new(segments.join(":")).expect("generated segments are DNS labels")
        })
    }

    /// A concrete scope or, one time in five, the wildcard.
    pub fn arb_scope() -> impl Strategy<Value = Scope> {
        prop_oneof![
            4 => arb_scope_name().prop_map(Scope::Concrete),
            1 => Just(Scope::Wildcard),
        ]
    }

    pub fn arb_namespace() -> impl Strategy<Value = String> {
        arb_dns_label()
    }

    /// Object names: any non-empty run of safe characters, dots included.
    pub fn arb_name() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9.-]{0,20}".prop_filter("not a relative path", |name| name != "." && name != "..")
    }

    pub fn arb_labels() -> impl Strategy<Value = BTreeMap<String, String>> {
        prop::collection::btree_map(arb_dns_label(), arb_dns_label(), 0..3)
    }
}

// ============================================================================
// COUNTING STORE
// ============================================================================

/// Wraps a [`KeyValueStore`] and counts every call that reaches it.
pub struct CountingKeyValueStore<K: ?Sized> {
    inner: Arc<K>,
    calls: AtomicUsize,
}

impl<K: KeyValueStore + ?Sized> CountingKeyValueStore<K> {
    pub fn new(inner: Arc<K>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K: KeyValueStore + ?Sized> KeyValueStore for CountingKeyValueStore<K> {
    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        self.hit();
        self.inner.get(key).await
    }

    async fn range(&self, prefix: &str) -> StorageResult<RangeResponse> {
        self.hit();
        self.inner.range(prefix).await
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<CasOutcome> {
        self.hit();
        self.inner.create(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: i64,
        value: Vec<u8>,
    ) -> StorageResult<CasOutcome> {
        self.hit();
        self.inner.compare_and_swap(key, expected_mod_revision, value).await
    }

    async fn compare_and_delete(&self, key: &str, expected_mod_revision: i64) -> StorageResult<CasOutcome> {
        self.hit();
        self.inner.compare_and_delete(key, expected_mod_revision).await
    }

    async fn watch(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch> {
        self.hit();
        self.inner.watch(prefix, after_revision).await
    }

    async fn current_revision(&self) -> StorageResult<i64> {
        self.hit();
        self.inner.current_revision().await
    }
}

/// Wraps a [`KeyValueStore`] so every compare-and-swap and compare-and-delete
/// loses to a phantom concurrent writer. Reads and creates pass through.
pub struct ContendedKeyValueStore<K: ?Sized> {
    inner: Arc<K>,
    lost_races: AtomicUsize,
}

impl<K: KeyValueStore + ?Sized> ContendedKeyValueStore<K> {
    pub fn new(inner: Arc<K>) -> Self {
        Self {
            inner,
            lost_races: AtomicUsize::new(0),
        }
    }

    /// Conditional writes refused so far.
    pub fn lost_races(&self) -> usize {
        self.lost_races.load(Ordering::SeqCst)
    }

    async fn lose(&self, key: &str) -> StorageResult<CasOutcome> {
        self.lost_races.fetch_add(1, Ordering::SeqCst);
        Ok(CasOutcome::Conflict {
            current: self.inner.get(key).await?,
        })
    }
}

#[async_trait]
impl<K: KeyValueStore + ?Sized> KeyValueStore for ContendedKeyValueStore<K> {
    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        self.inner.get(key).await
    }

    async fn range(&self, prefix: &str) -> StorageResult<RangeResponse> {
        self.inner.range(prefix).await
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<CasOutcome> {
        self.inner.create(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        _expected_mod_revision: i64,
        _value: Vec<u8>,
    ) -> StorageResult<CasOutcome> {
        self.lose(key).await
    }

    async fn compare_and_delete(&self, key: &str, _expected_mod_revision: i64) -> StorageResult<CasOutcome> {
        self.lose(key).await
    }

    async fn watch(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch> {
        self.inner.watch(prefix, after_revision).await
    }

    async fn current_revision(&self) -> StorageResult<i64> {
        self.inner.current_revision().await
    }
}

// ============================================================================
// LOOPBACK TRANSPORT
// ============================================================================

/// Where a scoped request path points.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub scope: Scope,
    pub namespace: Option<String>,
    pub name: Option<String>,
}

/// Parse `/clusters/<scope>/apis/<group>[/namespaces/<ns>]/<resource>[/<name>]`.
pub fn parse_route(path: &str) -> Option<Route> {
    let rest = path.strip_prefix(CLUSTERS_PATH_PREFIX)?.strip_prefix('/')?;
    let mut segments = rest.split('/');
    let scope = Scope::parse(segments.next()?).ok()?;
    if segments.next()? != "apis" {
        return None;
    }
    let _group = segments.next()?;
    let mut segment = segments.next()?;
    let namespace = if segment == "namespaces" {
        let namespace = segments.next()?.to_string();
        segment = segments.next()?;
        Some(namespace)
    } else {
        None
    };
    let _resource = segment;
    let name = segments.next().map(str::to_string);
    if segments.next().is_some() {
        return None;
    }
    Some(Route {
        scope,
        namespace,
        name,
    })
}

fn parse_selector(query: &BTreeMap<String, String>) -> LabelSelector {
    let mut selector = LabelSelector::everything();
    if let Some(raw) = query.get("labelSelector") {
        for pair in raw.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                selector = selector.with(key, value);
            }
        }
    }
    selector
}

fn error_response(error: &TesseraError) -> TransportResponse {
    let status = match error {
        TesseraError::Storage(StorageError::NotFound { .. }) => 404,
        TesseraError::Storage(StorageError::AlreadyExists { .. } | StorageError::Conflict { .. }) => 409,
        TesseraError::Storage(StorageError::PreconditionFailed { .. }) => 412,
        TesseraError::Scope(_) | TesseraError::Key(_) => 400,
        TesseraError::Storage(StorageError::InvalidObject { .. }) => 422,
        _ => 500,
    };
    TransportResponse::status(status, error.to_string())
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// In-process [`Transport`] that serves requests from a [`ScopedStore`] of
/// untyped objects, recording every request it receives.
pub struct LoopbackTransport<K: ?Sized> {
    store: ScopedStore<DynamicObject, K>,
    requests: Mutex<Vec<OutboundRequest>>,
    shutdown: watch::Sender<bool>,
}

impl<K: KeyValueStore + ?Sized + 'static> LoopbackTransport<K> {
    pub fn new(store: ScopedStore<DynamicObject, K>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            requests: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// End every open watch.
    pub fn close_watches(&self) {
        self.shutdown.send_replace(true);
    }

    fn accept(&self, request: &OutboundRequest) -> Result<Route, TransportResponse> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let route = parse_route(&request.path)
            .ok_or_else(|| TransportResponse::status(404, format!("no route for {}", request.path)))?;
        if request.headers.get(SCOPE_HEADER).map(String::as_str) != Some(route.scope.name()) {
            return Err(TransportResponse::status(400, "scope header does not match path"));
        }
        Ok(route)
    }

    async fn serve(&self, request: OutboundRequest, route: Route) -> TesseraResult<serde_json::Value> {
        let ctx = StorageContext::background().with_scope(route.scope.clone());
        let namespace = route.namespace.as_deref();
        let name = route.name.as_deref().unwrap_or_default();
        let body_object = || -> TesseraResult<DynamicObject> {
            let body = request.body.clone().unwrap_or(serde_json::Value::Null);
            serde_json::from_value(body).map_err(|e| {
                StorageError::InvalidObject {
                    reason: e.to_string(),
                }
                .into()
            })
        };

        match request.verb {
            Verb::Get => match self.store.get(&ctx, namespace, name).await? {
                Some(object) => Ok(to_json(&object)),
                None => Err(StorageError::NotFound {
                    key: name.to_string(),
                }
                .into()),
            },
            Verb::List => {
                let options = ListOptions::default().with_selector(parse_selector(&request.query));
                let list = self.store.list(&ctx, namespace, &options).await?;
                Ok(serde_json::json!({
                    "items": list.items,
                    "resourceVersion": list.resource_version.to_string(),
                }))
            }
            Verb::Create => {
                let created = self.store.create(&ctx, body_object()?).await?;
                Ok(to_json(&created))
            }
            Verb::Update => {
                let incoming = body_object()?;
                let preconditions = incoming
                    .metadata
                    .resource_version
                    .clone()
                    .map(Preconditions::resource_version);
                let updated = self
                    .store
                    .guaranteed_update(&ctx, namespace, name, preconditions.as_ref(), |_| Ok(incoming.clone()))
                    .await?;
                Ok(to_json(&updated))
            }
            Verb::Delete => {
                let preconditions: Option<Preconditions> = request
                    .body
                    .as_ref()
                    .and_then(|body| body.get("preconditions"))
                    .and_then(|p| serde_json::from_value(p.clone()).ok());
                let deleted = self
                    .store
                    .delete(&ctx, namespace, name, preconditions.as_ref())
                    .await?;
                Ok(to_json(&deleted))
            }
            Verb::Watch => Err(StorageError::Backend {
                reason: "watch requests go through Transport::watch".to_string(),
            }
            .into()),
        }
    }
}

#[async_trait]
impl<K: KeyValueStore + ?Sized + 'static> Transport for LoopbackTransport<K> {
    async fn execute(&self, request: OutboundRequest) -> ClientResult<TransportResponse> {
        let route = match self.accept(&request) {
            Ok(route) => route,
            Err(response) => return Ok(response),
        };
        Ok(match self.serve(request, route).await {
            Ok(body) => TransportResponse::ok(body),
            Err(e) => error_response(&e),
        })
    }

    async fn watch(&self, request: OutboundRequest) -> ClientResult<RawEventReceiver> {
        let route = self.accept(&request).map_err(|response| ClientError::Transport {
            status: Some(response.status),
            reason: response.body.to_string(),
        })?;
        let ctx = StorageContext::background().with_scope(route.scope.clone());
        let resource_version = request
            .query
            .get("resourceVersion")
            .and_then(|rv| rv.parse().ok());
        let mut stream = self
            .store
            .watch(
                &ctx,
                route.namespace.as_deref(),
                parse_selector(&request.query),
                resource_version,
                self.shutdown.subscribe(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let raw = match event {
                    WatchEvent::Added(object) => RawWatchEvent {
                        event_type: RawEventType::Added,
                        object: to_json(&object),
                    },
                    WatchEvent::Modified(object) => RawWatchEvent {
                        event_type: RawEventType::Modified,
                        object: to_json(&object),
                    },
                    WatchEvent::Deleted(object) => RawWatchEvent {
                        event_type: RawEventType::Deleted,
                        object: to_json(&object),
                    },
                    WatchEvent::Error(error) => RawWatchEvent {
                        event_type: RawEventType::Error,
                        object: serde_json::json!({ "message": error.to_string() }),
                    },
                };
                if tx.send(Ok(raw)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_route() {
        let route = parse_route("/clusters/root:a/apis/example.dev/namespaces/team/widgets/w").unwrap();
        assert_eq!(route.scope, fixtures::scope("root:a"));
        assert_eq!(route.namespace.as_deref(), Some("team"));
        assert_eq!(route.name.as_deref(), Some("w"));

        let route = parse_route("/clusters/*/apis/core/nodes").unwrap();
        assert!(route.scope.is_wildcard());
        assert_eq!(route.namespace, None);
        assert_eq!(route.name, None);

        assert!(parse_route("/apis/core/nodes").is_none());
        assert!(parse_route("/clusters/root/api/core/nodes").is_none());
    }

    #[test]
    fn test_parse_selector() {
        let mut query = BTreeMap::new();
        query.insert("labelSelector".to_string(), "a=1,b=2".to_string());
        let selector = parse_selector(&query);
        assert_eq!(selector.match_labels.len(), 2);
        assert!(parse_selector(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_fixture_registry() {
        let registry = fixtures::registry();
        assert!(registry.get("example.dev", "widgets").is_ok());
        assert!(registry.get("", "configmaps").is_ok());
    }

    proptest! {
        #[test]
        fn prop_generated_scope_names_parse(scope in generators::arb_scope_name()) {
            prop_assert_eq!(Scope::parse(scope.as_str()).unwrap(), Scope::Concrete(scope));
        }
    }
}
