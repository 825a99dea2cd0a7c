//! Reflector: keeps a [`ScopedIndexer`] in step with a [`ScopedStore`].
//!
//! The loop is list-then-watch over the wildcard scope:
//!
//! 1. Wildcard list, `replace` the indexer, mark synced
//! 2. Watch from the list revision, applying every event
//! 3. On a watch error (compaction, lag, store failure) back off and relist
//!
//! It runs until the shutdown signal flips to `true`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{CacheConfig, LabelSelector, Resource, Scope, TesseraError, TesseraResult};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::indexer::ScopedIndexer;
use crate::context::StorageContext;
use crate::kv::KeyValueStore;
use crate::store::{ListOptions, ScopedStore};
use crate::watch::WatchEvent;

/// Mirrors one kind from the store into an indexer.
pub struct Reflector<T, K: ?Sized> {
    store: ScopedStore<T, K>,
    indexer: ScopedIndexer<T>,
    resync_backoff: Duration,
}

/// Handle to a running reflector.
#[derive(Debug)]
pub struct ReflectorHandle {
    synced: watch::Receiver<bool>,
    last_resource_version: Arc<AtomicI64>,
    task: JoinHandle<()>,
}

impl ReflectorHandle {
    /// Whether the initial list has been loaded into the indexer.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the initial list has been loaded.
    ///
    /// Returns `false` if the reflector stopped before syncing.
    pub async fn wait_for_sync(&mut self) -> bool {
        self.synced.wait_for(|synced| *synced).await.is_ok()
    }

    /// Resource version of the last list or event applied.
    pub fn last_synced_resource_version(&self) -> i64 {
        self.last_resource_version.load(Ordering::SeqCst)
    }

    /// Wait for the reflector task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Reflector task panicked");
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Why one list-and-watch cycle ended.
enum CycleEnd {
    Shutdown,
    /// The watch ended without an error; relist.
    StreamClosed,
}

impl<T, K> Reflector<T, K>
where
    T: Resource,
    K: KeyValueStore + ?Sized + 'static,
{
    pub fn new(store: ScopedStore<T, K>, indexer: ScopedIndexer<T>, config: &CacheConfig) -> Self {
        Self {
            store,
            indexer,
            resync_backoff: config.resync_backoff,
        }
    }

    /// Start the reflector on the current tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> ReflectorHandle {
        let (synced_tx, synced_rx) = watch::channel(false);
        let last_resource_version = Arc::new(AtomicI64::new(0));
        let rv = Arc::clone(&last_resource_version);
        let task = tokio::spawn(async move { self.run(shutdown, synced_tx, rv).await });
        ReflectorHandle {
            synced: synced_rx,
            last_resource_version,
            task,
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        synced: watch::Sender<bool>,
        last_resource_version: Arc<AtomicI64>,
    ) {
        let resource = self.store.descriptor().group_resource();
        tracing::info!(resource = %resource, "Reflector starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self
                .list_and_watch(shutdown.clone(), &synced, &last_resource_version)
                .await
            {
                Ok(CycleEnd::Shutdown) => break,
                Ok(CycleEnd::StreamClosed) => {
                    tracing::info!(resource = %resource, "Watch closed, relisting");
                }
                Err(e) if needs_relist(&e) => {
                    tracing::info!(resource = %resource, error = %e, "Watch history unavailable, relisting");
                }
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "Reflector cycle failed, relisting");
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.resync_backoff) => {}
            }
        }

        tracing::info!(resource = %resource, "Reflector stopped");
    }

    async fn list_and_watch(
        &self,
        shutdown: watch::Receiver<bool>,
        synced: &watch::Sender<bool>,
        last_resource_version: &AtomicI64,
    ) -> TesseraResult<CycleEnd> {
        let ctx = StorageContext::background().with_scope(Scope::Wildcard);

        let list = self.store.list(&ctx, None, &ListOptions::default()).await?;
        if !list.rejected.is_empty() {
            tracing::warn!(rejected = list.rejected.len(), "Wildcard list rejected items");
        }
        let count = list.items.len();
        self.indexer.replace(list.items, list.resource_version)?;
        last_resource_version.store(list.resource_version, Ordering::SeqCst);
        synced.send_replace(true);
        tracing::info!(items = count, resource_version = list.resource_version, "Reflector synced");

        let mut stream = self
            .store
            .watch(
                &ctx,
                None,
                LabelSelector::everything(),
                Some(list.resource_version),
                shutdown.clone(),
            )
            .await?;

        while let Some(event) = stream.next().await {
            if let WatchEvent::Error(error) = event {
                return Err(error);
            }
            let revision = event.object().map(|o| o.meta().revision()).unwrap_or(0);
            if let Err(e) = self.indexer.apply(event) {
                tracing::warn!(error = %e, "Skipping event the indexer refused");
                continue;
            }
            last_resource_version.fetch_max(revision, Ordering::SeqCst);
        }

        if *shutdown.borrow() || shutdown.has_changed().is_err() {
            Ok(CycleEnd::Shutdown)
        } else {
            Ok(CycleEnd::StreamClosed)
        }
    }
}

/// Whether an error from a reflector cycle calls for a fresh list.
pub fn needs_relist(error: &TesseraError) -> bool {
    matches!(
        error,
        TesseraError::Storage(
            tessera_core::StorageError::Compacted { .. } | tessera_core::StorageError::WatchLagged { .. }
        )
    )
}
