//! In-memory key-value store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tessera_core::StorageConfig;
use tokio::sync::RwLock;

use super::{CasOutcome, KeyValue, KeyValueStore, KvEvent, KvWatch, RangeResponse, StorageResult, WatchHub};

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<String, KeyValue>,
    revision: i64,
}

/// A [`KeyValueStore`] held entirely in memory.
///
/// Writes are serialized through one `RwLock`; events are published before
/// the lock is released so watchers see them in revision order.
#[derive(Debug)]
pub struct InMemoryKeyValueStore {
    state: RwLock<State>,
    hub: WatchHub,
}

impl InMemoryKeyValueStore {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            hub: WatchHub::new(config.watch_history_capacity, config.watch_channel_capacity),
        }
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.state.read().await.data.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.data.is_empty()
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        Ok(self.state.read().await.data.get(key).cloned())
    }

    async fn range(&self, prefix: &str) -> StorageResult<RangeResponse> {
        let state = self.state.read().await;
        let kvs = state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<CasOutcome> {
        let mut state = self.state.write().await;
        if let Some(current) = state.data.get(key) {
            return Ok(CasOutcome::Conflict {
                current: Some(current.clone()),
            });
        }
        state.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: state.revision,
            mod_revision: state.revision,
        };
        state.data.insert(key.to_string(), kv.clone());
        let revision = state.revision;
        self.hub.publish(KvEvent::Put { kv, prev: None });
        Ok(CasOutcome::Committed { revision })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: i64,
        value: Vec<u8>,
    ) -> StorageResult<CasOutcome> {
        let mut state = self.state.write().await;
        let prev = match state.data.get(key) {
            Some(current) if current.mod_revision == expected_mod_revision => current.clone(),
            current => {
                return Ok(CasOutcome::Conflict {
                    current: current.cloned(),
                })
            }
        };
        state.revision += 1;
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.create_revision,
            mod_revision: state.revision,
        };
        state.data.insert(key.to_string(), kv.clone());
        let revision = state.revision;
        self.hub.publish(KvEvent::Put {
            kv,
            prev: Some(prev),
        });
        Ok(CasOutcome::Committed { revision })
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: i64,
    ) -> StorageResult<CasOutcome> {
        let mut state = self.state.write().await;
        match state.data.get(key) {
            Some(current) if current.mod_revision == expected_mod_revision => {}
            current => {
                return Ok(CasOutcome::Conflict {
                    current: current.cloned(),
                })
            }
        }
        state.revision += 1;
        let prev = state.data.remove(key);
        let revision = state.revision;
        self.hub.publish(KvEvent::Delete {
            key: key.to_string(),
            revision,
            prev,
        });
        Ok(CasOutcome::Committed { revision })
    }

    async fn watch(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch> {
        // Hold the read lock so no write slips between history snapshot and subscription.
        let _state = self.state.read().await;
        self.hub.subscribe(prefix, after_revision)
    }

    async fn current_revision(&self) -> StorageResult<i64> {
        Ok(self.state.read().await.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryKeyValueStore {
        InMemoryKeyValueStore::default()
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let kv = store();
        let first = kv.create("/a", b"one".to_vec()).await.unwrap();
        assert_eq!(first, CasOutcome::Committed { revision: 1 });

        let second = kv.create("/a", b"two".to_vec()).await.unwrap();
        match second {
            CasOutcome::Conflict { current: Some(current) } => assert_eq!(current.value, b"one"),
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(kv.current_revision().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_revision() {
        let kv = store();
        kv.create("/a", b"one".to_vec()).await.unwrap();

        let stale = kv.compare_and_swap("/a", 7, b"x".to_vec()).await.unwrap();
        assert!(matches!(stale, CasOutcome::Conflict { .. }));

        let ok = kv.compare_and_swap("/a", 1, b"two".to_vec()).await.unwrap();
        assert_eq!(ok, CasOutcome::Committed { revision: 2 });

        let stored = kv.get("/a").await.unwrap().unwrap();
        assert_eq!(stored.value, b"two");
        assert_eq!(stored.create_revision, 1);
        assert_eq!(stored.mod_revision, 2);
    }

    #[tokio::test]
    async fn test_compare_and_swap_missing_key() {
        let kv = store();
        let outcome = kv.compare_and_swap("/missing", 0, vec![]).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict { current: None });
    }

    #[tokio::test]
    async fn test_range_is_prefix_bounded_and_ordered() {
        let kv = store();
        for key in ["/r/b", "/r/a", "/s/a", "/r"] {
            kv.create(key, vec![]).await.unwrap();
        }
        let range = kv.range("/r/").await.unwrap();
        let keys: Vec<_> = range.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/r/a", "/r/b"]);
        assert_eq!(range.revision, 4);
    }

    #[tokio::test]
    async fn test_delete_publishes_event() {
        let kv = store();
        kv.create("/a", b"one".to_vec()).await.unwrap();
        let mut watch = kv.watch("/", 1).await.unwrap();

        let outcome = kv.compare_and_delete("/a", 1).await.unwrap();
        assert_eq!(outcome, CasOutcome::Committed { revision: 2 });
        assert!(kv.is_empty().await);

        match watch.next().await.unwrap().unwrap() {
            KvEvent::Delete { key, revision, prev } => {
                assert_eq!(key, "/a");
                assert_eq!(revision, 2);
                assert_eq!(prev.unwrap().value, b"one");
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_watch_resumes_from_revision() {
        let kv = store();
        kv.create("/a", vec![1]).await.unwrap();
        kv.create("/b", vec![2]).await.unwrap();
        kv.create("/c", vec![3]).await.unwrap();

        let mut watch = kv.watch("/", 1).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().key(), "/b");
        assert_eq!(watch.next().await.unwrap().unwrap().key(), "/c");
    }
}
