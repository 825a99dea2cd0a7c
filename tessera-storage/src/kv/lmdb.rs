//! LMDB-backed key-value store.
//!
//! Uses heed (Rust bindings for LMDB). Two named databases live in one
//! environment:
//! - `data`: storage key -> `[create_revision: 8 bytes LE][mod_revision: 8 bytes LE][value]`
//! - `meta`: bookkeeping, currently only the store revision
//!
//! LMDB already serializes writers, but the revision counter and the watch
//! hub must advance together with the committed write, so writes also go
//! through an async mutex that is held until the event is published.

use std::path::Path;

use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use tessera_core::{StorageConfig, StorageError};
use tokio::sync::Mutex;

use super::{CasOutcome, KeyValue, KeyValueStore, KvEvent, KvWatch, RangeResponse, StorageResult, WatchHub};

const REVISION_KEY: &str = "revision";
const HEADER_LEN: usize = 16;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored value is shorter than its header.
    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StorageError {
    fn from(e: LmdbStoreError) -> Self {
        StorageError::Backend {
            reason: e.to_string(),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

fn encode_entry(create_revision: i64, mod_revision: i64, value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&create_revision.to_le_bytes());
    bytes.extend_from_slice(&mod_revision.to_le_bytes());
    bytes.extend_from_slice(value);
    bytes
}

fn decode_entry(key: &str, bytes: &[u8]) -> Result<KeyValue, LmdbStoreError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbStoreError::Corrupt {
            key: key.to_string(),
            reason: format!("{} bytes is shorter than the header", bytes.len()),
        });
    }
    let read_i64 = |range: std::ops::Range<usize>| -> Result<i64, LmdbStoreError> {
        let raw: [u8; 8] = bytes[range].try_into().map_err(|_| LmdbStoreError::Corrupt {
            key: key.to_string(),
            reason: "invalid revision header".to_string(),
        })?;
        Ok(i64::from_le_bytes(raw))
    };
    Ok(KeyValue {
        key: key.to_string(),
        create_revision: read_i64(0..8)?,
        mod_revision: read_i64(8..16)?,
        value: bytes[HEADER_LEN..].to_vec(),
    })
}

fn map_size_bytes(size_mb: usize) -> Result<usize, LmdbStoreError> {
    size_mb
        .checked_mul(1024 * 1024)
        .ok_or_else(|| LmdbStoreError::EnvOpen(format!("map size of {size_mb} MB overflows usize")))
}

/// A write prepared against the current state, applied under the writer lock.
enum Mutation {
    Put { value: Vec<u8>, create_revision: Option<i64> },
    Delete,
}

/// A persistent [`KeyValueStore`] on LMDB.
///
/// # Example
///
/// ```ignore
/// use tessera_core::StorageConfig;
/// use tessera_storage::kv::LmdbKeyValueStore;
///
/// let kv = LmdbKeyValueStore::open("/var/lib/tessera", &StorageConfig::default())?;
/// ```
pub struct LmdbKeyValueStore {
    env: Env,
    data: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
    /// Latest committed revision; the guard doubles as the writer lock.
    writer: Mutex<i64>,
    hub: WatchHub,
}

impl LmdbKeyValueStore {
    /// Open (or create) a store in `path`.
    ///
    /// The map size comes from [`StorageConfig::lmdb_map_size_mb`]. An existing
    /// store resumes at its persisted revision. Watch history starts empty, so
    /// a watch from before that revision fails with [`StorageError::Compacted`].
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, LmdbStoreError> {
        let map_size = map_size_bytes(config.lmdb_map_size_mb)?;
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let data: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("data"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let meta: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some("meta"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        let revision = match meta.get(&wtxn, REVISION_KEY).map_err(txn_err)? {
            Some(raw) => {
                let raw: [u8; 8] = raw.try_into().map_err(|_| LmdbStoreError::Corrupt {
                    key: REVISION_KEY.to_string(),
                    reason: "revision is not 8 bytes".to_string(),
                })?;
                i64::from_le_bytes(raw)
            }
            None => 0,
        };
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), revision, "Opened LMDB key-value store");

        Ok(Self {
            env,
            data,
            meta,
            writer: Mutex::new(revision),
            hub: WatchHub::with_floor(
                config.watch_history_capacity,
                config.watch_channel_capacity,
                revision,
            ),
        })
    }

    fn read_entry(&self, key: &str) -> Result<Option<KeyValue>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.data.get(&rtxn, key).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode_entry(key, bytes)?)),
            None => Ok(None),
        }
    }

    fn read_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, LmdbStoreError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let iter = self.data.prefix_iter(&rtxn, prefix).map_err(txn_err)?;
        let mut kvs = Vec::new();
        for result in iter {
            let (key, bytes) = result.map_err(txn_err)?;
            kvs.push(decode_entry(key, bytes)?);
        }
        Ok(kvs)
    }

    fn put_revision(&self, wtxn: &mut RwTxn<'_>, revision: i64) -> Result<(), LmdbStoreError> {
        self.meta
            .put(wtxn, REVISION_KEY, &revision.to_le_bytes())
            .map_err(txn_err)
    }

    /// Apply `mutation` to `key` at `revision` in a single write transaction.
    fn commit(&self, key: &str, revision: i64, mutation: &Mutation) -> Result<(), LmdbStoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        match mutation {
            Mutation::Put {
                value,
                create_revision,
            } => {
                let bytes = encode_entry(create_revision.unwrap_or(revision), revision, value);
                self.data.put(&mut wtxn, key, &bytes).map_err(txn_err)?;
            }
            Mutation::Delete => {
                self.data.delete(&mut wtxn, key).map_err(txn_err)?;
            }
        }
        self.put_revision(&mut wtxn, revision)?;
        wtxn.commit().map_err(txn_err)
    }

    /// Run a conditional write: `check` inspects the current entry and
    /// decides whether `mutation` applies.
    async fn conditional_write<F>(&self, key: &str, check: F, mutation: Mutation) -> StorageResult<CasOutcome>
    where
        F: FnOnce(Option<&KeyValue>) -> bool + Send,
    {
        let mut revision = self.writer.lock().await;
        let prev = self.read_entry(key)?;
        if !check(prev.as_ref()) {
            return Ok(CasOutcome::Conflict { current: prev });
        }

        let mutation = match (mutation, &prev) {
            (Mutation::Put { value, .. }, Some(prev)) => Mutation::Put {
                value,
                create_revision: Some(prev.create_revision),
            },
            (other, _) => other,
        };

        let next = *revision + 1;
        self.commit(key, next, &mutation)?;
        *revision = next;

        let event = match mutation {
            Mutation::Put {
                value,
                create_revision,
            } => KvEvent::Put {
                kv: KeyValue {
                    key: key.to_string(),
                    value,
                    create_revision: create_revision.unwrap_or(next),
                    mod_revision: next,
                },
                prev,
            },
            Mutation::Delete => KvEvent::Delete {
                key: key.to_string(),
                revision: next,
                prev,
            },
        };
        self.hub.publish(event);
        Ok(CasOutcome::Committed { revision: next })
    }
}

#[async_trait]
impl KeyValueStore for LmdbKeyValueStore {
    async fn get(&self, key: &str) -> StorageResult<Option<KeyValue>> {
        Ok(self.read_entry(key)?)
    }

    async fn range(&self, prefix: &str) -> StorageResult<RangeResponse> {
        // Scan under the writer lock so the reported revision matches the data.
        let revision = self.writer.lock().await;
        let kvs = self.read_prefix(prefix)?;
        Ok(RangeResponse {
            kvs,
            revision: *revision,
        })
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> StorageResult<CasOutcome> {
        self.conditional_write(
            key,
            |current| current.is_none(),
            Mutation::Put {
                value,
                create_revision: None,
            },
        )
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_mod_revision: i64,
        value: Vec<u8>,
    ) -> StorageResult<CasOutcome> {
        self.conditional_write(
            key,
            |current| current.is_some_and(|kv| kv.mod_revision == expected_mod_revision),
            Mutation::Put {
                value,
                create_revision: None,
            },
        )
        .await
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected_mod_revision: i64,
    ) -> StorageResult<CasOutcome> {
        self.conditional_write(
            key,
            |current| current.is_some_and(|kv| kv.mod_revision == expected_mod_revision),
            Mutation::Delete,
        )
        .await
    }

    async fn watch(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch> {
        let _writer = self.writer.lock().await;
        self.hub.subscribe(prefix, after_revision)
    }

    async fn current_revision(&self) -> StorageResult<i64> {
        Ok(*self.writer.lock().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LmdbKeyValueStore {
        LmdbKeyValueStore::open(dir.path(), &StorageConfig::default()).unwrap()
    }

    #[test]
    fn test_entry_header_roundtrip() {
        let bytes = encode_entry(3, 9, b"payload");
        let kv = decode_entry("/k", &bytes).unwrap();
        assert_eq!(kv.create_revision, 3);
        assert_eq!(kv.mod_revision, 9);
        assert_eq!(kv.value, b"payload");
    }

    #[test]
    fn test_short_entry_is_corrupt() {
        let err = decode_entry("/k", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, LmdbStoreError::Corrupt { .. }));
        let storage: StorageError = err.into();
        assert!(matches!(storage, StorageError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_create_get_range() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);

        kv.create("/r/b", b"b".to_vec()).await.unwrap();
        kv.create("/r/a", b"a".to_vec()).await.unwrap();
        kv.create("/s/a", b"s".to_vec()).await.unwrap();

        let got = kv.get("/r/a").await.unwrap().unwrap();
        assert_eq!(got.value, b"a");
        assert_eq!(got.create_revision, 2);

        let range = kv.range("/r/").await.unwrap();
        let keys: Vec<_> = range.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/r/a", "/r/b"]);
        assert_eq!(range.revision, 3);
    }

    #[tokio::test]
    async fn test_cas_preserves_create_revision() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);

        kv.create("/a", b"one".to_vec()).await.unwrap();
        let stale = kv.compare_and_swap("/a", 5, b"bad".to_vec()).await.unwrap();
        assert!(matches!(stale, CasOutcome::Conflict { current: Some(_) }));

        kv.compare_and_swap("/a", 1, b"two".to_vec()).await.unwrap();
        let got = kv.get("/a").await.unwrap().unwrap();
        assert_eq!((got.create_revision, got.mod_revision), (1, 2));
    }

    #[tokio::test]
    async fn test_revision_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            kv.create("/a", vec![]).await.unwrap();
            kv.create("/b", vec![]).await.unwrap();
            kv.compare_and_delete("/a", 1).await.unwrap();
        }
        let kv = open(&dir);
        assert_eq!(kv.current_revision().await.unwrap(), 3);
        assert!(kv.get("/a").await.unwrap().is_none());
        assert!(kv.get("/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_from_before_reopen_is_compacted() {
        let dir = TempDir::new().unwrap();
        {
            let kv = open(&dir);
            kv.create("/r/a", vec![]).await.unwrap();
            kv.create("/r/b", vec![]).await.unwrap();
        }
        let kv = open(&dir);
        let err = kv.watch("/r/", 0).await.unwrap_err();
        assert_eq!(
            err,
            StorageError::Compacted {
                requested: 0,
                oldest: 3
            }
        );

        let mut watch = kv.watch("/r/", 2).await.unwrap();
        kv.create("/r/c", vec![]).await.unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().revision(), 3);
    }

    #[test]
    fn test_oversized_map_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::default().with_lmdb_map_size_mb(usize::MAX);
        let err = LmdbKeyValueStore::open(dir.path(), &config).err().unwrap();
        assert!(matches!(err, LmdbStoreError::EnvOpen(_)));
    }

    #[tokio::test]
    async fn test_watch_sees_writes() {
        let dir = TempDir::new().unwrap();
        let kv = open(&dir);
        let mut watch = kv.watch("/r/", 0).await.unwrap();

        kv.create("/r/a", b"a".to_vec()).await.unwrap();
        kv.create("/x/a", b"x".to_vec()).await.unwrap();
        kv.compare_and_delete("/r/a", 1).await.unwrap();

        assert!(matches!(watch.next().await.unwrap().unwrap(), KvEvent::Put { .. }));
        match watch.next().await.unwrap().unwrap() {
            KvEvent::Delete { key, revision, .. } => {
                assert_eq!(key, "/r/a");
                assert_eq!(revision, 3);
            }
            other => panic!("expected delete, got {other:?}"),
        }
    }
}
