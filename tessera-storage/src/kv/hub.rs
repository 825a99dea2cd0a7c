//! Event fan-out shared by the key-value backends.
//!
//! Backends call [`WatchHub::publish`] while still holding their write lock,
//! and [`WatchHub::subscribe`] while holding at least a read lock, so a new
//! watcher's replayed backlog and its live feed meet without a gap.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tessera_core::StorageError;
use tokio::sync::broadcast;

use super::{KvEvent, StorageResult};

#[derive(Debug, Default)]
struct History {
    events: VecDeque<KvEvent>,
    /// Highest revision that has been evicted from `events`.
    evicted_through: i64,
}

/// Bounded event history plus a broadcast channel for live events.
#[derive(Debug)]
pub struct WatchHub {
    sender: broadcast::Sender<KvEvent>,
    history: Mutex<History>,
    capacity: usize,
}

impl WatchHub {
    /// Create a hub retaining `history_capacity` events for replay and
    /// buffering `channel_capacity` live events per subscriber.
    pub fn new(history_capacity: usize, channel_capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            history: Mutex::new(History::default()),
            capacity: history_capacity,
        }
    }

    /// Create a hub whose history starts after `floor`.
    ///
    /// Watches from a revision below `floor` fail with
    /// [`StorageError::Compacted`]. Persistent backends pass the revision
    /// they reopened at, since events up to it were never retained.
    pub fn with_floor(history_capacity: usize, channel_capacity: usize, floor: i64) -> Self {
        let hub = Self::new(history_capacity, channel_capacity);
        if let Ok(mut history) = hub.history.lock() {
            history.evicted_through = floor;
        }
        hub
    }

    /// Record and broadcast a committed event.
    pub fn publish(&self, event: KvEvent) {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(revision = event.revision(), "Watch history lock poisoned, recovering");
            self.history.clear_poison();
            poisoned.into_inner()
        });
        history.events.push_back(event.clone());
        while history.events.len() > self.capacity {
            if let Some(evicted) = history.events.pop_front() {
                history.evicted_through = evicted.revision();
            }
        }
        drop(history);
        // No receivers is fine; the event is still in history.
        let _ = self.sender.send(event);
    }

    /// Open a watch on `prefix` for events newer than `after_revision`.
    pub fn subscribe(&self, prefix: &str, after_revision: i64) -> StorageResult<KvWatch> {
        let receiver = self.sender.subscribe();
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if after_revision < history.evicted_through {
            return Err(StorageError::Compacted {
                requested: after_revision,
                oldest: history.evicted_through + 1,
            });
        }
        let backlog = history
            .events
            .iter()
            .filter(|event| event.revision() > after_revision && event.key().starts_with(prefix))
            .cloned()
            .collect();

        Ok(KvWatch {
            prefix: prefix.to_string(),
            backlog,
            receiver,
            last_revision: after_revision,
        })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A prefix watch: replayed backlog first, then live events.
#[derive(Debug)]
pub struct KvWatch {
    prefix: String,
    backlog: VecDeque<KvEvent>,
    receiver: broadcast::Receiver<KvEvent>,
    last_revision: i64,
}

impl KvWatch {
    /// The next event under the watched prefix.
    ///
    /// Returns `None` once the store is gone, and
    /// `Some(Err(StorageError::WatchLagged))` if this watcher fell behind the
    /// live buffer; the watch is unusable after that error.
    pub async fn next(&mut self) -> Option<StorageResult<KvEvent>> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_revision = event.revision();
            return Some(Ok(event));
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    // Events already replayed from history arrive again live.
                    if event.revision() <= self.last_revision || !event.key().starts_with(&self.prefix)
                    {
                        continue;
                    }
                    self.last_revision = event.revision();
                    return Some(Ok(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(Err(StorageError::WatchLagged { skipped }));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Revision of the last event handed out (or the starting revision).
    pub fn last_revision(&self) -> i64 {
        self.last_revision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyValue;

    fn put(key: &str, revision: i64) -> KvEvent {
        KvEvent::Put {
            kv: KeyValue {
                key: key.to_string(),
                value: vec![],
                create_revision: revision,
                mod_revision: revision,
            },
            prev: None,
        }
    }

    #[tokio::test]
    async fn test_backlog_replay_filters_prefix_and_revision() {
        let hub = WatchHub::new(16, 16);
        hub.publish(put("/a/1", 1));
        hub.publish(put("/b/1", 2));
        hub.publish(put("/a/2", 3));

        let mut watch = hub.subscribe("/a/", 1).unwrap();
        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.key(), "/a/2");
        assert_eq!(event.revision(), 3);
    }

    #[tokio::test]
    async fn test_live_events_after_backlog() {
        let hub = WatchHub::new(16, 16);
        hub.publish(put("/a/1", 1));
        let mut watch = hub.subscribe("/a/", 0).unwrap();
        hub.publish(put("/a/2", 2));

        assert_eq!(watch.next().await.unwrap().unwrap().revision(), 1);
        assert_eq!(watch.next().await.unwrap().unwrap().revision(), 2);
    }

    #[test]
    fn test_compacted_history() {
        let hub = WatchHub::new(2, 16);
        for rev in 1..=5 {
            hub.publish(put("/a/x", rev));
        }
        let err = hub.subscribe("/a/", 1).unwrap_err();
        assert_eq!(
            err,
            StorageError::Compacted {
                requested: 1,
                oldest: 4
            }
        );
        assert!(hub.subscribe("/a/", 3).is_ok());
    }

    #[test]
    fn test_floor_rejects_unretained_revisions() {
        let hub = WatchHub::with_floor(16, 16, 7);
        assert_eq!(
            hub.subscribe("/a/", 0).unwrap_err(),
            StorageError::Compacted {
                requested: 0,
                oldest: 8
            }
        );
        assert!(hub.subscribe("/a/", 7).is_ok());
    }

    #[tokio::test]
    async fn test_publish_survives_poisoned_history() {
        let hub = std::sync::Arc::new(WatchHub::new(16, 16));
        let poisoner = std::sync::Arc::clone(&hub);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.history.lock().unwrap();
            panic!("poison the history lock");
        })
        .join();
        assert!(hub.history.is_poisoned());

        hub.publish(put("/a/1", 1));
        let mut watch = hub.subscribe("/a/", 0).unwrap();
        assert_eq!(watch.next().await.unwrap().unwrap().revision(), 1);
        assert!(!hub.history.is_poisoned());
    }

    #[tokio::test]
    async fn test_lagged_watch_reports_error() {
        let hub = WatchHub::new(0, 2);
        let mut watch = hub.subscribe("/a/", 0).unwrap();
        for rev in 1..=5 {
            hub.publish(put("/a/x", rev));
        }
        let result = watch.next().await.unwrap();
        assert!(matches!(result, Err(StorageError::WatchLagged { .. })));
    }
}
