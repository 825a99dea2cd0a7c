//! Typed watch events and the stream handed to watch callers.

use tessera_core::{Resource, TesseraError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A change to one object, as seen by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    /// Last known state of the deleted object, with the deletion revision.
    Deleted(T),
    /// Terminal error; no further events follow.
    Error(TesseraError),
}

impl<T: Resource> WatchEvent<T> {
    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => Some(obj),
            WatchEvent::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WatchEvent::Error(_))
    }
}

/// Receiving end of a watch.
///
/// Dropping the stream (or calling [`stop`](Self::stop)) ends the background
/// task and releases its store subscription.
#[derive(Debug)]
pub struct WatchStream<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
    task: JoinHandle<()>,
}

impl<T> WatchStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<WatchEvent<T>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next event, or `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }

    /// Stop the watch without waiting for the producer to notice.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the producing task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Drop for WatchStream<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
