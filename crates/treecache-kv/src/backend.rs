//! Backing store trait and watch plumbing

use crate::error::KvResult;
use crate::subject::subject_matches;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// A stored entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub subject: String,
    pub value: Bytes,
    pub revision: u64,
}

/// Kind of change carried by a watch event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KvOp {
    Put,
    /// Physical removal; the event value is always empty
    Purge,
}

/// A change observed through a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEvent {
    pub subject: String,
    pub value: Bytes,
    pub revision: u64,
    pub op: KvOp,
}

/// Updates-only stream of changes matching a pattern.
///
/// Dropping the watcher (or calling `stop`) unregisters it.
pub struct KvWatcher {
    pattern: String,
    rx: mpsc::UnboundedReceiver<KvEvent>,
}

impl KvWatcher {
    /// Wait for the next change. `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }

    /// Pattern this watcher was registered with
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop receiving events; buffered events can still be drained
    pub fn stop(&mut self) {
        self.rx.close();
    }
}

/// Fan-out of change events to registered watchers.
///
/// Implementations publish while holding their write lock so that every
/// watcher observes changes in revision order.
#[derive(Default)]
pub struct WatchHub {
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<KvEvent>)>>,
}

impl WatchHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new watcher for `pattern`
    pub fn subscribe(&self, pattern: &str) -> KvWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().push((pattern.to_string(), tx));
        KvWatcher {
            pattern: pattern.to_string(),
            rx,
        }
    }

    /// Deliver an event to every matching watcher, dropping closed ones
    pub fn publish(&self, event: &KvEvent) {
        self.watchers.lock().retain(|(pattern, tx)| {
            if tx.is_closed() {
                return false;
            }
            if subject_matches(pattern, &event.subject) {
                return tx.send(event.clone()).is_ok();
            }
            true
        });
    }

    /// Number of live watchers
    pub fn len(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|(_, tx)| !tx.is_closed());
        watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External key-value service the cache mirrors.
///
/// Subjects are literal dotted paths; patterns accept `*` and `>` with
/// JetStream semantics (see [`crate::subject`]).
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Point read. `None` when no record exists.
    async fn get(&self, subject: &str) -> KvResult<Option<KvEntry>>;

    /// Store a value, returning its new revision
    async fn put(&self, subject: &str, value: Bytes) -> KvResult<u64>;

    /// Physically remove a record. With `expected_revision`, removal only
    /// happens while the latest revision still equals it. Returns whether a
    /// record was removed.
    async fn purge(&self, subject: &str, expected_revision: Option<u64>) -> KvResult<bool>;

    /// All current entries matching a pattern
    async fn entries(&self, pattern: &str) -> KvResult<Vec<KvEntry>>;

    /// Subscribe to future changes matching a pattern
    async fn watch(&self, pattern: &str) -> KvResult<KvWatcher>;
}
