//! Store API
//!
//! The store owns the node tree and the background tasks that keep it in
//! step with the backing store. Writes land in memory and return; the lazy
//! writer persists them later. Reads are served from memory, falling back
//! to a point read when memory holds nothing authoritative for the key.

use crate::barrier::{BarrierState, WriteBarrier};
use crate::metrics::CacheMetrics;
use crate::node::{CreateOutcome, LevelEvent, Node, Slot, WriteOutcome};
use crate::txn::{TransactionTable, TxnOp};
use crate::{ingest, writer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treecache_common::{
    CacheConfig, Error, Key, KeyError, LogicalTime, Pattern, PatternTail, Result, WireRecord,
    resolve_op_time,
};
use treecache_kv::KvBackend;

/// Hierarchical cache in front of a backing key-value store
pub struct Store {
    pub(crate) config: CacheConfig,
    pub(crate) backend: Arc<dyn KvBackend>,
    pub(crate) root: Arc<Node>,
    /// Clean values updated at or before this time are evicted next pass
    pub(crate) lru_threshold: AtomicI64,
    pub(crate) metrics: Arc<CacheMetrics>,
    pub(crate) barrier: WriteBarrier,
    transactions: TransactionTable,
    /// Serializes application of completed transactions
    apply_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Store {
    /// Create a store over `backend`. Background tasks start with [`Store::start`].
    pub fn new(config: CacheConfig, backend: Arc<dyn KvBackend>) -> Result<Arc<Self>> {
        config.validate()?;
        let metrics = Arc::new(CacheMetrics::new());
        let (shutdown, _) = watch::channel(false);

        info!(
            "Created cache {} (prefix {}, lru size {})",
            config.id, config.kv_store_prefix, config.lru_size
        );

        Ok(Arc::new(Self {
            root: Node::new_root(Arc::clone(&metrics)),
            barrier: WriteBarrier::new(config.barrier_key.clone(), config.barrier_refresh_interval()),
            lru_threshold: AtomicI64::new(LogicalTime::MIN),
            transactions: TransactionTable::new(),
            apply_lock: Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            config,
            backend,
            metrics,
            shutdown,
        }))
    }

    /// Load the backing store and start the ingestion and lazy writer tasks.
    ///
    /// The watch is opened before the initial load so no change slips
    /// between the two; overlapping records merge by logical time.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.tasks.lock().is_empty() {
            warn!("Cache {} already started", self.config.id);
            return Ok(());
        }

        let watcher = self
            .backend
            .watch(&format!("{}.>", self.config.kv_store_prefix))
            .await?;
        self.preload().await?;

        let ingest = tokio::spawn(ingest::ingest_loop(
            Arc::downgrade(self),
            watcher,
            self.shutdown.subscribe(),
        ));
        let writer = tokio::spawn(writer::writer_loop(
            Arc::downgrade(self),
            self.config.sync_interval(),
            self.shutdown.subscribe(),
        ));
        self.tasks.lock().extend([ingest, writer]);

        info!(
            "Cache {} started (sync interval {:?})",
            self.config.id,
            self.config.sync_interval()
        );
        Ok(())
    }

    /// Load every live record under the prefix, then evict down to the
    /// LRU bound
    async fn preload(&self) -> Result<()> {
        let entries = self
            .backend
            .entries(&format!("{}.>", self.config.kv_store_prefix))
            .await?;

        let mut loaded = 0usize;
        for entry in entries {
            let Some(key) = self
                .key_from_subject(&entry.subject)
                .and_then(|k| Key::new(k).ok())
            else {
                debug!("Skipping foreign subject {}", entry.subject);
                continue;
            };
            match WireRecord::decode(&entry.value) {
                Ok(Some(record)) if record.present => {
                    let tokens: Vec<&str> = key.tokens().collect();
                    if self.load_into_tree(&tokens, &record).1 == WriteOutcome::Applied {
                        loaded += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping corrupt record at {}: {}", entry.subject, e),
            }
        }
        info!("Cache {} loaded {} values", self.config.id, loaded);

        if loaded > self.config.lru_size {
            // first pass ranks the values, second releases the oldest
            self.run_sync_cycle().await;
            self.run_sync_cycle().await;
        }
        Ok(())
    }

    /// Stop the background tasks and wait for them to exit. Caller
    /// operations already in flight are left to finish.
    pub async fn destroy(&self) {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Cache {} task ended abnormally: {}", self.config.id, e);
            }
        }
        info!("Cache {} stopped", self.config.id);
    }

    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Number of values currently held in memory
    #[must_use]
    pub fn resident_values(&self) -> usize {
        usize::try_from(self.metrics.resident_values.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Current eviction threshold (`i64::MIN` when nothing is evictable)
    #[must_use]
    pub fn lru_threshold(&self) -> LogicalTime {
        self.lru_threshold.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    // ---- addressing ----

    pub(crate) fn subject(&self, key: &str) -> String {
        format!("{}.{}", self.config.kv_store_prefix, key)
    }

    /// Backing-store pattern for a parent path plus a trailing token
    pub(crate) fn subject_pattern<S: AsRef<str>>(&self, parent: &[S], tail: &str) -> String {
        let mut out = self.config.kv_store_prefix.clone();
        for token in parent {
            out.push('.');
            out.push_str(token.as_ref());
        }
        out.push('.');
        out.push_str(tail);
        out
    }

    pub(crate) fn key_from_subject<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.config.kv_store_prefix.as_str())?
            .strip_prefix('.')
    }

    // ---- tree walks ----

    pub(crate) fn find_node<S: AsRef<str>>(&self, tokens: &[S]) -> Option<Arc<Node>> {
        let mut node = Arc::clone(&self.root);
        for token in tokens {
            node = node.child(token.as_ref())?;
        }
        Some(node)
    }

    /// Deepest existing node along `tokens`
    pub(crate) fn nearest_node<S: AsRef<str>>(&self, tokens: &[S]) -> Arc<Node> {
        let mut node = Arc::clone(&self.root);
        for token in tokens {
            match node.child(token.as_ref()) {
                Some(child) => node = child,
                None => break,
            }
        }
        node
    }

    /// Node at `tokens`, creating path nodes as needed. Restarts from the
    /// root if a node on the way is detached concurrently.
    pub(crate) fn ensure_node<S: AsRef<str>>(&self, tokens: &[S]) -> Arc<Node> {
        'walk: loop {
            let mut node = Arc::clone(&self.root);
            for token in tokens {
                match node.get_or_create_child(token.as_ref()) {
                    Some(child) => node = child,
                    None => continue 'walk,
                }
            }
            return node;
        }
    }

    // ---- reads ----

    /// Value stored at `key`
    pub async fn get_value(&self, key: &str) -> Result<Bytes> {
        self.get_value_with_record_time(key)
            .await
            .map(|(value, _)| value)
    }

    /// Value stored at `key`, parsed as JSON. A payload that is not JSON
    /// reads as an empty object.
    pub async fn get_value_as_json(&self, key: &str) -> Result<serde_json::Value> {
        let raw = self.get_value(key).await?;
        Ok(serde_json::from_slice(&raw)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new())))
    }

    /// Value stored at `key` and the logical time it was written with
    pub async fn get_value_with_record_time(&self, key: &str) -> Result<(Bytes, LogicalTime)> {
        let key = Key::new(key)?;
        CacheMetrics::incr(&self.metrics.gets);
        let tokens: Vec<&str> = key.tokens().collect();

        if let Some(node) = self.find_node(&tokens) {
            match node.slot() {
                Slot::Value { value, time } => return Ok((value, time)),
                Slot::Tombstone { .. } => return Err(Error::not_found(key.as_str())),
                Slot::Unknown => {}
            }
        }
        self.probe(&key, &tokens).await
    }

    /// Point read for a key memory knows nothing authoritative about
    async fn probe(&self, key: &Key, tokens: &[&str]) -> Result<(Bytes, LogicalTime)> {
        CacheMetrics::incr(&self.metrics.backend_probes);
        let record = self.read_backing_record(key).await?;

        // a parked write is decided by what the backing store holds
        if let Some(node) = self.find_node(tokens)
            && matches!(
                node.settle(record.as_ref()),
                WriteOutcome::Applied | WriteOutcome::Stale
            )
        {
            return match node.slot() {
                Slot::Value { value, time } => Ok((value, time)),
                Slot::Tombstone { .. } | Slot::Unknown => Err(Error::not_found(key.as_str())),
            };
        }

        let Some(record) = record else {
            debug!("Probe for {} found nothing", key);
            return Err(Error::not_found(key.as_str()));
        };

        let (node, outcome) = self.load_into_tree(tokens, &record);
        if outcome == WriteOutcome::Stale {
            // memory released a newer state than the backing store has
            return Err(Error::not_found(key.as_str()));
        }
        match node.slot() {
            Slot::Value { value, time } => Ok((value, time)),
            Slot::Tombstone { .. } => Err(Error::not_found(key.as_str())),
            Slot::Unknown if record.present => Ok((record.payload, record.time)),
            Slot::Unknown => Err(Error::not_found(key.as_str())),
        }
    }

    pub(crate) async fn read_backing_record(&self, key: &Key) -> Result<Option<WireRecord>> {
        let Some(entry) = self.backend.get(&self.subject(key.as_str())).await? else {
            return Ok(None);
        };
        WireRecord::decode(&entry.value)
    }

    pub(crate) fn load_into_tree(
        &self,
        tokens: &[&str],
        record: &WireRecord,
    ) -> (Arc<Node>, WriteOutcome) {
        loop {
            let node = self.ensure_node(tokens);
            let outcome = node.load_record(record);
            if outcome != WriteOutcome::Detached {
                return (node, outcome);
            }
        }
    }

    // ---- writes ----

    async fn check_barrier(&self, time: LogicalTime) -> Result<()> {
        let checked = self
            .barrier
            .check_before_write(self.backend.as_ref(), time)
            .await;
        if let Err(e) = &checked {
            CacheMetrics::incr(&self.metrics.barrier_rejections);
            debug!("Write rejected: {}", e);
        }
        checked
    }

    /// Store `value` at `key` with logical time `op_time` (negative = now).
    ///
    /// With `txn_id` the write is queued until the transaction closes.
    /// Returns `false` when a newer write for the key is already recorded.
    pub async fn set_value(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        sync: bool,
        op_time: LogicalTime,
        txn_id: Option<&str>,
    ) -> Result<bool> {
        let key = Key::new(key)?;
        let time = resolve_op_time(op_time);
        self.check_barrier(time).await?;
        let value = value.into();

        if let Some(id) = txn_id.filter(|id| !id.is_empty()) {
            self.transactions.enqueue(
                id,
                TxnOp::Set {
                    key,
                    value,
                    sync,
                    time,
                },
            )?;
            return Ok(true);
        }
        Ok(self.apply_put(&key, value, sync, time))
    }

    /// [`Store::set_value`] persisted to the backing store, outside any transaction
    pub async fn set_value_kv_sync(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        op_time: LogicalTime,
    ) -> Result<bool> {
        self.set_value(key, value, true, op_time, None).await
    }

    /// Delete the value at `key`. Without `sync` only memory forgets it,
    /// for keys the backing store already reports as gone.
    pub async fn delete_value(
        &self,
        key: &str,
        sync: bool,
        op_time: LogicalTime,
        txn_id: Option<&str>,
    ) -> Result<bool> {
        let key = Key::new(key)?;
        let time = resolve_op_time(op_time);
        self.check_barrier(time).await?;

        if let Some(id) = txn_id.filter(|id| !id.is_empty()) {
            self.transactions
                .enqueue(id, TxnOp::Delete { key, sync, time })?;
            return Ok(true);
        }
        Ok(self.apply_delete(&key, sync, time))
    }

    pub async fn delete_value_kv_sync(&self, key: &str, op_time: LogicalTime) -> Result<bool> {
        self.delete_value(key, true, op_time, None).await
    }

    /// Store `value` only if `key` holds no value. Exactly one of several
    /// concurrent callers wins.
    pub async fn set_value_if_does_not_exist(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        sync: bool,
        op_time: LogicalTime,
    ) -> Result<bool> {
        let key = Key::new(key)?;
        let time = resolve_op_time(op_time);
        self.check_barrier(time).await?;
        let value = value.into();
        let (parent_tokens, last) = key.parent_and_last();

        let mut probed = false;
        loop {
            let parent = self.ensure_node(&parent_tokens);
            match parent.put_child_if_absent(last, value.clone(), sync, time, probed) {
                CreateOutcome::Created => {
                    CacheMetrics::incr(&self.metrics.sets);
                    debug!("Created {} at {}", key, time);
                    return Ok(true);
                }
                CreateOutcome::Exists => return Ok(false),
                CreateOutcome::Detached => {}
                CreateOutcome::NeedsProbe => {
                    CacheMetrics::incr(&self.metrics.backend_probes);
                    let tokens: Vec<&str> = key.tokens().collect();
                    match self.read_backing_record(&key).await? {
                        Some(record) => {
                            self.load_into_tree(&tokens, &record);
                        }
                        None => {
                            if let Some(node) = self.find_node(&tokens) {
                                node.settle(None);
                            }
                        }
                    }
                    probed = true;
                }
            }
        }
    }

    pub(crate) fn apply_put(&self, key: &Key, value: Bytes, sync: bool, time: LogicalTime) -> bool {
        let tokens: Vec<&str> = key.tokens().collect();
        loop {
            let node = self.ensure_node(&tokens);
            match node.put(value.clone(), sync, time) {
                WriteOutcome::Applied => {
                    CacheMetrics::incr(&self.metrics.sets);
                    debug!("Set {} at {} (sync {})", key, time, sync);
                    return true;
                }
                WriteOutcome::Stale => {
                    CacheMetrics::incr(&self.metrics.stale_writes);
                    debug!("Dropped stale set of {} at {}", key, time);
                    return false;
                }
                WriteOutcome::Unchanged => return false,
                WriteOutcome::Detached => {}
            }
        }
    }

    pub(crate) fn apply_delete(&self, key: &Key, sync: bool, time: LogicalTime) -> bool {
        let tokens: Vec<&str> = key.tokens().collect();
        loop {
            // a local-only delete never needs a node that is not there
            let node = if sync {
                self.ensure_node(&tokens)
            } else {
                match self.find_node(&tokens) {
                    Some(node) => node,
                    None => return false,
                }
            };
            match node.delete(sync, time) {
                WriteOutcome::Applied => {
                    CacheMetrics::incr(&self.metrics.deletes);
                    debug!("Deleted {} at {} (sync {})", key, time, sync);
                    return true;
                }
                WriteOutcome::Stale => {
                    CacheMetrics::incr(&self.metrics.stale_writes);
                    debug!("Dropped stale delete of {} at {}", key, time);
                    return false;
                }
                WriteOutcome::Unchanged => return false,
                WriteOutcome::Detached => {}
            }
        }
    }

    // ---- level subscriptions ----

    /// Watch the direct children of a `parent.*` pattern. Updates arrive on
    /// a bounded channel; when it is full, updates are dropped.
    pub fn subscribe_level_callback(
        &self,
        pattern: &str,
        subscriber_id: &str,
    ) -> Result<mpsc::Receiver<LevelEvent>> {
        let parsed = Self::parse_level_pattern(pattern)?;
        let (tx, rx) = mpsc::channel(self.config.level_subscription_buffer);
        loop {
            let node = self.ensure_node(parsed.parent());
            node.subscribe(subscriber_id, tx.clone());
            if !node.is_detached() {
                break;
            }
            node.unsubscribe(subscriber_id);
        }
        debug!("Subscriber {} watching {}", subscriber_id, pattern);
        Ok(rx)
    }

    /// Returns whether the subscriber was registered
    pub fn unsubscribe_level_callback(&self, pattern: &str, subscriber_id: &str) -> Result<bool> {
        let parsed = Self::parse_level_pattern(pattern)?;
        Ok(self
            .find_node(parsed.parent())
            .is_some_and(|node| node.unsubscribe(subscriber_id)))
    }

    fn parse_level_pattern(pattern: &str) -> Result<Pattern> {
        let invalid = |reason| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };
        let parsed = Pattern::parse(pattern).map_err(invalid)?;
        if *parsed.tail() != PatternTail::Single {
            return Err(invalid(KeyError::LevelWildcardRequired));
        }
        Ok(parsed)
    }

    // ---- transactions ----

    /// Open transaction `id`, or nest one level deeper. Returns the depth.
    pub fn transaction_begin(&self, id: &str) -> u32 {
        let depth = self.transactions.begin(id);
        debug!("Transaction {} depth {}", id, depth);
        depth
    }

    /// Close one level of transaction `id`. Closing the outermost level
    /// applies the queued writes in submission order.
    pub fn transaction_end(&self, id: &str) -> Result<()> {
        let Some(ops) = self.transactions.end(id)? else {
            return Ok(());
        };

        let _guard = self.apply_lock.lock();
        let count = ops.len();
        for op in ops {
            match op {
                TxnOp::Set {
                    key,
                    value,
                    sync,
                    time,
                } => {
                    self.apply_put(&key, value, sync, time);
                }
                TxnOp::Delete { key, sync, time } => {
                    self.apply_delete(&key, sync, time);
                }
            }
        }
        debug!("Transaction {} applied {} writes", id, count);
        Ok(())
    }

    // ---- write barrier ----

    /// Publish a write barrier: writes after `timestamp` are rejected
    /// until it is unlocked.
    pub async fn lock_write_barrier(&self, timestamp: LogicalTime) -> Result<()> {
        self.barrier
            .lock(self.backend.as_ref(), timestamp, &self.config.id)
            .await
    }

    pub async fn unlock_write_barrier(&self) -> Result<()> {
        self.barrier.unlock(self.backend.as_ref()).await
    }

    pub async fn write_barrier_state(&self) -> BarrierState {
        self.barrier.current(self.backend.as_ref()).await
    }
}
