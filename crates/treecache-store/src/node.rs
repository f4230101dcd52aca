//! Node tree
//!
//! Each node is one token of a dotted key. A parent owns its children
//! through `Arc`s in a keyed map; children point back with a `Weak`.
//!
//! Lock order, always top-down:
//! - a node's children lock before any child's children or state lock
//! - a node's children lock before its own state lock
//! - never two state locks at once
//!
//! Subscribers are notified after the state lock is released.
//!
//! `PurgeState::Purged` means memory holds nothing authoritative about the
//! slot's own value. Implicitly created path nodes start out `Purged`, as
//! do evicted values, so readers must consult the backing store for them.
//!
//! A detached node takes its update time with it. Each node therefore keeps
//! the highest update time released below it, and a write to a fresh slot
//! at or before that time is parked: stored but invisible until the backing
//! record settles whether it is the newest.

use crate::metrics::CacheMetrics;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use treecache_common::{LogicalTime, WireRecord};

/// Update time of a slot that never held anything
pub(crate) const NEVER_WRITTEN: LogicalTime = LogicalTime::MIN;

/// Eviction lifecycle of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PurgeState {
    Active = 0,
    PendingPurge = 1,
    Purged = 2,
}

impl PurgeState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::PendingPurge,
            _ => Self::Purged,
        }
    }
}

/// Change notification delivered to level subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelEvent {
    /// Token of the child that changed
    pub token: String,
    /// New value, `None` when the child was deleted
    pub value: Option<Bytes>,
}

#[derive(Debug)]
struct NodeState {
    value: Option<Bytes>,
    exists: bool,
    update_time: LogicalTime,
    sync_needed: bool,
    synced_with_kv: bool,
    /// Written while the backing record was unknown; checked before flushing
    blind: bool,
    /// Parked write that may predate a released record
    unverified: bool,
    detached: bool,
}

/// What memory knows about a slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Slot {
    Value { value: Bytes, time: LogicalTime },
    Tombstone { time: LogicalTime },
    Unknown,
}

/// Copy of the fields the lazy writer acts on
#[derive(Clone, Debug)]
pub(crate) struct SyncSnapshot {
    pub value: Option<Bytes>,
    pub exists: bool,
    pub update_time: LogicalTime,
    pub sync_needed: bool,
    pub blind: bool,
    pub unverified: bool,
    pub purge_state: PurgeState,
}

impl SyncSnapshot {
    /// Record to persist for this snapshot
    pub fn record(&self) -> WireRecord {
        match (&self.value, self.exists) {
            (Some(value), true) => WireRecord::present(self.update_time, value.clone()),
            _ => WireRecord::tombstone(self.update_time),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Applied,
    /// A newer logical time is already recorded
    Stale,
    /// Nothing to do
    Unchanged,
    /// The node was removed from the tree; walk again from the root
    Detached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CreateOutcome {
    Created,
    Exists,
    /// Memory cannot tell whether the slot holds a value
    NeedsProbe,
    Detached,
}

pub(crate) struct Node {
    token: String,
    parent: Weak<Node>,
    state: Mutex<NodeState>,
    purge_state: AtomicU8,
    consistency_loss_time: AtomicI64,
    /// Highest update time of any node detached below this one
    released_time: AtomicI64,
    children: RwLock<HashMap<String, Arc<Node>>>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<LevelEvent>>>,
    metrics: Arc<CacheMetrics>,
}

impl Node {
    pub(crate) fn new_root(metrics: Arc<CacheMetrics>) -> Arc<Self> {
        Arc::new(Self::blank(String::new(), Weak::new(), metrics))
    }

    fn new_child(token: &str, parent: &Arc<Self>) -> Self {
        parent.metrics.tree_nodes.fetch_add(1, Ordering::Relaxed);
        Self::blank(
            token.to_string(),
            Arc::downgrade(parent),
            Arc::clone(&parent.metrics),
        )
    }

    fn blank(token: String, parent: Weak<Self>, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            token,
            parent,
            state: Mutex::new(NodeState {
                value: None,
                exists: false,
                update_time: NEVER_WRITTEN,
                sync_needed: false,
                synced_with_kv: true,
                blind: false,
                unverified: false,
                detached: false,
            }),
            purge_state: AtomicU8::new(PurgeState::Purged as u8),
            consistency_loss_time: AtomicI64::new(0),
            released_time: AtomicI64::new(NEVER_WRITTEN),
            children: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    pub(crate) fn purge_state(&self) -> PurgeState {
        PurgeState::from_u8(self.purge_state.load(Ordering::Acquire))
    }

    fn set_purge_state(&self, state: PurgeState) {
        self.purge_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn consistency_loss_time(&self) -> LogicalTime {
        self.consistency_loss_time.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub(crate) fn update_time(&self) -> LogicalTime {
        self.state.lock().update_time
    }

    /// Highest update time released anywhere above this slot
    fn released_above(&self) -> LogicalTime {
        let mut released = NEVER_WRITTEN;
        let mut next = self.parent.upgrade();
        while let Some(node) = next {
            released = released.max(node.released_time.load(Ordering::Acquire));
            next = node.parent.upgrade();
        }
        released
    }

    /// Whether a write at `time` cannot be ordered from memory alone
    fn must_park(&self, st: &NodeState, time: LogicalTime) -> bool {
        if self.purge_state() != PurgeState::Purged {
            return false;
        }
        st.unverified || (st.update_time == NEVER_WRITTEN && time <= self.released_above())
    }

    // ---- children ----

    pub(crate) fn child(&self, token: &str) -> Option<Arc<Self>> {
        self.children.read().get(token).cloned()
    }

    pub(crate) fn children(&self) -> Vec<(String, Arc<Self>)> {
        self.children
            .read()
            .iter()
            .map(|(token, child)| (token.clone(), Arc::clone(child)))
            .collect()
    }

    pub(crate) fn has_children(&self) -> bool {
        !self.children.read().is_empty()
    }

    /// Child for `token`, created as an empty path node if missing.
    /// `None` when this node has been detached from the tree.
    pub(crate) fn get_or_create_child(self: &Arc<Self>, token: &str) -> Option<Arc<Self>> {
        if let Some(child) = self.child(token) {
            return Some(child);
        }
        let mut children = self.children.write();
        if self.state.lock().detached {
            return None;
        }
        let child = children
            .entry(token.to_string())
            .or_insert_with(|| Arc::new(Self::new_child(token, self)));
        Some(Arc::clone(child))
    }

    // ---- reads ----

    pub(crate) fn slot(&self) -> Slot {
        let st = self.state.lock();
        match self.purge_state() {
            PurgeState::Purged => Slot::Unknown,
            _ => match (&st.value, st.exists) {
                (Some(value), true) => Slot::Value {
                    value: value.clone(),
                    time: st.update_time,
                },
                _ => Slot::Tombstone {
                    time: st.update_time,
                },
            },
        }
    }

    pub(crate) fn sync_snapshot(&self) -> SyncSnapshot {
        let st = self.state.lock();
        SyncSnapshot {
            value: st.value.clone(),
            exists: st.exists,
            update_time: st.update_time,
            sync_needed: st.sync_needed,
            blind: st.blind,
            unverified: st.unverified,
            purge_state: self.purge_state(),
        }
    }

    // ---- writes ----

    fn store_value(&self, st: &mut NodeState, value: Bytes, sync: bool, time: LogicalTime) {
        if st.value.is_none() {
            self.metrics.resident_values.fetch_add(1, Ordering::Relaxed);
        }
        st.value = Some(value);
        st.exists = true;
        st.update_time = time;
        st.sync_needed = sync;
        st.synced_with_kv = !sync;
        self.set_purge_state(PurgeState::Active);
    }

    fn drop_value(&self, st: &mut NodeState) {
        if st.value.take().is_some() {
            self.metrics.resident_values.fetch_sub(1, Ordering::Relaxed);
        }
        st.exists = false;
    }

    /// Store a value. Older logical times lose; equal times win.
    pub(crate) fn put(&self, value: Bytes, sync: bool, time: LogicalTime) -> WriteOutcome {
        {
            let mut st = self.state.lock();
            if st.detached {
                return WriteOutcome::Detached;
            }
            if time < st.update_time {
                return WriteOutcome::Stale;
            }
            let parked = self.must_park(&st, time);
            let blind = sync && (st.blind || self.purge_state() == PurgeState::Purged);
            self.store_value(&mut st, value.clone(), sync, time);
            st.blind = blind;
            if parked {
                st.unverified = true;
                self.set_purge_state(PurgeState::Purged);
                debug!("Parked write to {} at {}", self.token, time);
                return WriteOutcome::Applied;
            }
        }
        self.notify_parent(Some(value));
        WriteOutcome::Applied
    }

    /// Delete the value. With `sync` the tombstone waits for the backing
    /// store; without it the slot is released at once.
    pub(crate) fn delete(&self, sync: bool, time: LogicalTime) -> WriteOutcome {
        let was_live = {
            let mut st = self.state.lock();
            if st.detached {
                return WriteOutcome::Detached;
            }
            if time < st.update_time {
                return WriteOutcome::Stale;
            }
            let state = self.purge_state();
            if !st.exists && !sync && state == PurgeState::Purged {
                return WriteOutcome::Unchanged;
            }
            if sync && self.must_park(&st, time) {
                self.drop_value(&mut st);
                st.update_time = time;
                st.sync_needed = true;
                st.synced_with_kv = false;
                st.blind = true;
                st.unverified = true;
                debug!("Parked delete of {} at {}", self.token, time);
                return WriteOutcome::Applied;
            }

            let was_live = st.exists;
            st.blind = sync && (st.blind || state == PurgeState::Purged);
            self.drop_value(&mut st);
            st.update_time = time;
            if sync {
                st.sync_needed = true;
                st.synced_with_kv = false;
                self.set_purge_state(PurgeState::PendingPurge);
            } else {
                st.sync_needed = false;
                st.synced_with_kv = true;
                self.set_purge_state(PurgeState::Purged);
            }
            was_live
        };
        if was_live {
            self.notify_parent(None);
        }
        WriteOutcome::Applied
    }

    /// Create child `token` with a value unless it already holds one.
    ///
    /// The decision is made under this node's children lock, so concurrent
    /// callers racing on the same child see exactly one `Created`. With
    /// `probed` the caller has just loaded the backing record, so an
    /// unknown slot counts as empty.
    pub(crate) fn put_child_if_absent(
        self: &Arc<Self>,
        token: &str,
        value: Bytes,
        sync: bool,
        time: LogicalTime,
        probed: bool,
    ) -> CreateOutcome {
        {
            let mut children = self.children.write();
            if self.state.lock().detached {
                return CreateOutcome::Detached;
            }
            let child = children
                .entry(token.to_string())
                .or_insert_with(|| Arc::new(Self::new_child(token, self)));

            let mut st = child.state.lock();
            let state = child.purge_state();
            if st.exists && state != PurgeState::Purged {
                return CreateOutcome::Exists;
            }
            if state == PurgeState::Purged && (!probed || st.unverified) {
                return CreateOutcome::NeedsProbe;
            }
            if time < st.update_time {
                return CreateOutcome::Exists;
            }
            let blind = sync && state == PurgeState::Purged;
            child.store_value(&mut st, value.clone(), sync, time);
            st.blind = blind;
        }
        self.notify(LevelEvent {
            token: token.to_string(),
            value: Some(value),
        });
        CreateOutcome::Created
    }

    /// Merge a record read from the backing store. Applies when memory has
    /// nothing authoritative or the record is newer.
    pub(crate) fn load_record(&self, record: &WireRecord) -> WriteOutcome {
        let was_known = {
            let mut st = self.state.lock();
            if st.detached {
                return WriteOutcome::Detached;
            }
            if st.unverified {
                drop(st);
                return match self.settle(Some(record)) {
                    WriteOutcome::Stale => WriteOutcome::Applied,
                    WriteOutcome::Detached => WriteOutcome::Detached,
                    _ => WriteOutcome::Unchanged,
                };
            }
            let state = self.purge_state();
            let was_known = state != PurgeState::Purged;
            if was_known && record.time <= st.update_time {
                // the pending local write supersedes the backing record
                st.blind = false;
                return WriteOutcome::Unchanged;
            }
            if record.time < st.update_time {
                return WriteOutcome::Stale;
            }

            if record.present {
                self.store_value(&mut st, record.payload.clone(), false, record.time);
            } else {
                self.drop_value(&mut st);
                st.update_time = record.time;
                st.sync_needed = false;
                st.synced_with_kv = true;
                self.set_purge_state(PurgeState::PendingPurge);
            }
            st.blind = false;
            was_known
        };
        if was_known {
            let value = record.present.then(|| record.payload.clone());
            self.notify_parent(value);
        }
        WriteOutcome::Applied
    }

    /// Decide a parked write against the backing record. A newer record
    /// replaces it and `Stale` is returned; otherwise the write becomes
    /// visible. `Unchanged` when nothing was parked.
    pub(crate) fn settle(&self, remote: Option<&WireRecord>) -> WriteOutcome {
        let visible = {
            let mut st = self.state.lock();
            if st.detached {
                return WriteOutcome::Detached;
            }
            if !st.unverified {
                return WriteOutcome::Unchanged;
            }
            st.unverified = false;
            st.blind = false;

            let parked_time = st.update_time;
            if let Some(record) = remote.filter(|r| r.time > parked_time) {
                if record.present {
                    self.store_value(&mut st, record.payload.clone(), false, record.time);
                } else {
                    self.drop_value(&mut st);
                    st.update_time = record.time;
                    st.sync_needed = false;
                    st.synced_with_kv = true;
                    self.set_purge_state(PurgeState::PendingPurge);
                }
                self.metrics.stale_writes.fetch_add(1, Ordering::Relaxed);
                return WriteOutcome::Stale;
            }

            if st.exists {
                self.set_purge_state(PurgeState::Active);
                st.value.clone()
            } else {
                // the flush still checks whether there is anything to delete
                st.blind = true;
                self.set_purge_state(PurgeState::PendingPurge);
                None
            }
        };
        if visible.is_some() {
            self.notify_parent(visible);
        }
        WriteOutcome::Applied
    }

    /// Flush acknowledged. Clears the dirty flag only if nothing changed
    /// since `snapshot` was taken.
    pub(crate) fn mark_flushed(&self, snapshot: &SyncSnapshot) -> bool {
        let mut st = self.state.lock();
        if !st.sync_needed
            || st.update_time != snapshot.update_time
            || st.exists != snapshot.exists
            || st.value != snapshot.value
        {
            return false;
        }
        st.sync_needed = false;
        st.synced_with_kv = true;
        st.blind = false;
        true
    }

    /// The backing store echoed a record with this node's logical time
    pub(crate) fn confirm_synced(&self, time: LogicalTime) -> bool {
        let mut st = self.state.lock();
        if st.detached || st.update_time != time {
            return false;
        }
        st.synced_with_kv = true;
        true
    }

    /// First eviction phase: `Active` to `PendingPurge` for clean nodes
    pub(crate) fn try_purge_ready(&self) -> bool {
        let st = self.state.lock();
        if st.detached || st.sync_needed {
            return false;
        }
        match self.purge_state() {
            PurgeState::Active => {
                self.set_purge_state(PurgeState::PendingPurge);
                true
            }
            PurgeState::PendingPurge => true,
            PurgeState::Purged => false,
        }
    }

    /// Second eviction phase: release the slot once the backing store holds
    /// its final state. A dropped live value raises consistency loss on the
    /// ancestors.
    pub(crate) fn try_purge_confirm(&self) -> bool {
        let (evicted_live, time) = {
            let mut st = self.state.lock();
            if st.detached
                || st.sync_needed
                || !st.synced_with_kv
                || self.purge_state() != PurgeState::PendingPurge
            {
                return false;
            }
            let evicted_live = st.exists;
            self.drop_value(&mut st);
            self.set_purge_state(PurgeState::Purged);
            (evicted_live, st.update_time)
        };
        if evicted_live {
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            if let Some(parent) = self.parent.upgrade() {
                parent.consistency_loss(time);
            }
        }
        true
    }

    /// The backing record was physically removed. Only a clean, valueless
    /// node follows; anything else is newer local knowledge.
    pub(crate) fn mirror_purge(&self) -> bool {
        let mut st = self.state.lock();
        if st.detached || st.sync_needed || st.exists {
            return false;
        }
        st.synced_with_kv = true;
        if self.purge_state() == PurgeState::Purged {
            return false;
        }
        self.set_purge_state(PurgeState::Purged);
        true
    }

    // ---- consistency ----

    /// Mark this subtree as possibly missing backing-store entries, up to
    /// the root.
    pub(crate) fn consistency_loss(&self, time: LogicalTime) {
        let time = time.max(1);
        self.consistency_loss_time.fetch_max(time, Ordering::AcqRel);
        let mut next = self.parent.upgrade();
        while let Some(node) = next {
            node.consistency_loss_time.fetch_max(time, Ordering::AcqRel);
            next = node.parent.upgrade();
        }
    }

    /// Clear the loss marker if it still holds `observed`
    pub(crate) fn clear_consistency_loss(&self, observed: LogicalTime) -> bool {
        self.consistency_loss_time
            .compare_exchange(observed, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Detach released, childless, unwatched nodes from the tree, walking
    /// upward while parents become removable too.
    pub(crate) fn collect_garbage(self: &Arc<Self>) {
        let mut current = Arc::clone(self);
        while let Some(parent) = current.parent.upgrade() {
            {
                let mut siblings = parent.children.write();
                let children = current.children.write();
                if !children.is_empty()
                    || current.consistency_loss_time() > 0
                    || !current.subscribers.lock().is_empty()
                {
                    return;
                }
                let mut st = current.state.lock();
                if st.detached
                    || st.sync_needed
                    || st.unverified
                    || current.purge_state() != PurgeState::Purged
                {
                    return;
                }
                st.detached = true;
                let released = st
                    .update_time
                    .max(current.released_time.load(Ordering::Acquire));
                drop(st);
                drop(children);
                parent.released_time.fetch_max(released, Ordering::AcqRel);

                if siblings
                    .get(&current.token)
                    .is_some_and(|n| Arc::ptr_eq(n, &current))
                {
                    siblings.remove(&current.token);
                    self.metrics.tree_nodes.fetch_sub(1, Ordering::Relaxed);
                }
            }
            debug!("Detached node {}", current.token);
            current = parent;
        }
    }

    // ---- subscriptions ----

    pub(crate) fn subscribe(&self, subscriber_id: &str, tx: mpsc::Sender<LevelEvent>) {
        self.subscribers.lock().insert(subscriber_id.to_string(), tx);
    }

    pub(crate) fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.subscribers.lock().remove(subscriber_id).is_some()
    }

    fn notify_parent(&self, value: Option<Bytes>) {
        if let Some(parent) = self.parent.upgrade() {
            parent.notify(LevelEvent {
                token: self.token.clone(),
                value,
            });
        }
    }

    /// Deliver to every subscriber without blocking; full channels drop
    fn notify(&self, event: LevelEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics
                    .dropped_notifications
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Level subscriber {} under {:?} is full, dropping update for {}",
                    id, self.token, event.token
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Level subscriber {} went away", id);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Arc<Node> {
        Node::new_root(Arc::new(CacheMetrics::new()))
    }

    fn path(root: &Arc<Node>, tokens: &[&str]) -> Arc<Node> {
        let mut node = Arc::clone(root);
        for token in tokens {
            node = node.get_or_create_child(token).unwrap();
        }
        node
    }

    fn resident(root: &Arc<Node>) -> i64 {
        root.metrics.resident_values.load(Ordering::Relaxed)
    }

    #[test]
    fn test_put_last_write_wins() {
        let root = tree();
        let node = path(&root, &["a", "b"]);
        assert_eq!(node.put(Bytes::from_static(b"v2"), true, 20), WriteOutcome::Applied);
        assert_eq!(node.put(Bytes::from_static(b"v1"), true, 10), WriteOutcome::Stale);
        assert_eq!(
            node.slot(),
            Slot::Value {
                value: Bytes::from_static(b"v2"),
                time: 20
            }
        );
        // equal time is accepted
        assert_eq!(node.put(Bytes::from_static(b"v3"), true, 20), WriteOutcome::Applied);
        assert_eq!(resident(&root), 1);
    }

    #[test]
    fn test_path_nodes_start_unknown() {
        let root = tree();
        let leaf = path(&root, &["a", "b"]);
        leaf.put(Bytes::from_static(b"x"), true, 1);
        let a = root.child("a").unwrap();
        assert_eq!(a.slot(), Slot::Unknown);
        assert_eq!(root.metrics.tree_nodes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_delete_sync_leaves_tombstone() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), true, 1);
        assert_eq!(node.delete(true, 2), WriteOutcome::Applied);
        assert_eq!(node.slot(), Slot::Tombstone { time: 2 });
        assert_eq!(node.purge_state(), PurgeState::PendingPurge);
        assert_eq!(resident(&root), 0);

        let snap = node.sync_snapshot();
        assert!(snap.sync_needed);
        assert_eq!(snap.record(), WireRecord::tombstone(2));
    }

    #[test]
    fn test_delete_local_releases_slot() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), false, 1);
        assert_eq!(node.delete(false, 2), WriteOutcome::Applied);
        assert_eq!(node.purge_state(), PurgeState::Purged);
        assert_eq!(node.slot(), Slot::Unknown);
        assert_eq!(node.delete(false, 3), WriteOutcome::Unchanged);
        assert_eq!(node.put(Bytes::from_static(b"old"), true, 1), WriteOutcome::Stale);
    }

    #[test]
    fn test_purge_lifecycle_waits_for_sync() {
        let root = tree();
        let parent = path(&root, &["a"]);
        let node = path(&root, &["a", "b"]);
        node.put(Bytes::from_static(b"x"), true, 7);

        // dirty nodes are never released
        assert!(!node.try_purge_ready());

        let snap = node.sync_snapshot();
        assert!(node.mark_flushed(&snap));
        assert!(node.try_purge_ready());
        assert_eq!(node.purge_state(), PurgeState::PendingPurge);
        assert!(node.try_purge_confirm());
        assert_eq!(node.purge_state(), PurgeState::Purged);
        assert_eq!(resident(&root), 0);

        assert_eq!(parent.consistency_loss_time(), 7);
        assert_eq!(root.consistency_loss_time(), 7);
        assert_eq!(node.consistency_loss_time(), 0);
    }

    #[test]
    fn test_mark_flushed_guards_against_racing_write() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), true, 1);
        let snap = node.sync_snapshot();
        node.put(Bytes::from_static(b"y"), true, 2);
        assert!(!node.mark_flushed(&snap));
        assert!(node.sync_snapshot().sync_needed);
    }

    #[test]
    fn test_confirm_needs_backing_ack() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), true, 5);
        node.delete(true, 6);
        // flushed but not yet acknowledged
        {
            let mut st = node.state.lock();
            st.sync_needed = false;
        }
        assert!(!node.try_purge_confirm());
        assert!(!node.confirm_synced(5));
        assert!(node.confirm_synced(6));
        assert!(node.try_purge_confirm());
        assert_eq!(node.slot(), Slot::Unknown);
    }

    #[test]
    fn test_load_record() {
        let root = tree();
        let node = path(&root, &["k"]);
        let record = WireRecord::present(100, Bytes::from_static(b"x"));
        assert_eq!(node.load_record(&record), WriteOutcome::Applied);
        assert_eq!(
            node.slot(),
            Slot::Value {
                value: Bytes::from_static(b"x"),
                time: 100
            }
        );
        assert!(!node.sync_snapshot().sync_needed);

        // an older record never replaces newer knowledge
        assert_eq!(
            node.load_record(&WireRecord::tombstone(50)),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            node.load_record(&WireRecord::tombstone(150)),
            WriteOutcome::Applied
        );
        assert_eq!(node.slot(), Slot::Tombstone { time: 150 });
    }

    #[test]
    fn test_blind_write_flag() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), true, 1);
        assert!(node.sync_snapshot().blind);

        // older backing record: the local write stands and is no longer blind
        node.load_record(&WireRecord::present(0, Bytes::new()));
        assert!(!node.sync_snapshot().blind);
        assert!(node.sync_snapshot().sync_needed);
    }

    #[test]
    fn test_mirror_purge() {
        let root = tree();
        let node = path(&root, &["k"]);
        node.put(Bytes::from_static(b"x"), true, 1);
        assert!(!node.mirror_purge());

        node.load_record(&WireRecord::tombstone(2));
        assert!(node.mirror_purge());
        assert_eq!(node.purge_state(), PurgeState::Purged);
    }

    #[test]
    fn test_collect_garbage_walks_upward() {
        let root = tree();
        let leaf = path(&root, &["a", "b", "c"]);
        leaf.put(Bytes::from_static(b"x"), false, 1);
        leaf.delete(false, 2);

        leaf.collect_garbage();
        assert!(leaf.is_detached());
        assert!(!root.has_children());
        assert_eq!(root.metrics.tree_nodes.load(Ordering::Relaxed), 0);

        // a detached node refuses writes and new children
        assert_eq!(leaf.put(Bytes::new(), true, 3), WriteOutcome::Detached);
        assert!(leaf.get_or_create_child("d").is_none());
    }

    #[test]
    fn test_collect_garbage_keeps_live_and_lossy_nodes() {
        let root = tree();
        let live = path(&root, &["a", "live"]);
        live.put(Bytes::from_static(b"x"), false, 1);
        let gone = path(&root, &["a", "gone"]);
        gone.collect_garbage();
        assert!(gone.is_detached());
        assert!(root.child("a").is_some());

        let lossy = path(&root, &["b"]);
        lossy.consistency_loss(5);
        lossy.collect_garbage();
        assert!(!lossy.is_detached());
        assert!(lossy.clear_consistency_loss(5));
        assert!(!lossy.clear_consistency_loss(5));
    }

    #[test]
    fn test_detached_time_parks_older_writes() {
        let root = tree();
        let leaf = path(&root, &["a", "b"]);
        leaf.put(Bytes::from_static(b"x"), false, 10);
        leaf.delete(false, 12);
        leaf.collect_garbage();
        assert_eq!(root.released_time.load(Ordering::Relaxed), 12);

        // a fresh slot cannot tell whether 11 is older than what was released
        let leaf = path(&root, &["a", "b"]);
        assert_eq!(leaf.put(Bytes::from_static(b"y"), true, 11), WriteOutcome::Applied);
        assert_eq!(leaf.slot(), Slot::Unknown);
        assert!(leaf.sync_snapshot().unverified);
        leaf.collect_garbage();
        assert!(!leaf.is_detached());

        assert_eq!(
            leaf.settle(Some(&WireRecord::tombstone(12))),
            WriteOutcome::Stale
        );
        assert_eq!(leaf.slot(), Slot::Tombstone { time: 12 });
        assert!(!leaf.sync_snapshot().sync_needed);
        assert_eq!(leaf.settle(None), WriteOutcome::Unchanged);

        // later writes are ordered normally
        let other = path(&root, &["a", "c"]);
        assert_eq!(other.put(Bytes::from_static(b"z"), true, 13), WriteOutcome::Applied);
        assert!(!other.sync_snapshot().unverified);
    }

    #[tokio::test]
    async fn test_settled_write_notifies_once_visible() {
        let root = tree();
        let parent = path(&root, &["a"]);
        let gone = path(&root, &["a", "b"]);
        gone.put(Bytes::from_static(b"x"), false, 10);
        gone.delete(false, 10);
        let (tx, mut rx) = mpsc::channel(4);
        parent.subscribe("s1", tx);
        gone.collect_garbage();
        assert!(gone.is_detached());

        let leaf = path(&root, &["a", "b"]);
        leaf.put(Bytes::from_static(b"y"), true, 5);
        assert!(rx.try_recv().is_err());

        assert_eq!(
            leaf.settle(Some(&WireRecord::present(3, Bytes::new()))),
            WriteOutcome::Applied
        );
        assert_eq!(
            leaf.slot(),
            Slot::Value {
                value: Bytes::from_static(b"y"),
                time: 5
            }
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.value, Some(Bytes::from_static(b"y")));
        // checked against the backing record already
        assert!(!leaf.sync_snapshot().blind);
    }

    #[test]
    fn test_put_child_if_absent() {
        let root = tree();
        let parent = path(&root, &["a"]);
        assert_eq!(
            parent.put_child_if_absent("k", Bytes::from_static(b"1"), true, 1, false),
            CreateOutcome::NeedsProbe
        );
        assert_eq!(
            parent.put_child_if_absent("k", Bytes::from_static(b"1"), true, 1, true),
            CreateOutcome::Created
        );
        assert_eq!(
            parent.put_child_if_absent("k", Bytes::from_static(b"2"), true, 2, true),
            CreateOutcome::Exists
        );

        let child = parent.child("k").unwrap();
        child.delete(true, 3);
        assert_eq!(
            parent.put_child_if_absent("k", Bytes::from_static(b"3"), true, 4, false),
            CreateOutcome::Created
        );
    }

    #[tokio::test]
    async fn test_subscribers_never_block() {
        let root = tree();
        let parent = path(&root, &["a"]);
        let (tx, mut rx) = mpsc::channel(1);
        parent.subscribe("s1", tx);

        let child = path(&root, &["a", "b"]);
        child.put(Bytes::from_static(b"1"), true, 1);
        child.put(Bytes::from_static(b"2"), true, 2);
        child.delete(true, 3);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.token, "b");
        assert_eq!(first.value, Some(Bytes::from_static(b"1")));
        assert_eq!(
            root.metrics.dropped_notifications.load(Ordering::Relaxed),
            2
        );

        assert!(parent.unsubscribe("s1"));
        assert!(!parent.unsubscribe("s1"));
    }
}
