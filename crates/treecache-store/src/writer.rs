//! Lazy writer and evictor
//!
//! One pass walks the whole tree with an explicit stack. Dirty nodes are
//! written to the backing store; clean values at or below the LRU threshold
//! are released. The threshold for the next pass is the update time ranked
//! `lru_size` among the values still resident, so anything older becomes a
//! candidate. Childless nodes are handed to garbage collection afterwards.
//!
//! A barrier in the locking state is promoted only by a pass that began
//! after it was published and left nothing dirty at or before its timestamp.

use crate::barrier::{BarrierState, BarrierStatus};
use crate::metrics::CacheMetrics;
use crate::node::{Node, PurgeState, SyncSnapshot, WriteOutcome};
use crate::store::Store;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use treecache_common::{LogicalTime, WireRecord, child_path};

/// Outcome of one lazy writer pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes visited, root included
    pub visited: usize,
    pub flushed: usize,
    pub failed: usize,
    /// Written, but changed again while the write was in flight
    pub requeued: usize,
    pub evicted: usize,
    pub max_depth: usize,
    /// Threshold computed for the next pass
    pub next_threshold: LogicalTime,
}

/// Run [`Store::run_sync_cycle`] every `interval` until shutdown
pub(crate) async fn writer_loop(
    store: Weak<Store>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Lazy writer running every {:?}", interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.run_sync_cycle().await;
            }
        }
    }
    info!("Lazy writer stopped");
}

impl Store {
    /// One lazy writer pass: flush dirty nodes, evict old clean values,
    /// recompute the LRU threshold and collect empty leaves.
    pub async fn run_sync_cycle(&self) -> SyncReport {
        let started = Instant::now();
        let barrier = self.barrier.current(self.backend.as_ref()).await;
        let threshold = self.lru_threshold();
        let mut report = SyncReport::default();
        let mut samples: Vec<LogicalTime> = Vec::new();
        let mut leaves: Vec<Arc<Node>> = Vec::new();

        let mut stack = vec![(Arc::clone(&self.root), String::new(), 0usize)];
        while let Some((node, key, depth)) = stack.pop() {
            report.visited += 1;
            report.max_depth = report.max_depth.max(depth);

            let children = node.children();
            let childless = children.is_empty();
            for (token, child) in children {
                let child_key = child_path(&key, &token);
                stack.push((child, child_key, depth + 1));
            }
            if depth == 0 {
                continue;
            }

            let snapshot = node.sync_snapshot();
            let mut evicted = false;
            if snapshot.sync_needed {
                match self.flush_node(&node, &key, &snapshot).await {
                    Flush::Done => report.flushed += 1,
                    Flush::Requeued => report.requeued += 1,
                    Flush::Failed => report.failed += 1,
                }
            } else if snapshot.unverified {
                self.settle_node(&node, &key).await;
            } else if snapshot.purge_state == PurgeState::Active
                && snapshot.exists
                && snapshot.update_time <= threshold
            {
                evicted = node.try_purge_ready() && node.try_purge_confirm();
                if evicted {
                    report.evicted += 1;
                    debug!("Evicted {} (updated at {})", key, snapshot.update_time);
                }
            } else if snapshot.purge_state == PurgeState::PendingPurge {
                node.try_purge_confirm();
            }

            if snapshot.exists && snapshot.purge_state == PurgeState::Active && !evicted {
                samples.push(snapshot.update_time);
            }
            if childless {
                leaves.push(node);
            }
        }

        let rank = self.config.lru_size;
        report.next_threshold = if samples.len() > rank {
            let (_, at_rank, _) = samples.select_nth_unstable_by(rank, |a, b| b.cmp(a));
            *at_rank
        } else {
            LogicalTime::MIN
        };
        self.lru_threshold
            .store(report.next_threshold, Ordering::Release);

        for leaf in leaves {
            leaf.collect_garbage();
        }

        let drained = report.failed == 0 && report.requeued == 0;
        if barrier.status == BarrierStatus::Locking && drained {
            self.promote_barrier(barrier).await;
        }

        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.metrics.record_cycle(elapsed_us, report.max_depth);
        if report.flushed > 0 || report.failed > 0 || report.requeued > 0 || report.evicted > 0 {
            debug!(
                "Sync pass over {} nodes: {} flushed, {} failed, {} requeued, {} evicted in {}us",
                report.visited,
                report.flushed,
                report.failed,
                report.requeued,
                report.evicted,
                elapsed_us
            );
        }
        report
    }

    /// Write one dirty node
    async fn flush_node(&self, node: &Arc<Node>, key: &str, snapshot: &SyncSnapshot) -> Flush {
        let subject = self.subject(key);

        if snapshot.blind {
            // written without knowing the backing record: it may be newer
            let (absent, remote) = match self.backend.get(&subject).await {
                Ok(None) => (true, None),
                Ok(Some(entry)) => match WireRecord::decode(&entry.value) {
                    Ok(record) => (record.is_none(), record),
                    Err(e) => {
                        warn!("Replacing corrupt record at {}: {}", subject, e);
                        (false, None)
                    }
                },
                Err(e) => {
                    CacheMetrics::incr(&self.metrics.flush_failures);
                    warn!("Flush of {} failed, will retry: {}", key, e);
                    return Flush::Failed;
                }
            };
            if snapshot.unverified && node.settle(remote.as_ref()) == WriteOutcome::Stale {
                debug!("Dropped parked write to {}, backing record is newer", key);
                return Flush::Done;
            }
            match remote {
                Some(remote) if remote.time > snapshot.update_time => {
                    node.load_record(&remote);
                    debug!(
                        "Kept newer backing record for {} ({} > {})",
                        key, remote.time, snapshot.update_time
                    );
                    return Flush::Done;
                }
                None if absent && !snapshot.exists => {
                    // nothing to delete
                    if node.mark_flushed(snapshot) {
                        node.try_purge_confirm();
                        return Flush::Done;
                    }
                    return Flush::Requeued;
                }
                _ => {}
            }
        }

        match self
            .backend
            .put(&subject, snapshot.record().encode())
            .await
        {
            Ok(revision) => {
                CacheMetrics::incr(&self.metrics.flushes);
                debug!("Flushed {} at revision {}", key, revision);
                if node.mark_flushed(snapshot) {
                    Flush::Done
                } else {
                    debug!("{} changed during flush, staying dirty", key);
                    Flush::Requeued
                }
            }
            Err(e) => {
                CacheMetrics::incr(&self.metrics.flush_failures);
                warn!("Flush of {} failed, will retry: {}", key, e);
                Flush::Failed
            }
        }
    }

    /// Decide a parked memory-only write against the backing record
    async fn settle_node(&self, node: &Arc<Node>, key: &str) {
        let subject = self.subject(key);
        let remote = match self.backend.get(&subject).await {
            Ok(Some(entry)) => match WireRecord::decode(&entry.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Ignoring corrupt record at {}: {}", subject, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                debug!("Could not settle parked write to {}: {}", key, e);
                return;
            }
        };
        if node.settle(remote.as_ref()) == WriteOutcome::Stale {
            debug!("Dropped parked write to {}, backing record is newer", key);
        }
    }

    /// Whether any node still holds an unflushed write at or before `time`
    fn has_dirty_at_or_before(&self, time: LogicalTime) -> bool {
        let mut stack = vec![Arc::clone(&self.root)];
        while let Some(node) = stack.pop() {
            let snapshot = node.sync_snapshot();
            if snapshot.sync_needed && snapshot.update_time <= time {
                return true;
            }
            stack.extend(node.children().into_iter().map(|(_, child)| child));
        }
        false
    }

    /// Lock the barrier observed at the start of a drained pass
    async fn promote_barrier(&self, observed: BarrierState) {
        if self.has_dirty_at_or_before(observed.barrier_timestamp) {
            debug!(
                "Writes at or before {} still pending, barrier stays locking",
                observed.barrier_timestamp
            );
            return;
        }
        let state = self.barrier.current(self.backend.as_ref()).await;
        if state != observed {
            return;
        }
        if let Err(e) = self
            .barrier
            .mark_locked(self.backend.as_ref(), observed.barrier_timestamp)
            .await
        {
            warn!("Could not mark write barrier locked: {}", e);
        }
    }
}

/// Outcome of writing one node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flush {
    Done,
    /// The write landed but the node changed meanwhile
    Requeued,
    Failed,
}
