//! Backing store change ingestion
//!
//! Every store watches its whole prefix. Changes written by other stores
//! are merged into the tree by logical time; echoes of this store's own
//! flushes confirm that the backing store holds the node's state, which is
//! what lets tombstones be released and physically purged.

use crate::metrics::CacheMetrics;
use crate::node::{Node, WriteOutcome};
use crate::store::Store;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use treecache_common::{Key, WireRecord};
use treecache_kv::{KvEvent, KvOp, KvWatcher};

/// Feed watch events into the store until shutdown or the watch ends
pub(crate) async fn ingest_loop(
    store: Weak<Store>,
    mut watcher: KvWatcher,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Watching {}", watcher.pattern());
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            event = watcher.next() => {
                let Some(event) = event else {
                    error!("Watch on {} ended", watcher.pattern());
                    break;
                };
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.ingest_event(event).await;
            }
        }
    }
    watcher.stop();
    info!("Stopped watching {}", watcher.pattern());
}

impl Store {
    /// Merge one change observed on the backing store
    pub(crate) async fn ingest_event(&self, event: KvEvent) {
        let Some(key) = self
            .key_from_subject(&event.subject)
            .and_then(|k| Key::new(k).ok())
        else {
            debug!("Ignoring change to {}", event.subject);
            return;
        };
        let tokens: Vec<&str> = key.tokens().collect();

        let record = if event.op == KvOp::Purge {
            None
        } else {
            match WireRecord::decode(&event.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Ignoring corrupt change at {}: {}", event.subject, e);
                    return;
                }
            }
        };

        let Some(record) = record else {
            // physically removed
            if let Some(node) = self.find_node(&tokens)
                && node.mirror_purge()
            {
                debug!("Mirrored purge of {}", key);
                node.collect_garbage();
            }
            return;
        };

        let Some(node) = self.find_node(&tokens) else {
            if record.present {
                self.apply_remote(&key, &tokens, &record);
            }
            return;
        };

        let known = node.update_time();
        if record.time > known {
            self.apply_remote(&key, &tokens, &record);
        } else if record.time == known {
            self.confirm_echo(&node, &key, &record, &event).await;
        } else {
            debug!(
                "Ignoring older change to {} ({} < {})",
                key, record.time, known
            );
        }
    }

    /// Apply a change written elsewhere. Memory only, the record is
    /// already in the backing store.
    fn apply_remote(&self, key: &Key, tokens: &[&str], record: &WireRecord) {
        loop {
            let node = self.ensure_node(tokens);
            let outcome = if record.present {
                node.put(record.payload.clone(), false, record.time)
            } else {
                node.delete(false, record.time)
            };
            match outcome {
                WriteOutcome::Applied => {
                    CacheMetrics::incr(&self.metrics.remote_applied);
                    debug!("Applied remote change to {} at {}", key, record.time);
                    return;
                }
                WriteOutcome::Detached => {}
                WriteOutcome::Stale | WriteOutcome::Unchanged => return,
            }
        }
    }

    /// The backing store now holds exactly this node's state
    async fn confirm_echo(&self, node: &Arc<Node>, key: &Key, record: &WireRecord, event: &KvEvent) {
        if !node.confirm_synced(record.time) {
            return;
        }
        node.try_purge_confirm();
        if record.present {
            return;
        }

        // tombstone is durable: remove it unless someone wrote since
        match self
            .backend
            .purge(&event.subject, Some(event.revision))
            .await
        {
            Ok(true) => {
                CacheMetrics::incr(&self.metrics.secure_purges);
                debug!("Purged tombstone of {} at revision {}", key, event.revision);
            }
            Ok(false) => debug!("Tombstone of {} superseded, kept", key),
            Err(e) => warn!("Purge of tombstone {} failed: {}", key, e),
        }
        node.collect_garbage();
    }
}
