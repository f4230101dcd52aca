//! Key enumeration by pattern
//!
//! Memory answers first. Where eviction may have left holes (a non-zero
//! consistency loss marker), the backing store is scanned with the same
//! pattern and keys memory has no authoritative record for are merged in.
//! A scan that turns up nothing new proves the subtree complete again and
//! the marker is cleared with a compare-and-swap against the value seen
//! before the scan, so a concurrent eviction is never forgotten.

use crate::metrics::CacheMetrics;
use crate::node::{Node, Slot};
use crate::store::Store;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use treecache_common::{
    Error, LogicalTime, Pattern, PatternTail, Result, WILDCARD_SINGLE, WILDCARD_SUBTREE,
    WireRecord, child_path, join_tokens,
};

/// Result of merging a backing-store scan into an in-memory listing
struct ScanMerge {
    added: usize,
    ok: bool,
}

impl Store {
    /// Keys matching `pattern`, whose last token may be a literal, `*` (one
    /// level) or `>` (everything below). Results are sorted.
    pub async fn get_keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let parsed = Pattern::parse(pattern).map_err(|reason| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        })?;
        CacheMetrics::incr(&self.metrics.pattern_queries);

        let keys = match self.find_node(parsed.parent()) {
            Some(parent) => match parsed.tail() {
                PatternTail::Literal(token) => self.match_literal(&parsed, &parent, token).await,
                PatternTail::Single => self.match_level(&parsed, &parent).await,
                PatternTail::Subtree => self.match_subtree(&parsed, &parent).await,
            },
            None => self.match_detached_branch(&parsed).await,
        };
        Ok(keys.into_iter().collect())
    }

    async fn match_literal(&self, parsed: &Pattern, parent: &Arc<Node>, token: &str) -> BTreeSet<String> {
        let key = child_path(&join_tokens(parsed.parent()), token);
        let mut keys = BTreeSet::new();
        let unknown = match parent.child(token).map(|child| child.slot()) {
            Some(Slot::Value { .. }) => {
                keys.insert(key);
                return keys;
            }
            Some(Slot::Tombstone { .. }) => return keys,
            Some(Slot::Unknown) | None => true,
        };
        if unknown && parent.consistency_loss_time() > 0 {
            CacheMetrics::incr(&self.metrics.consistency_scans);
            match self.backend.get(&self.subject(&key)).await {
                Ok(Some(entry)) if is_live(&entry.value) => {
                    keys.insert(key);
                }
                Ok(_) => {}
                Err(e) => {
                    CacheMetrics::incr(&self.metrics.scan_failures);
                    warn!("Point read for {} failed, answering from memory: {}", key, e);
                }
            }
        }
        keys
    }

    async fn match_level(&self, parsed: &Pattern, parent: &Arc<Node>) -> BTreeSet<String> {
        let prefix = join_tokens(parsed.parent());
        // read the marker before looking at memory so a racing eviction
        // keeps it set
        let observed = parent.consistency_loss_time();

        let mut keys = BTreeSet::new();
        let mut known = HashSet::new();
        for (token, child) in parent.children() {
            let key = child_path(&prefix, &token);
            match child.slot() {
                Slot::Value { .. } => {
                    keys.insert(key.clone());
                    known.insert(key);
                }
                Slot::Tombstone { .. } => {
                    known.insert(key);
                }
                Slot::Unknown => {}
            }
        }

        if observed > 0 {
            let subject = self.subject_pattern(parsed.parent(), WILDCARD_SINGLE);
            let merge = self.merge_scan(&subject, &known, &mut keys).await;
            if merge.ok && merge.added == 0 && parent.clear_consistency_loss(observed) {
                CacheMetrics::incr(&self.metrics.consistency_restores);
                debug!("Level {:?} verified complete", prefix);
            }
        }
        keys
    }

    async fn match_subtree(&self, parsed: &Pattern, parent: &Arc<Node>) -> BTreeSet<String> {
        let prefix = join_tokens(parsed.parent());
        let mut keys = BTreeSet::new();
        let mut known = HashSet::new();
        let mut lossy: Vec<(Arc<Node>, LogicalTime)> = Vec::new();

        let mut stack = vec![(Arc::clone(parent), prefix.clone())];
        while let Some((node, path)) = stack.pop() {
            let loss = node.consistency_loss_time();
            if loss > 0 {
                lossy.push((Arc::clone(&node), loss));
            }
            for (token, child) in node.children() {
                let key = child_path(&path, &token);
                match child.slot() {
                    Slot::Value { .. } => {
                        keys.insert(key.clone());
                        known.insert(key.clone());
                    }
                    Slot::Tombstone { .. } => {
                        known.insert(key.clone());
                    }
                    Slot::Unknown => {}
                }
                stack.push((child, key));
            }
        }

        if !lossy.is_empty() {
            let subject = self.subject_pattern(parsed.parent(), WILDCARD_SUBTREE);
            let merge = self.merge_scan(&subject, &known, &mut keys).await;
            if merge.ok && merge.added == 0 {
                let restored = lossy
                    .iter()
                    .filter(|(node, observed)| node.clear_consistency_loss(*observed))
                    .count();
                self.metrics
                    .consistency_restores
                    .fetch_add(restored as u64, std::sync::atomic::Ordering::Relaxed);
                debug!("Subtree {:?} verified complete ({} markers cleared)", prefix, restored);
            }
        }
        keys
    }

    /// The pattern's parent is not in memory. Only a lossy ancestor can
    /// have had it evicted, in which case the backing store answers alone.
    async fn match_detached_branch(&self, parsed: &Pattern) -> BTreeSet<String> {
        let ancestor = self.nearest_node(parsed.parent());
        let mut keys = BTreeSet::new();
        if ancestor.consistency_loss_time() == 0 {
            return keys;
        }
        let tail = match parsed.tail() {
            PatternTail::Literal(token) => token.as_str(),
            PatternTail::Single => WILDCARD_SINGLE,
            PatternTail::Subtree => WILDCARD_SUBTREE,
        };
        let subject = self.subject_pattern(parsed.parent(), tail);
        self.merge_scan(&subject, &HashSet::new(), &mut keys).await;
        keys
    }

    /// Add live backing-store keys matching `subject` that memory has no
    /// authoritative record of
    async fn merge_scan(
        &self,
        subject: &str,
        known: &HashSet<String>,
        keys: &mut BTreeSet<String>,
    ) -> ScanMerge {
        CacheMetrics::incr(&self.metrics.consistency_scans);
        let entries = match self.backend.entries(subject).await {
            Ok(entries) => entries,
            Err(e) => {
                CacheMetrics::incr(&self.metrics.scan_failures);
                warn!("Scan of {} failed, answering from memory: {}", subject, e);
                return ScanMerge { added: 0, ok: false };
            }
        };

        let mut added = 0;
        for entry in entries {
            let Some(key) = self.key_from_subject(&entry.subject) else {
                continue;
            };
            if known.contains(key) || !is_live(&entry.value) {
                continue;
            }
            if keys.insert(key.to_string()) {
                added += 1;
            }
        }
        debug!("Scan of {} added {} keys", subject, added);
        ScanMerge { added, ok: true }
    }
}

fn is_live(raw: &[u8]) -> bool {
    matches!(WireRecord::decode(raw), Ok(Some(record)) if record.present)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use treecache_common::CacheConfig;
    use treecache_kv::{KvBackend, MemoryKv};

    fn store_with(lru_size: usize) -> (Arc<Store>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let config = CacheConfig::new("test")
            .with_lru_size(lru_size)
            .with_sync_interval(Duration::from_millis(10))
            .with_barrier_refresh_interval(Duration::from_secs(60));
        (Store::new(config, kv.clone()).unwrap(), kv)
    }

    async fn backend_keys(kv: &MemoryKv, pattern: &str) -> Vec<String> {
        let mut keys: Vec<String> = kv
            .entries(pattern)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| is_live(&e.value))
            .map(|e| e.subject.trim_start_matches("store.").to_string())
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_memory_only_patterns() {
        let (store, kv) = store_with(100);
        for key in ["a.x", "a.y", "a.y.z", "b"] {
            store.set_value_kv_sync(key, "v", 1).await.unwrap();
        }
        store.delete_value_kv_sync("a.x", 2).await.unwrap();

        assert_eq!(store.get_keys_by_pattern("a.*").await.unwrap(), vec!["a.y"]);
        assert_eq!(
            store.get_keys_by_pattern("a.>").await.unwrap(),
            vec!["a.y", "a.y.z"]
        );
        assert_eq!(
            store.get_keys_by_pattern(">").await.unwrap(),
            vec!["a.y", "a.y.z", "b"]
        );
        assert_eq!(store.get_keys_by_pattern("*").await.unwrap(), vec!["b"]);
        assert_eq!(store.get_keys_by_pattern("a.y").await.unwrap(), vec!["a.y"]);
        assert!(store.get_keys_by_pattern("a.x").await.unwrap().is_empty());
        assert!(store.get_keys_by_pattern("nope.*").await.unwrap().is_empty());
        assert_eq!(kv.stats().scans(), 0);

        assert!(matches!(
            store.get_keys_by_pattern("a.*.b").await,
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_eviction_transparency() {
        let (store, kv) = store_with(3);
        for i in 0..10 {
            store
                .set_value_kv_sync(&format!("p.k{i}"), format!("v{i}"), i + 1)
                .await
                .unwrap();
        }
        store
            .set_value_kv_sync("p.deep.leaf", "d", 1)
            .await
            .unwrap();

        // flush, then evict everything below the threshold
        store.run_sync_cycle().await;
        store.run_sync_cycle().await;
        assert!(store.resident_values() <= 4);
        assert!(store.metrics().snapshot().evictions > 0);

        let expected = backend_keys(&kv, "store.p.>").await;
        assert_eq!(expected.len(), 11);
        assert_eq!(store.get_keys_by_pattern("p.>").await.unwrap(), expected);

        let level = backend_keys(&kv, "store.p.*").await;
        assert_eq!(store.get_keys_by_pattern("p.*").await.unwrap(), level);

        // evicted values are still readable
        assert_eq!(store.get_value("p.k0").await.unwrap(), Bytes::from("v0"));
    }

    #[tokio::test]
    async fn test_literal_under_lossy_parent() {
        let (store, _) = store_with(1);
        store.set_value_kv_sync("q.old", "1", 1).await.unwrap();
        store.set_value_kv_sync("q.new", "2", 2).await.unwrap();
        store.run_sync_cycle().await;
        store.run_sync_cycle().await;

        assert_eq!(store.get_keys_by_pattern("q.old").await.unwrap(), vec!["q.old"]);
        assert!(store.get_keys_by_pattern("q.none").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verification_clears_loss_marker() {
        let (store, _) = store_with(1);
        store.set_value_kv_sync("r.a", "1", 1).await.unwrap();
        store.set_value_kv_sync("r.b", "2", 2).await.unwrap();
        store.run_sync_cycle().await;
        store.run_sync_cycle().await;

        let parent = store.find_node(&["r"]).unwrap();
        assert!(parent.consistency_loss_time() > 0);

        // the evicted key is still in the backing store: not restored
        assert_eq!(
            store.get_keys_by_pattern("r.*").await.unwrap(),
            vec!["r.a", "r.b"]
        );
        assert!(parent.consistency_loss_time() > 0);

        // once memory knows about it again, nothing new turns up
        store.delete_value_kv_sync("r.a", 3).await.unwrap();
        assert_eq!(store.get_keys_by_pattern("r.*").await.unwrap(), vec!["r.b"]);
        assert_eq!(parent.consistency_loss_time(), 0);
        assert_eq!(store.metrics().snapshot().consistency_restores, 1);
    }

    #[tokio::test]
    async fn test_scan_failure_degrades_to_memory() {
        let (store, kv) = store_with(1);
        store.set_value_kv_sync("s.a", "1", 1).await.unwrap();
        store.set_value_kv_sync("s.b", "2", 2).await.unwrap();
        store.run_sync_cycle().await;
        store.run_sync_cycle().await;

        kv.set_unavailable(true);
        assert_eq!(store.get_keys_by_pattern("s.>").await.unwrap(), vec!["s.b"]);
        assert_eq!(store.metrics().snapshot().scan_failures, 1);
        assert!(store.find_node(&["s"]).unwrap().consistency_loss_time() > 0);
    }

    #[tokio::test]
    async fn test_branch_missing_under_lossy_ancestor() {
        let (store, kv) = store_with(1);
        store.set_value_kv_sync("t.x", "1", 1).await.unwrap();
        store.set_value_kv_sync("t.z", "2", 2).await.unwrap();
        store.run_sync_cycle().await;
        store.run_sync_cycle().await;
        assert!(store.find_node(&["t", "x"]).is_none());

        // written elsewhere and not ingested here
        kv.put("store.t.m.n", WireRecord::present(5, Bytes::from("n")).encode())
            .await
            .unwrap();

        let scans = kv.stats().scans();
        assert_eq!(store.get_keys_by_pattern("t.m.*").await.unwrap(), vec!["t.m.n"]);
        assert_eq!(kv.stats().scans(), scans + 1);
        // nothing is materialized and the ancestor stays lossy
        assert!(store.find_node(&["t", "m"]).is_none());
        assert!(store.find_node(&["t"]).unwrap().consistency_loss_time() > 0);
    }

    #[tokio::test]
    async fn test_branch_missing_under_clean_ancestor() {
        let (store, kv) = store_with(100);
        store.set_value_kv_sync("u.a", "1", 1).await.unwrap();
        kv.put("store.u.v.w", WireRecord::present(5, Bytes::from("w")).encode())
            .await
            .unwrap();

        assert!(store.get_keys_by_pattern("u.v.*").await.unwrap().is_empty());
        assert_eq!(kv.stats().scans(), 0);
    }
}
