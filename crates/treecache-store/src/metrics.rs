//! Cache metrics
//!
//! Counters are plain atomics owned by the store and shared with every
//! node; `export_prometheus` renders them in the text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Store-owned cache counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub gets: AtomicU64,
    /// Reads that fell through to the backing store
    pub backend_probes: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    /// Writes dropped because a newer logical time was already recorded
    pub stale_writes: AtomicU64,
    pub barrier_rejections: AtomicU64,
    pub pattern_queries: AtomicU64,
    pub consistency_scans: AtomicU64,
    pub consistency_restores: AtomicU64,
    pub scan_failures: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub evictions: AtomicU64,
    pub dropped_notifications: AtomicU64,
    pub remote_applied: AtomicU64,
    pub secure_purges: AtomicU64,
    pub sync_cycles: AtomicU64,
    pub last_cycle_us: AtomicU64,
    pub max_depth: AtomicU64,
    // Gauges
    pub resident_values: AtomicI64,
    pub tree_nodes: AtomicI64,
}

/// Point-in-time copy of the counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub backend_probes: u64,
    pub sets: u64,
    pub deletes: u64,
    pub stale_writes: u64,
    pub barrier_rejections: u64,
    pub pattern_queries: u64,
    pub consistency_scans: u64,
    pub consistency_restores: u64,
    pub scan_failures: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub evictions: u64,
    pub dropped_notifications: u64,
    pub remote_applied: u64,
    pub secure_purges: u64,
    pub sync_cycles: u64,
    pub last_cycle_us: u64,
    pub max_depth: u64,
    pub resident_values: i64,
    pub tree_nodes: i64,
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one lazy writer pass
    pub(crate) fn record_cycle(&self, elapsed_us: u64, max_depth: usize) {
        self.sync_cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_us.store(elapsed_us, Ordering::Relaxed);
        self.max_depth
            .store(u64::try_from(max_depth).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            gets: load(&self.gets),
            backend_probes: load(&self.backend_probes),
            sets: load(&self.sets),
            deletes: load(&self.deletes),
            stale_writes: load(&self.stale_writes),
            barrier_rejections: load(&self.barrier_rejections),
            pattern_queries: load(&self.pattern_queries),
            consistency_scans: load(&self.consistency_scans),
            consistency_restores: load(&self.consistency_restores),
            scan_failures: load(&self.scan_failures),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            evictions: load(&self.evictions),
            dropped_notifications: load(&self.dropped_notifications),
            remote_applied: load(&self.remote_applied),
            secure_purges: load(&self.secure_purges),
            sync_cycles: load(&self.sync_cycles),
            last_cycle_us: load(&self.last_cycle_us),
            max_depth: load(&self.max_depth),
            resident_values: self.resident_values.load(Ordering::Relaxed),
            tree_nodes: self.tree_nodes.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format, labelled with the cache id
    #[must_use]
    pub fn export_prometheus(&self, id: &str) -> String {
        let s = self.snapshot();
        let mut output = String::with_capacity(4 * 1024);

        let counters: [(&str, &str, u64); 18] = [
            ("gets_total", "Value reads", s.gets),
            ("backend_probes_total", "Reads served by a backing store probe", s.backend_probes),
            ("sets_total", "Value writes applied", s.sets),
            ("deletes_total", "Value deletes applied", s.deletes),
            ("stale_writes_total", "Writes dropped by last-write-wins", s.stale_writes),
            ("barrier_rejections_total", "Writes rejected by the write barrier", s.barrier_rejections),
            ("pattern_queries_total", "Pattern queries", s.pattern_queries),
            ("consistency_scans_total", "Backing store scans for lossy subtrees", s.consistency_scans),
            ("consistency_restores_total", "Loss markers cleared after verification", s.consistency_restores),
            ("scan_failures_total", "Failed consistency scans", s.scan_failures),
            ("flushes_total", "Dirty values written to the backing store", s.flushes),
            ("flush_failures_total", "Failed backing store writes", s.flush_failures),
            ("evictions_total", "Values evicted from memory", s.evictions),
            ("dropped_notifications_total", "Level notifications dropped on full channels", s.dropped_notifications),
            ("remote_applied_total", "Remote changes merged into the tree", s.remote_applied),
            ("secure_purges_total", "Tombstone records physically purged", s.secure_purges),
            ("sync_cycles_total", "Lazy writer passes", s.sync_cycles),
            ("last_cycle_microseconds", "Duration of the last lazy writer pass", s.last_cycle_us),
        ];

        for (name, help, value) in counters {
            let kind = if name.ends_with("_total") { "counter" } else { "gauge" };
            writeln!(output, "# HELP treecache_{name} {help}").ok();
            writeln!(output, "# TYPE treecache_{name} {kind}").ok();
            writeln!(output, "treecache_{name}{{id=\"{id}\"}} {value}").ok();
        }

        let gauges: [(&str, &str, i64); 3] = [
            ("resident_values", "Values currently held in memory", s.resident_values),
            ("tree_nodes", "Nodes currently attached to the tree", s.tree_nodes),
            (
                "tree_depth",
                "Deepest level seen by the last lazy writer pass",
                i64::try_from(s.max_depth).unwrap_or(i64::MAX),
            ),
        ];
        for (name, help, value) in gauges {
            writeln!(output, "# HELP treecache_{name} {help}").ok();
            writeln!(output, "# TYPE treecache_{name} gauge").ok();
            writeln!(output, "treecache_{name}{{id=\"{id}\"}} {value}").ok();
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = CacheMetrics::new();
        CacheMetrics::incr(&metrics.gets);
        CacheMetrics::incr(&metrics.gets);
        metrics.resident_values.fetch_add(3, Ordering::Relaxed);
        metrics.record_cycle(42, 5);

        let s = metrics.snapshot();
        assert_eq!(s.gets, 2);
        assert_eq!(s.resident_values, 3);
        assert_eq!(s.sync_cycles, 1);
        assert_eq!(s.last_cycle_us, 42);
        assert_eq!(s.max_depth, 5);
    }

    #[test]
    fn test_export_prometheus() {
        let metrics = CacheMetrics::new();
        CacheMetrics::incr(&metrics.evictions);
        let text = metrics.export_prometheus("main");
        assert!(text.contains("# TYPE treecache_evictions_total counter"));
        assert!(text.contains("treecache_evictions_total{id=\"main\"} 1"));
        assert!(text.contains("# TYPE treecache_resident_values gauge"));
        assert!(text.contains("# TYPE treecache_last_cycle_microseconds gauge"));
    }
}
