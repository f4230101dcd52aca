//! In-process backing store
//!
//! Holds entries in an ordered map. Several caches can share one
//! `MemoryKv` to model independent processes over the same replicated
//! store. Call counters and an availability switch make failure paths
//! observable in tests.

use crate::backend::{KvBackend, KvEntry, KvEvent, KvOp, KvWatcher, WatchHub};
use crate::error::{KvError, KvResult};
use crate::subject::{literal_prefix, subject_matches, validate_pattern, validate_subject};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Call counters
#[derive(Debug, Default)]
pub struct MemoryKvStats {
    pub get_calls: AtomicU64,
    pub put_calls: AtomicU64,
    pub purge_calls: AtomicU64,
    pub scan_calls: AtomicU64,
}

impl MemoryKvStats {
    pub fn gets(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    pub fn purges(&self) -> u64 {
        self.purge_calls.load(Ordering::Relaxed)
    }

    pub fn scans(&self) -> u64 {
        self.scan_calls.load(Ordering::Relaxed)
    }
}

struct Records {
    entries: BTreeMap<String, (u64, Bytes)>,
    last_revision: u64,
}

/// In-memory backing store
pub struct MemoryKv {
    records: RwLock<Records>,
    hub: WatchHub,
    unavailable: AtomicBool,
    stats: MemoryKvStats,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Records {
                entries: BTreeMap::new(),
                last_revision: 0,
            }),
            hub: WatchHub::new(),
            unavailable: AtomicBool::new(false),
            stats: MemoryKvStats::default(),
        }
    }

    /// Make every subsequent call fail with `KvError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Call counters
    pub fn stats(&self) -> &MemoryKvStats {
        &self.stats
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw value at a subject, bypassing counters and availability
    pub fn raw(&self, subject: &str) -> Option<Bytes> {
        self.records.read().entries.get(subject).map(|(_, v)| v.clone())
    }

    fn check_available(&self) -> KvResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("memory kv switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, subject: &str) -> KvResult<Option<KvEntry>> {
        self.stats.get_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        validate_subject(subject)?;

        let records = self.records.read();
        Ok(records
            .entries
            .get(subject)
            .map(|(revision, value)| KvEntry {
                subject: subject.to_string(),
                value: value.clone(),
                revision: *revision,
            }))
    }

    async fn put(&self, subject: &str, value: Bytes) -> KvResult<u64> {
        self.stats.put_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        validate_subject(subject)?;

        let mut records = self.records.write();
        records.last_revision += 1;
        let revision = records.last_revision;
        records
            .entries
            .insert(subject.to_string(), (revision, value.clone()));

        self.hub.publish(&KvEvent {
            subject: subject.to_string(),
            value,
            revision,
            op: KvOp::Put,
        });
        Ok(revision)
    }

    async fn purge(&self, subject: &str, expected_revision: Option<u64>) -> KvResult<bool> {
        self.stats.purge_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        validate_subject(subject)?;

        let mut records = self.records.write();
        let matches = match (records.entries.get(subject), expected_revision) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some((current, _)), Some(expected)) => *current == expected,
        };
        if !matches {
            return Ok(false);
        }

        records.entries.remove(subject);
        records.last_revision += 1;
        let revision = records.last_revision;
        self.hub.publish(&KvEvent {
            subject: subject.to_string(),
            value: Bytes::new(),
            revision,
            op: KvOp::Purge,
        });
        Ok(true)
    }

    async fn entries(&self, pattern: &str) -> KvResult<Vec<KvEntry>> {
        self.stats.scan_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        validate_pattern(pattern)?;

        let prefix = literal_prefix(pattern);
        let records = self.records.read();
        Ok(records
            .entries
            .range(prefix.clone()..)
            .take_while(|(subject, _)| subject.starts_with(&prefix))
            .filter(|(subject, _)| subject_matches(pattern, subject))
            .map(|(subject, (revision, value))| KvEntry {
                subject: subject.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect())
    }

    async fn watch(&self, pattern: &str) -> KvResult<KvWatcher> {
        self.check_available()?;
        validate_pattern(pattern)?;
        Ok(self.hub.subscribe(pattern))
    }
}
