//! Persistent backing store backed by redb.
//!
//! A single table maps subject → `[8 bytes big-endian revision][value]`.
//! All writes are synchronous (write txn + commit) and are published to
//! watchers after commit, under a writer lock so revisions stay ordered.

use crate::backend::{KvBackend, KvEntry, KvEvent, KvOp, KvWatcher, WatchHub};
use crate::error::{KvError, KvResult};
use crate::subject::{literal_prefix, subject_matches, validate_pattern, validate_subject};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use tracing::{debug, info};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

const REVISION_LEN: usize = 8;

fn encode_record(revision: u64, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(REVISION_LEN + value.len());
    out.extend_from_slice(&revision.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_record(subject: &str, raw: &[u8]) -> KvResult<(u64, Bytes)> {
    if raw.len() < REVISION_LEN {
        return Err(KvError::CorruptRecord(subject.to_string()));
    }
    let mut rev = [0u8; REVISION_LEN];
    rev.copy_from_slice(&raw[..REVISION_LEN]);
    Ok((
        u64::from_be_bytes(rev),
        Bytes::copy_from_slice(&raw[REVISION_LEN..]),
    ))
}

/// Persistent backing store
pub struct RedbKv {
    db: Database,
    /// Last assigned revision; guards the write path
    writer: Mutex<u64>,
    hub: WatchHub,
}

impl RedbKv {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(RECORDS)?;
        }
        write_txn.commit()?;

        let mut last_revision = 0;
        {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(RECORDS)?;
            for entry in table.iter()? {
                let entry = entry?;
                let (revision, _) = decode_record(entry.0.value(), entry.1.value())?;
                last_revision = last_revision.max(revision);
            }
        }

        info!(
            "Opened redb backing store at {} (last revision {})",
            path.display(),
            last_revision
        );

        Ok(Self {
            db,
            writer: Mutex::new(last_revision),
            hub: WatchHub::new(),
        })
    }

    fn read_entry(&self, subject: &str) -> KvResult<Option<KvEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        match table.get(subject)? {
            Some(raw) => {
                let (revision, value) = decode_record(subject, raw.value())?;
                Ok(Some(KvEntry {
                    subject: subject.to_string(),
                    value,
                    revision,
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl KvBackend for RedbKv {
    async fn get(&self, subject: &str) -> KvResult<Option<KvEntry>> {
        validate_subject(subject)?;
        self.read_entry(subject)
    }

    async fn put(&self, subject: &str, value: Bytes) -> KvResult<u64> {
        validate_subject(subject)?;

        let mut last_revision = self.writer.lock();
        let revision = *last_revision + 1;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RECORDS)?;
            table.insert(subject, encode_record(revision, &value).as_slice())?;
        }
        write_txn.commit()?;
        *last_revision = revision;

        self.hub.publish(&KvEvent {
            subject: subject.to_string(),
            value,
            revision,
            op: KvOp::Put,
        });
        Ok(revision)
    }

    async fn purge(&self, subject: &str, expected_revision: Option<u64>) -> KvResult<bool> {
        validate_subject(subject)?;

        let mut last_revision = self.writer.lock();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(RECORDS)?;
            // Read and compare, then drop the guard before mutating
            let current = match table.get(subject)? {
                Some(raw) => Some(decode_record(subject, raw.value())?.0),
                None => None,
            };
            let matches = match (current, expected_revision) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(current), Some(expected)) => current == expected,
            };
            if matches {
                table.remove(subject)?;
            }
            matches
        };
        if !removed {
            write_txn.abort()?;
            debug!("Purge of {} skipped: revision moved on", subject);
            return Ok(false);
        }
        write_txn.commit()?;

        *last_revision += 1;
        self.hub.publish(&KvEvent {
            subject: subject.to_string(),
            value: Bytes::new(),
            revision: *last_revision,
            op: KvOp::Purge,
        });
        Ok(true)
    }

    async fn entries(&self, pattern: &str) -> KvResult<Vec<KvEntry>> {
        validate_pattern(pattern)?;

        let prefix = literal_prefix(pattern);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let subject = entry.0.value();
            if !subject.starts_with(&prefix) || !subject_matches(pattern, subject) {
                continue;
            }
            let (revision, value) = decode_record(subject, entry.1.value())?;
            result.push(KvEntry {
                subject: subject.to_string(),
                value,
                revision,
            });
        }
        Ok(result)
    }

    async fn watch(&self, pattern: &str) -> KvResult<KvWatcher> {
        validate_pattern(pattern)?;
        Ok(self.hub.subscribe(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.redb");

        let rev = {
            let kv = RedbKv::open(&path).unwrap();
            kv.put("store.a.b", Bytes::from_static(b"x")).await.unwrap()
        };

        let kv = RedbKv::open(&path).unwrap();
        let entry = kv.get("store.a.b").await.unwrap().unwrap();
        assert_eq!(entry.value, Bytes::from_static(b"x"));
        assert_eq!(entry.revision, rev);

        // revisions keep growing after reopen
        let next = kv.put("store.c", Bytes::new()).await.unwrap();
        assert!(next > rev);
    }

    #[tokio::test]
    async fn test_entries_and_purge() {
        let dir = TempDir::new().unwrap();
        let kv = RedbKv::open(dir.path().join("kv.redb")).unwrap();
        kv.put("store.a.x", Bytes::from_static(b"1")).await.unwrap();
        let rev = kv.put("store.a.y", Bytes::from_static(b"2")).await.unwrap();
        kv.put("store.b", Bytes::from_static(b"3")).await.unwrap();

        let level = kv.entries("store.a.*").await.unwrap();
        assert_eq!(level.len(), 2);

        let mut watcher = kv.watch("store.>").await.unwrap();
        assert!(!kv.purge("store.a.y", Some(rev - 1)).await.unwrap());
        assert!(kv.purge("store.a.y", Some(rev)).await.unwrap());
        assert!(kv.get("store.a.y").await.unwrap().is_none());

        let event = watcher.next().await.unwrap();
        assert_eq!(event.op, KvOp::Purge);
        assert_eq!(event.subject, "store.a.y");
        assert_eq!(kv.entries("store.>").await.unwrap().len(), 2);
    }
}
