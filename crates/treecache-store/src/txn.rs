//! Reentrant write batches
//!
//! `begin` and `end` nest per transaction id. Writes submitted under an id
//! are queued and handed back, in submission order, when the outermost
//! `end` closes the transaction.

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use treecache_common::{Error, Key, LogicalTime, Result};

/// A queued write
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TxnOp {
    Set {
        key: Key,
        value: Bytes,
        sync: bool,
        time: LogicalTime,
    },
    Delete {
        key: Key,
        sync: bool,
        time: LogicalTime,
    },
}

#[derive(Debug, Default)]
struct Transaction {
    depth: u32,
    ops: Vec<TxnOp>,
}

#[derive(Default)]
pub(crate) struct TransactionTable {
    open: DashMap<String, Transaction>,
}

impl TransactionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open a transaction or nest one level deeper. Returns the new depth.
    pub(crate) fn begin(&self, id: &str) -> u32 {
        let mut txn = self.open.entry(id.to_string()).or_default();
        txn.depth += 1;
        txn.depth
    }

    pub(crate) fn enqueue(&self, id: &str, op: TxnOp) -> Result<()> {
        match self.open.get_mut(id) {
            Some(mut txn) => {
                txn.ops.push(op);
                Ok(())
            }
            None => Err(Error::TransactionNotFound(id.to_string())),
        }
    }

    /// Close one nesting level. Returns the queued writes once the
    /// outermost level closes.
    pub(crate) fn end(&self, id: &str) -> Result<Option<Vec<TxnOp>>> {
        match self.open.entry(id.to_string()) {
            Entry::Vacant(_) => Err(Error::TransactionNotFound(id.to_string())),
            Entry::Occupied(mut entry) => {
                let txn = entry.get_mut();
                txn.depth = txn.depth.saturating_sub(1);
                if txn.depth > 0 {
                    return Ok(None);
                }
                Ok(Some(entry.remove().ops))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self, id: &str) -> bool {
        self.open.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, time: LogicalTime) -> TxnOp {
        TxnOp::Set {
            key: Key::new(key).unwrap(),
            value: Bytes::from_static(b"v"),
            sync: true,
            time,
        }
    }

    #[test]
    fn test_nested_begin_end() {
        let table = TransactionTable::new();
        assert_eq!(table.begin("t1"), 1);
        assert_eq!(table.begin("t1"), 2);
        table.enqueue("t1", set("a", 1)).unwrap();
        table.enqueue("t1", set("b", 2)).unwrap();

        assert_eq!(table.end("t1").unwrap(), None);
        assert!(table.is_open("t1"));

        let ops = table.end("t1").unwrap().unwrap();
        assert_eq!(ops, vec![set("a", 1), set("b", 2)]);
        assert!(!table.is_open("t1"));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_unknown_transaction() {
        let table = TransactionTable::new();
        assert!(matches!(
            table.enqueue("nope", set("a", 1)),
            Err(Error::TransactionNotFound(_))
        ));
        assert!(matches!(
            table.end("nope"),
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_independent_ids() {
        let table = TransactionTable::new();
        table.begin("t1");
        table.begin("t2");
        table.enqueue("t2", set("x", 1)).unwrap();
        assert_eq!(table.end("t1").unwrap(), Some(Vec::new()));
        assert_eq!(table.end("t2").unwrap().unwrap().len(), 1);
    }
}
