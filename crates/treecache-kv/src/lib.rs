//! treecache KV - backing store boundary
//!
//! The cache mirrors an external replicated key-value service addressed by
//! dotted subjects with JetStream-style wildcards. This crate defines that
//! boundary (`KvBackend`) and ships two implementations: an in-process
//! `MemoryKv` and a persistent, redb-backed `RedbKv`.

pub mod backend;
pub mod error;
pub mod memory;
pub mod redb_kv;
pub mod subject;

pub use backend::{KvBackend, KvEntry, KvEvent, KvOp, KvWatcher, WatchHub};
pub use error::{KvError, KvResult};
pub use memory::MemoryKv;
pub use redb_kv::RedbKv;
