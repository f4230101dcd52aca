//! treecache Store - hierarchical write-back cache
//!
//! This crate implements the in-memory key tree in front of a backing
//! key-value store: last-write-wins reads and writes, pattern queries that
//! stay correct under eviction, level subscriptions, transactions, the
//! write barrier, and the background ingestion and lazy writer tasks.

mod barrier;
mod ingest;
pub mod metrics;
mod node;
mod pattern;
mod store;
mod txn;
mod writer;

// Re-exports
pub use barrier::{BarrierState, BarrierStatus};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use node::{LevelEvent, PurgeState};
pub use store::Store;
pub use writer::SyncReport;

pub use treecache_common::{CacheConfig, Error, Key, LogicalTime, Result};
