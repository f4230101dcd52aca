//! Write barrier
//!
//! A cooperative gate published as a JSON record at a well-known key:
//!
//! ```json
//! {"status": 1, "barrier_timestamp": 1700000000000, "set_by": "cache"}
//! ```
//!
//! Status `1` (locking) is written when a backup asks for a barrier; the
//! lazy writer moves it to `2` (locked) once the backing store holds every
//! write up to the barrier. In both states, writes with a logical time
//! past the barrier are rejected. Each store caches the record in atomics
//! and re-reads it at most once per refresh window.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use treecache_common::{Error, LogicalTime, Result, now_nanos};
use treecache_kv::KvBackend;

/// Barrier lifecycle as stored in the record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierStatus {
    Unlocked,
    /// Published, writers are still draining
    Locking,
    /// Backing store is consistent up to the barrier timestamp
    Locked,
}

impl BarrierStatus {
    const fn code(self) -> u8 {
        match self {
            Self::Unlocked => 0,
            Self::Locking => 1,
            Self::Locked => 2,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unlocked),
            1 => Some(Self::Locking),
            2 => Some(Self::Locked),
            _ => None,
        }
    }

    /// Whether writes past the timestamp are rejected
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        !matches!(self, Self::Unlocked)
    }
}

/// Cached barrier state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierState {
    pub status: BarrierStatus,
    pub barrier_timestamp: LogicalTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct BarrierRecord {
    #[serde(default)]
    status: u8,
    #[serde(default)]
    barrier_timestamp: LogicalTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    set_by: Option<String>,
}

pub(crate) struct WriteBarrier {
    key: String,
    refresh_interval_ns: i64,
    timestamp: AtomicI64,
    status: AtomicU8,
    last_checked: AtomicI64,
}

impl WriteBarrier {
    pub(crate) fn new(key: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            key: key.into(),
            refresh_interval_ns: i64::try_from(refresh_interval.as_nanos()).unwrap_or(i64::MAX),
            timestamp: AtomicI64::new(0),
            status: AtomicU8::new(BarrierStatus::Unlocked.code()),
            // forces a fetch on first use
            last_checked: AtomicI64::new(0),
        }
    }

    /// Cached state, without touching the backing store
    pub(crate) fn cached(&self) -> BarrierState {
        BarrierState {
            status: BarrierStatus::from_code(self.status.load(Ordering::Acquire))
                .unwrap_or(BarrierStatus::Unlocked),
            barrier_timestamp: self.timestamp.load(Ordering::Acquire),
        }
    }

    /// Cached state, refreshed first when the refresh window has passed
    pub(crate) async fn current(&self, backend: &dyn KvBackend) -> BarrierState {
        let elapsed = now_nanos().saturating_sub(self.last_checked.load(Ordering::Acquire));
        if elapsed >= self.refresh_interval_ns {
            self.refresh(backend).await;
        }
        self.cached()
    }

    /// Fail with `BarrierBlocked` when a barrier is up and `op_time` is past it
    pub(crate) async fn check_before_write(
        &self,
        backend: &dyn KvBackend,
        op_time: LogicalTime,
    ) -> Result<()> {
        let state = self.current(backend).await;
        if state.status.is_blocking() && op_time > state.barrier_timestamp {
            return Err(Error::BarrierBlocked {
                op_time,
                barrier_timestamp: state.barrier_timestamp,
            });
        }
        Ok(())
    }

    /// Publish a barrier at `timestamp`
    pub(crate) async fn lock(
        &self,
        backend: &dyn KvBackend,
        timestamp: LogicalTime,
        set_by: &str,
    ) -> Result<()> {
        self.publish(backend, BarrierStatus::Locking, timestamp, Some(set_by))
            .await?;
        info!("Write barrier published at {}", timestamp);
        Ok(())
    }

    /// Promote the locking barrier at `timestamp` to locked; no-op in any
    /// other state or once the barrier was republished elsewhere
    pub(crate) async fn mark_locked(
        &self,
        backend: &dyn KvBackend,
        timestamp: LogicalTime,
    ) -> Result<bool> {
        let state = self.cached();
        if state.status != BarrierStatus::Locking || state.barrier_timestamp != timestamp {
            return Ok(false);
        }
        self.publish(backend, BarrierStatus::Locked, state.barrier_timestamp, None)
            .await?;
        info!(
            "Write barrier at {} locked, cache drained",
            state.barrier_timestamp
        );
        Ok(true)
    }

    pub(crate) async fn unlock(&self, backend: &dyn KvBackend) -> Result<()> {
        self.publish(backend, BarrierStatus::Unlocked, 0, None).await?;
        info!("Write barrier released");
        Ok(())
    }

    async fn publish(
        &self,
        backend: &dyn KvBackend,
        status: BarrierStatus,
        timestamp: LogicalTime,
        set_by: Option<&str>,
    ) -> Result<()> {
        let record = BarrierRecord {
            status: status.code(),
            barrier_timestamp: timestamp,
            set_by: set_by.map(str::to_string),
        };
        let raw = serde_json::to_vec(&record).map_err(|e| Error::Serialization(e.to_string()))?;
        backend.put(&self.key, raw.into()).await?;
        self.update(status, timestamp);
        Ok(())
    }

    async fn refresh(&self, backend: &dyn KvBackend) {
        let record = match backend.get(&self.key).await {
            Ok(None) => BarrierRecord {
                status: BarrierStatus::Unlocked.code(),
                barrier_timestamp: 0,
                set_by: None,
            },
            Ok(Some(entry)) => match serde_json::from_slice::<BarrierRecord>(&entry.value) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Unreadable write barrier record at {}: {}", self.key, e);
                    return;
                }
            },
            Err(e) => {
                debug!("Write barrier refresh failed, keeping cached state: {}", e);
                return;
            }
        };
        let Some(status) = BarrierStatus::from_code(record.status) else {
            warn!(
                "Unknown write barrier status {} at {}, keeping cached state",
                record.status, self.key
            );
            return;
        };
        self.update(status, record.barrier_timestamp);
    }

    fn update(&self, status: BarrierStatus, timestamp: LogicalTime) {
        self.timestamp.store(timestamp, Ordering::Release);
        self.status.store(status.code(), Ordering::Release);
        self.last_checked.store(now_nanos(), Ordering::Release);
    }
}
