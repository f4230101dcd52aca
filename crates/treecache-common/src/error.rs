//! Error types for treecache
//!
//! This module defines the common error type returned by the store API.

use crate::types::{KeyError, LogicalTime};
use thiserror::Error;

/// Common result type for treecache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for treecache
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: KeyError },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("operation blocked by write barrier: {op_time} > {barrier_timestamp}")]
    BarrierBlocked {
        op_time: LogicalTime,
        barrier_timestamp: LogicalTime,
    },

    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("backing store error: {0}")]
    Backend(String),

    #[error("corrupt wire envelope: {0} bytes")]
    CorruptEnvelope(usize),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create a backing store error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if the caller may retry the operation later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_) | Self::BarrierBlocked { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a write barrier rejection
    #[must_use]
    pub fn is_barrier_blocked(&self) -> bool {
        matches!(self, Self::BarrierBlocked { .. })
    }
}
