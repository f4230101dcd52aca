//! treecache Common - Shared types and utilities
//!
//! This crate provides the key and pattern types, the wire envelope,
//! error definitions and configuration used across all treecache components.

pub mod config;
pub mod envelope;
pub mod error;
pub mod types;

pub use config::CacheConfig;
pub use envelope::WireRecord;
pub use error::{Error, Result};
pub use types::*;
