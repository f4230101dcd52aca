//! Configuration types for treecache
//!
//! `CacheConfig` can be built in code with the setter methods or loaded
//! from a TOML file. Missing fields fall back to their defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default subject prefix for cache keys in the backing store
pub const DEFAULT_KV_STORE_PREFIX: &str = "store";

/// Default resident value bound
pub const DEFAULT_LRU_SIZE: usize = 1_000_000;

/// Default per-subscriber notification buffer.
/// ~16 MiB at 64 byte keys and 512 byte values.
pub const DEFAULT_LEVEL_SUBSCRIPTION_BUFFER: usize = 30_000;

/// Default well-known key of the write barrier record
pub const DEFAULT_BARRIER_KEY: &str = "__backup_lock_";

/// Cache store configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Identifier used in logs and metrics
    #[serde(default = "default_id")]
    pub id: String,
    /// Subject prefix; key `k` is stored at `<prefix>.k`
    #[serde(default = "default_kv_store_prefix")]
    pub kv_store_prefix: String,
    /// Number of values kept resident before eviction starts
    #[serde(default = "default_lru_size")]
    pub lru_size: usize,
    /// Capacity of each level subscriber's channel
    #[serde(default = "default_level_subscription_buffer")]
    pub level_subscription_buffer: usize,
    /// Lazy writer period (milliseconds)
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// How long a cached write barrier record stays fresh (milliseconds)
    #[serde(default = "default_barrier_refresh_interval_ms")]
    pub barrier_refresh_interval_ms: u64,
    /// Key of the write barrier record (stored without the prefix)
    #[serde(default = "default_barrier_key")]
    pub barrier_key: String,
}

fn default_id() -> String {
    "cache".to_string()
}

fn default_kv_store_prefix() -> String {
    DEFAULT_KV_STORE_PREFIX.to_string()
}

const fn default_lru_size() -> usize {
    DEFAULT_LRU_SIZE
}

const fn default_level_subscription_buffer() -> usize {
    DEFAULT_LEVEL_SUBSCRIPTION_BUFFER
}

const fn default_sync_interval_ms() -> u64 {
    1000
}

const fn default_barrier_refresh_interval_ms() -> u64 {
    5000
}

fn default_barrier_key() -> String {
    DEFAULT_BARRIER_KEY.to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id: default_id(),
            kv_store_prefix: default_kv_store_prefix(),
            lru_size: default_lru_size(),
            level_subscription_buffer: default_level_subscription_buffer(),
            sync_interval_ms: default_sync_interval_ms(),
            barrier_refresh_interval_ms: default_barrier_refresh_interval_ms(),
            barrier_key: default_barrier_key(),
        }
    }
}

impl CacheConfig {
    /// Default configuration with the given identifier
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Unknown tables are ignored so the cache
    /// section can live inside a larger service config.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&s)
    }

    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.kv_store_prefix.is_empty() {
            return Err(Error::configuration("kv_store_prefix cannot be empty"));
        }
        if self.lru_size == 0 {
            return Err(Error::configuration("lru_size must be greater than 0"));
        }
        if self.level_subscription_buffer == 0 {
            return Err(Error::configuration(
                "level_subscription_buffer must be greater than 0",
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::configuration("sync_interval_ms must be greater than 0"));
        }
        if self.barrier_key.is_empty() {
            return Err(Error::configuration("barrier_key cannot be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_kv_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.kv_store_prefix = prefix.into();
        self
    }

    #[must_use]
    pub const fn with_lru_size(mut self, lru_size: usize) -> Self {
        self.lru_size = lru_size;
        self
    }

    #[must_use]
    pub const fn with_level_subscription_buffer(mut self, size: usize) -> Self {
        self.level_subscription_buffer = size;
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub const fn with_barrier_refresh_interval(mut self, interval: Duration) -> Self {
        self.barrier_refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Lazy writer period
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Write barrier refresh window
    #[must_use]
    pub const fn barrier_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.barrier_refresh_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.kv_store_prefix, "store");
        assert_eq!(config.lru_size, 1_000_000);
        assert_eq!(config.level_subscription_buffer, 30_000);
        assert_eq!(config.barrier_refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.barrier_key, "__backup_lock_");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CacheConfig::from_toml_str(
            r#"
            id = "domain-a"
            lru_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.id, "domain-a");
        assert_eq!(config.lru_size, 10);
        assert_eq!(config.kv_store_prefix, "store");
        assert_eq!(config.sync_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(CacheConfig::from_toml_str("lru_size = 0").is_err());
        assert!(CacheConfig::from_toml_str("kv_store_prefix = \"\"").is_err());
        assert!(CacheConfig::from_toml_str("lru_size = \"many\"").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kv_store_prefix = \"cmdb\"").unwrap();
        let config = CacheConfig::load(file.path()).unwrap();
        assert_eq!(config.kv_store_prefix, "cmdb");

        assert!(CacheConfig::load("/nonexistent/treecache.toml").is_err());
    }

    #[test]
    fn test_setters() {
        let config = CacheConfig::new("t")
            .with_kv_store_prefix("p")
            .with_lru_size(3)
            .with_sync_interval(Duration::from_millis(20));
        assert_eq!(config.id, "t");
        assert_eq!(config.kv_store_prefix, "p");
        assert_eq!(config.lru_size, 3);
        assert_eq!(config.sync_interval_ms, 20);
    }
}
