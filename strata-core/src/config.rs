//! Cache configuration.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Eviction policy for the content-addressable build cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least-recently-used, keyed on entry access time.
    #[default]
    Lru,
}

impl EvictionPolicy {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration for the content-addressable build cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum total size of cached manifests in bytes.
    pub max_size: u64,
    /// Maximum age of an entry before the periodic GC drops it, in
    /// milliseconds. Zero disables the bound.
    pub max_age_ms: u64,
    /// Path to the durable index file.
    pub index_path: PathBuf,
    /// Eviction policy. Only LRU is supported.
    pub eviction_policy: EvictionPolicy,
    /// Maximum concurrent build operations the scheduler dispatches.
    pub concurrency: usize,
    /// Re-hash fetched manifest blobs against their descriptor digest.
    pub verify_integrity: bool,
    /// Optional shard count for the backing blob directories.
    pub sharding: Option<u32>,
    /// Interval between background GC passes, in milliseconds.
    pub gc_interval_ms: u64,
    /// Version string mixed into every cache digest. Bumping it invalidates
    /// all prior entries without touching the store.
    pub cache_key_version: String,
    /// TTL applied to entries that do not carry their own, in milliseconds.
    /// Zero means no default TTL.
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024 * 1024, // 10 GB
            max_age_ms: 7 * 24 * 3600 * 1000,
            index_path: PathBuf::from("index.json"),
            eviction_policy: EvictionPolicy::Lru,
            concurrency: 4,
            verify_integrity: false,
            sharding: None,
            gc_interval_ms: 300_000,
            cache_key_version: "v1".to_string(),
            default_ttl_ms: 0,
        }
    }
}

impl CacheConfig {
    /// Interval between background GC passes.
    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    /// TTL applied to entries that do not carry their own.
    #[must_use]
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StrataError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| StrataError::InvalidFormat { reason: format!("bad cache config: {e}") })
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| StrataError::EncodingFailed { reason: e.to_string() })?;
        std::fs::write(path, content).map_err(|e| StrataError::io(path, e))
    }
}
