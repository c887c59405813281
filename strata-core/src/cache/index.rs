//! Durable cache index.
//!
//! Maps cache digest strings to blob descriptors plus access metadata. The
//! whole index persists as one JSON file; it is small (one row per cache
//! entry) and rewritten on every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, StrataError};
use crate::store::Descriptor;

/// Access metadata for one cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    /// Digest of the operation that produced the entry.
    pub operation_hash: String,
    /// Platform string, e.g. `"linux/arm64"`.
    pub platform: String,
    /// Per-entry TTL in milliseconds, if set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl EntryMetadata {
    /// Fresh metadata stamped now.
    #[must_use]
    pub fn new(operation_hash: String, platform: String, ttl: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            accessed_at: now,
            operation_hash,
            platform,
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
            tags: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

/// One cache index row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub descriptor: Descriptor,
    pub metadata: EntryMetadata,
}

/// Aggregate numbers over the index.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStatistics {
    pub entry_count: usize,
    pub total_size: u64,
    pub average_entry_size: u64,
    pub oldest_age_secs: u64,
    pub newest_age_secs: u64,
}

/// Durable mapping from cache digest to descriptor + metadata.
#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    entries: HashMap<String, CacheIndexEntry>,
}

impl CacheIndex {
    /// Open the index at `path`, loading existing entries if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| StrataError::io(&path, e))?;
            serde_json::from_str(&content).map_err(|e| StrataError::InvalidFormat {
                reason: format!("bad cache index at {}: {e}", path.display()),
            })?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CacheIndexEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or replace an entry and persist.
    pub fn put(&mut self, key: String, descriptor: Descriptor, metadata: EntryMetadata) -> Result<()> {
        self.entries.insert(key, CacheIndexEntry { descriptor, metadata });
        self.persist()
    }

    /// Stamp an entry's access time and persist.
    pub fn touch(&mut self, key: &str) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.metadata.accessed_at = Utc::now();
            self.persist()?;
        }
        Ok(())
    }

    /// Remove entries and persist. Unknown keys are skipped.
    pub fn remove(&mut self, keys: &[String]) -> Result<()> {
        let mut changed = false;
        for key in keys {
            if self.entries.remove(key).is_some() {
                debug!(key = %key, "removed cache index entry");
                changed = true;
            }
        }
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    pub fn all_entries(&self) -> impl Iterator<Item = (&String, &CacheIndexEntry)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of all referenced blobs in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.descriptor.size).sum()
    }

    /// Entries sorted by access time, least recently used first.
    #[must_use]
    pub fn entries_by_lru(&self) -> Vec<(String, CacheIndexEntry)> {
        let mut entries: Vec<(String, CacheIndexEntry)> =
            self.entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by_key(|(_, e)| e.metadata.accessed_at);
        entries
    }

    #[must_use]
    pub fn statistics(&self) -> IndexStatistics {
        let entry_count = self.entries.len();
        let total_size = self.total_size();
        let now = Utc::now();
        let ages: Vec<u64> = self
            .entries
            .values()
            .map(|e| (now - e.metadata.created_at).num_seconds().max(0) as u64)
            .collect();
        IndexStatistics {
            entry_count,
            total_size,
            average_entry_size: if entry_count == 0 { 0 } else { total_size / entry_count as u64 },
            oldest_age_secs: ages.iter().copied().max().unwrap_or(0),
            newest_age_secs: ages.iter().copied().min().unwrap_or(0),
        }
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StrataError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| StrataError::EncodingFailed { reason: e.to_string() })?;
        std::fs::write(&self.path, content).map_err(|e| StrataError::io(&self.path, e))
    }
}
