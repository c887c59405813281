//! Content-addressable build cache.
//!
//! Maps cache keys to stored manifests containing snapshots plus
//! environment/metadata deltas, with TTL- and size-bounded eviction. Caching
//! must never break builds: put and evict failures are logged and swallowed,
//! and orphaned index entries self-heal on the next lookup.

use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::platform::Platform;
use crate::snapshots::Snapshot;
use crate::store::{self, ContentStore, ContentWriter};

pub mod index;
pub mod manifest;

pub use index::{CacheIndex, CacheIndexEntry, EntryMetadata, IndexStatistics};
pub use manifest::{CacheManifest, MANIFEST_MEDIA_TYPE, SCHEMA_VERSION};

/// Key addressing one cache entry.
///
/// Equality is set-equality on the input digests; producer ordering never
/// matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub operation_digest: Digest,
    pub input_digests: BTreeSet<Digest>,
    pub platform: Platform,
}

impl CacheKey {
    pub fn new(
        operation_digest: Digest,
        input_digests: impl IntoIterator<Item = Digest>,
        platform: Platform,
    ) -> Self {
        Self { operation_digest, input_digests: input_digests.into_iter().collect(), platform }
    }

    /// Derive the cache digest addressing this key.
    ///
    /// Hashes the configured key version, the operation digest, the input
    /// digests in ascending string order, and the canonical platform
    /// encoding. The sort guarantees order-independence over the inputs.
    #[must_use]
    pub fn cache_digest(&self, cache_key_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(cache_key_version.as_bytes());
        hasher.update(self.operation_digest.as_slice());
        for digest in &self.input_digests {
            hasher.update(digest.as_slice());
        }
        hasher.update(self.platform.canonical_json().as_bytes());
        format!("sha256:{}", data_encoding::HEXLOWER.encode(&hasher.finalize()))
    }
}

/// A previously cached operation result.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub snapshot: Snapshot,
    pub environment_changes: BTreeMap<String, String>,
    pub metadata_changes: BTreeMap<String, String>,
}

/// Point-in-time cache report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatistics {
    pub entry_count: usize,
    pub total_size: u64,
    pub average_entry_size: u64,
    pub oldest_age_secs: u64,
    pub newest_age_secs: u64,
    pub hit_rate: f64,
    pub policy: String,
}

struct CacheState {
    index: CacheIndex,
    hits: u64,
    misses: u64,
}

/// Content-addressable cache over an external content store.
///
/// All public operations serialize on one internal lock; the background GC
/// task cooperates through the same entry points, so a `get` racing an
/// eviction observes a clean miss rather than a half-removed entry.
pub struct ContentAddressableCache {
    config: CacheConfig,
    store: Arc<dyn ContentStore>,
    state: Arc<Mutex<CacheState>>,
    gc_task: tokio::task::JoinHandle<()>,
}

impl ContentAddressableCache {
    /// Open the cache, loading the durable index and starting the periodic
    /// GC task.
    pub fn new(config: CacheConfig, store: Arc<dyn ContentStore>) -> Result<Self> {
        let index = CacheIndex::open(&config.index_path)?;
        let state = Arc::new(Mutex::new(CacheState { index, hits: 0, misses: 0 }));

        let gc_state = Arc::downgrade(&state);
        let gc_store = store.clone();
        let gc_config = config.clone();
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc_config.gc_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so a fresh cache
            // does not GC before anything is stored.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = gc_state.upgrade() else { break };
                let mut state = state.lock().await;
                expire_entries(&mut state, gc_store.as_ref(), &gc_config).await;
                enforce_size(&mut state, gc_store.as_ref(), &gc_config).await;
            }
        });

        Ok(Self { config, store, state, gc_task })
    }

    /// Look up a cached result.
    ///
    /// Missing or malformed manifests remove the orphaned index row and
    /// report a miss. Hits stamp the entry's access time.
    #[instrument(skip_all, fields(operation = operation_type))]
    pub async fn get(&self, key: &CacheKey, operation_type: &str) -> Result<Option<CachedResult>> {
        let cache_digest = key.cache_digest(&self.config.cache_key_version);
        let mut state = self.state.lock().await;

        let Some(entry) = state.index.get(&cache_digest).cloned() else {
            state.misses += 1;
            debug!(key = %cache_digest, "cache miss");
            return Ok(None);
        };

        if self.config.verify_integrity {
            match self.store.get_blob(&entry.descriptor.digest).await? {
                Some(bytes) if Digest::compute(&bytes) == entry.descriptor.digest => {}
                _ => {
                    warn!(key = %cache_digest, "manifest blob failed integrity check");
                    return self.heal_orphan(&mut state, &cache_digest).await;
                }
            }
        }

        let manifest: Option<CacheManifest> =
            store::get_typed(self.store.as_ref(), &entry.descriptor.digest).await?;
        let Some(manifest) = manifest.filter(CacheManifest::is_well_formed) else {
            warn!(key = %cache_digest, "manifest missing or malformed, removing orphan entry");
            return self.heal_orphan(&mut state, &cache_digest).await;
        };
        let snapshot = manifest.snapshot.expect("well-formed manifest embeds a snapshot");

        state.index.touch(&cache_digest)?;
        state.hits += 1;
        info!(key = %cache_digest, snapshot = %snapshot.digest, "cache hit");

        Ok(Some(CachedResult {
            snapshot,
            environment_changes: manifest.environment_changes,
            metadata_changes: manifest.metadata_changes,
        }))
    }

    /// Store an operation result.
    ///
    /// Idempotent per key; failures never propagate to the caller.
    #[instrument(skip_all, fields(operation = operation_type))]
    pub async fn put(&self, result: &CachedResult, key: &CacheKey, operation_type: &str) {
        if let Err(e) = self.try_put(result, key, operation_type).await {
            warn!(error = %e, "cache put failed");
        }
    }

    async fn try_put(
        &self,
        result: &CachedResult,
        key: &CacheKey,
        operation_type: &str,
    ) -> Result<()> {
        let cache_digest = key.cache_digest(&self.config.cache_key_version);
        let mut state = self.state.lock().await;
        if state.index.contains(&cache_digest) {
            debug!(key = %cache_digest, "cache entry already present");
            return Ok(());
        }

        let manifest = CacheManifest::new(
            cache_digest.clone(),
            operation_type.to_string(),
            key.platform.clone(),
            result.snapshot.clone(),
            result.environment_changes.clone(),
            result.metadata_changes.clone(),
        );

        let session = self.store.new_ingest_session().await?;
        let written = async {
            let writer = ContentWriter::new(&session.directory);
            let (size, digest) = writer.create(&manifest).await?;
            self.store.complete_ingest_session(&session.id).await?;
            Ok::<_, StrataError>((size, digest))
        }
        .await;

        let (size, digest) = match written {
            Ok(pair) => pair,
            Err(e) => {
                if let Err(cancel_err) = self.store.cancel_ingest_session(&session.id).await {
                    warn!(error = %cancel_err, "failed to cancel ingest session");
                }
                return Err(e);
            }
        };

        state.index.put(
            cache_digest.clone(),
            crate::store::Descriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_string(),
                digest,
                size,
            },
            EntryMetadata::new(
                key.operation_digest.string_value(),
                key.platform.to_string(),
                self.config.default_ttl(),
            ),
        )?;
        info!(key = %cache_digest, size, "stored cache entry");

        // Post-put size check runs off the request path.
        if state.index.total_size() > self.config.max_size {
            drop(state);
            let state = self.state.clone();
            let store = self.store.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let mut state = state.lock().await;
                enforce_size(&mut state, store.as_ref(), &config).await;
            });
        }
        Ok(())
    }

    /// Whether an entry exists for the key. Index-only.
    pub async fn has(&self, key: &CacheKey) -> bool {
        let cache_digest = key.cache_digest(&self.config.cache_key_version);
        self.state.lock().await.index.contains(&cache_digest)
    }

    /// The index row for a key, if present. Index-only, no blob fetch.
    pub async fn index_entry(&self, key: &CacheKey) -> Option<CacheIndexEntry> {
        let cache_digest = key.cache_digest(&self.config.cache_key_version);
        self.state.lock().await.index.get(&cache_digest).cloned()
    }

    /// Snapshot of every index row, for inspection and diagnostics.
    pub async fn all_entries(&self) -> Vec<(String, CacheIndexEntry)> {
        let state = self.state.lock().await;
        state.index.all_entries().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Evict entries by cache digest, deleting the referenced manifest blobs.
    /// Failures are logged and swallowed.
    pub async fn evict(&self, keys: &[String]) {
        let mut state = self.state.lock().await;
        evict_keys(&mut state, self.store.as_ref(), keys).await;
    }

    /// Report entry count, sizes, ages, and the hit rate since the cache was
    /// opened.
    pub async fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock().await;
        let index = state.index.statistics();
        let lookups = state.hits + state.misses;
        CacheStatistics {
            entry_count: index.entry_count,
            total_size: index.total_size,
            average_entry_size: index.average_entry_size,
            oldest_age_secs: index.oldest_age_secs,
            newest_age_secs: index.newest_age_secs,
            hit_rate: if lookups == 0 { 0.0 } else { state.hits as f64 / lookups as f64 },
            policy: self.config.eviction_policy.to_string(),
        }
    }

    /// Run one GC pass now: TTL expiry followed by the size check.
    pub async fn run_gc(&self) {
        let mut state = self.state.lock().await;
        expire_entries(&mut state, self.store.as_ref(), &self.config).await;
        enforce_size(&mut state, self.store.as_ref(), &self.config).await;
    }

    async fn heal_orphan(
        &self,
        state: &mut CacheState,
        cache_digest: &str,
    ) -> Result<Option<CachedResult>> {
        state.index.remove(&[cache_digest.to_string()])?;
        state.misses += 1;
        Ok(None)
    }
}

impl Drop for ContentAddressableCache {
    fn drop(&mut self) {
        self.gc_task.abort();
    }
}

/// Delete entries and their manifest blobs. Failures are logged and the
/// index row is removed regardless, keeping lookups self-consistent.
async fn evict_keys(state: &mut CacheState, store: &dyn ContentStore, keys: &[String]) {
    for key in keys {
        let Some(entry) = state.index.get(key).cloned() else { continue };
        if let Err(e) = store.delete(std::slice::from_ref(&entry.descriptor.digest)).await {
            warn!(key = %key, error = %e, "failed to delete manifest blob");
        }
        if let Err(e) = state.index.remove(std::slice::from_ref(key)) {
            warn!(key = %key, error = %e, "failed to remove index entry");
        }
    }
}

/// Evict entries whose TTL (or the cache-wide max age) has lapsed.
async fn expire_entries(state: &mut CacheState, store: &dyn ContentStore, config: &CacheConfig) {
    let now = chrono::Utc::now();
    let max_age = (config.max_age_ms > 0).then_some(config.max_age_ms);

    let expired: Vec<String> = state
        .index
        .all_entries()
        .filter(|(_, entry)| {
            let age = (now - entry.metadata.created_at).num_milliseconds().max(0) as u64;
            let ttl = entry
                .metadata
                .ttl()
                .map(|t| t.as_millis() as u64)
                .or((config.default_ttl_ms > 0).then_some(config.default_ttl_ms));
            ttl.is_some_and(|ttl| age > ttl) || max_age.is_some_and(|max| age > max)
        })
        .map(|(key, _)| key.clone())
        .collect();

    if !expired.is_empty() {
        info!(count = expired.len(), "evicting expired cache entries");
        evict_keys(state, store, &expired).await;
    }
}

/// If the cache exceeds its size bound, evict least-recently-used entries
/// down to the low-water mark (80% of the bound).
async fn enforce_size(state: &mut CacheState, store: &dyn ContentStore, config: &CacheConfig) {
    let total = state.index.total_size();
    if total <= config.max_size {
        return;
    }
    let low_water = (config.max_size as f64 * 0.8) as u64;
    warn!(total, max = config.max_size, low_water, "cache over size bound, evicting LRU entries");

    let mut reclaimed = 0u64;
    let mut victims = Vec::new();
    for (key, entry) in state.index.entries_by_lru() {
        if total - reclaimed <= low_water {
            break;
        }
        reclaimed += entry.descriptor.size;
        victims.push(key);
    }
    evict_keys(state, store, &victims).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalContentStore;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_result() -> CachedResult {
        let snapshot =
            Snapshot::prepared(Some(Digest::zero()), PathBuf::from("/tmp/strata-test-mount"));
        let mut environment_changes = BTreeMap::new();
        environment_changes.insert("PATH".to_string(), "/usr/bin".to_string());
        let mut metadata_changes = BTreeMap::new();
        metadata_changes.insert("build.time".to_string(), "2024-08-01".to_string());
        CachedResult { snapshot, environment_changes, metadata_changes }
    }

    fn sample_key(seed: &[u8]) -> CacheKey {
        CacheKey::new(
            Digest::compute(seed),
            vec![Digest::compute(b"i1"), Digest::compute(b"i2"), Digest::compute(b"i3")],
            Platform::linux_arm64(),
        )
    }

    async fn cache_in(dir: &TempDir, config: CacheConfig) -> (ContentAddressableCache, Arc<LocalContentStore>) {
        let store = Arc::new(LocalContentStore::new(dir.path().join("store")).await.unwrap());
        let mut config = config;
        config.index_path = dir.path().join("index.json");
        let cache = ContentAddressableCache::new(config, store.clone()).unwrap();
        (cache, store)
    }

    #[test]
    fn test_cache_digest_input_order_independent() {
        let i1 = Digest::compute(b"i1");
        let i2 = Digest::compute(b"i2");
        let i3 = Digest::compute(b"i3");
        let op = Digest::compute(b"op");

        let k1 = CacheKey::new(op.clone(), vec![i1.clone(), i2.clone(), i3.clone()], Platform::linux_arm64());
        let k2 = CacheKey::new(op, vec![i3, i2, i1], Platform::linux_arm64());
        assert_eq!(k1.cache_digest("v1"), k2.cache_digest("v1"));
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_cache_digest_sensitive_to_version_and_platform() {
        let key = sample_key(b"op");
        assert_ne!(key.cache_digest("v1"), key.cache_digest("v2"));

        let mut other = key.clone();
        other.platform = Platform::linux_amd64();
        assert_ne!(key.cache_digest("v1"), other.cache_digest("v1"));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let (cache, _store) = cache_in(&dir, CacheConfig::default()).await;

        let key = sample_key(b"op");
        let result = sample_result();
        cache.put(&result, &key, "exec").await;

        let fetched = cache.get(&key, "exec").await.unwrap().expect("hit");
        assert_eq!(fetched.snapshot.digest, result.snapshot.digest);
        assert_eq!(fetched.snapshot.size, result.snapshot.size);
        assert_eq!(fetched.environment_changes, result.environment_changes);
        assert_eq!(fetched.metadata_changes, result.metadata_changes);
    }

    #[tokio::test]
    async fn test_put_idempotent() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_in(&dir, CacheConfig::default()).await;

        let key = sample_key(b"op");
        let result = sample_result();
        cache.put(&result, &key, "exec").await;
        cache.put(&result, &key, "exec").await;

        assert_eq!(store.blob_count().await.unwrap(), 1);
        assert_eq!(cache.statistics().await.entry_count, 1);
    }

    #[tokio::test]
    async fn test_has_with_permuted_inputs() {
        let dir = TempDir::new().unwrap();
        let (cache, _store) = cache_in(&dir, CacheConfig::default()).await;

        let i1 = Digest::compute(b"i1");
        let i2 = Digest::compute(b"i2");
        let i3 = Digest::compute(b"i3");
        let op = Digest::compute(b"op");
        let k1 = CacheKey::new(op.clone(), vec![i1.clone(), i2.clone(), i3.clone()], Platform::linux_arm64());
        let k2 = CacheKey::new(op, vec![i3, i2, i1], Platform::linux_arm64());

        cache.put(&sample_result(), &k1, "exec").await;
        assert!(cache.has(&k2).await);
    }

    #[tokio::test]
    async fn test_orphan_self_heal_on_missing_blob() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_in(&dir, CacheConfig::default()).await;

        let key = sample_key(b"op");
        cache.put(&sample_result(), &key, "exec").await;

        // Drop the manifest blob behind the cache's back.
        let digest = {
            let state = cache.state.lock().await;
            let cache_digest = key.cache_digest("v1");
            state.index.get(&cache_digest).unwrap().descriptor.digest.clone()
        };
        store.delete(&[digest]).await.unwrap();

        assert!(cache.get(&key, "exec").await.unwrap().is_none());
        assert!(!cache.has(&key).await);
    }

    #[tokio::test]
    async fn test_orphan_self_heal_on_manifest_without_snapshot() {
        let dir = TempDir::new().unwrap();
        let (cache, store) = cache_in(&dir, CacheConfig::default()).await;

        let key = sample_key(b"op");
        cache.put(&sample_result(), &key, "exec").await;

        // Rewrite the stored manifest with its snapshot stripped.
        let (blob_digest, cache_digest) = {
            let state = cache.state.lock().await;
            let cache_digest = key.cache_digest("v1");
            (state.index.get(&cache_digest).unwrap().descriptor.digest.clone(), cache_digest)
        };
        let mut manifest: CacheManifest =
            store::get_typed(store.as_ref(), &blob_digest).await.unwrap().unwrap();
        manifest.snapshot = None;
        store
            .overwrite_blob(&blob_digest, &serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();

        assert!(cache.get(&key, "exec").await.unwrap().is_none());
        assert!(!cache.has(&key).await);
        let state = cache.state.lock().await;
        assert!(state.index.get(&cache_digest).is_none());
    }

    #[tokio::test]
    async fn test_ttl_eviction_via_gc() {
        let dir = TempDir::new().unwrap();
        let mut config = CacheConfig::default();
        config.default_ttl_ms = 1_000;
        config.gc_interval_ms = 1_000;
        let (cache, _store) = cache_in(&dir, config).await;

        let key = sample_key(b"op");
        cache.put(&sample_result(), &key, "exec").await;
        assert!(cache.has(&key).await);

        // Backdate the entry past its TTL, then force a pass.
        {
            let mut state = cache.state.lock().await;
            let cache_digest = key.cache_digest("v1");
            let entry = state.index.get(&cache_digest).unwrap().clone();
            let mut metadata = entry.metadata.clone();
            metadata.created_at = chrono::Utc::now() - chrono::Duration::seconds(10);
            state.index.put(cache_digest, entry.descriptor, metadata).unwrap();
        }
        cache.run_gc().await;
        assert!(!cache.has(&key).await);
    }

    #[tokio::test]
    async fn test_size_bounded_eviction_is_lru() {
        let dir = TempDir::new().unwrap();

        let old_key = sample_key(b"old");
        let new_key = sample_key(b"new");
        let entry_size;

        // Fill the cache under a generous bound, backdating the first
        // entry's access time so LRU will pick it.
        {
            let (cache, _store) = cache_in(&dir, CacheConfig::default()).await;
            cache.put(&sample_result(), &old_key, "exec").await;
            cache.put(&sample_result(), &new_key, "exec").await;

            let mut state = cache.state.lock().await;
            let cache_digest = old_key.cache_digest("v1");
            let entry = state.index.get(&cache_digest).unwrap().clone();
            entry_size = entry.descriptor.size;
            let mut metadata = entry.metadata.clone();
            metadata.accessed_at = chrono::Utc::now() - chrono::Duration::seconds(100);
            state.index.put(cache_digest, entry.descriptor, metadata).unwrap();
        }

        // Reopen over the same index with a bound only one entry fits under.
        let store = Arc::new(LocalContentStore::new(dir.path().join("store")).await.unwrap());
        let mut config = CacheConfig::default();
        config.index_path = dir.path().join("index.json");
        config.max_size = entry_size + entry_size / 2;
        let cache = ContentAddressableCache::new(config, store).unwrap();

        cache.run_gc().await;
        assert!(!cache.has(&old_key).await);
        assert!(cache.has(&new_key).await);
    }

    #[tokio::test]
    async fn test_statistics_report() {
        let dir = TempDir::new().unwrap();
        let (cache, _store) = cache_in(&dir, CacheConfig::default()).await;

        let key = sample_key(b"op");
        let miss_key = sample_key(b"other");
        cache.put(&sample_result(), &key, "exec").await;
        cache.get(&key, "exec").await.unwrap();
        cache.get(&miss_key, "exec").await.unwrap();

        let stats = cache.statistics().await;
        assert_eq!(stats.entry_count, 1);
        assert!(stats.total_size > 0);
        assert_eq!(stats.policy, "lru");
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
