//! Serialized cache records.
//!
//! Each cache entry is a single JSON blob: the manifest embeds the snapshot
//! reference directly, plus the environment and metadata deltas the
//! operation produced. There are no separate layer blobs in schema v5.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::platform::Platform;
use crate::snapshots::Snapshot;
use crate::store::Descriptor;

/// Current manifest schema version.
pub const SCHEMA_VERSION: u32 = 5;

/// Media type of cache manifest blobs.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.container-build.cache.manifest.v5+json";

/// Fixed configuration block of a cache manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    /// Cache digest the entry is addressed by.
    pub cache_key: String,
    /// Operation type that produced the entry, e.g. `"exec"`.
    pub operation_type: String,
    /// Platform the operation executed for.
    pub platform: Platform,
    /// Build-core version that wrote the entry.
    pub build_version: String,
    /// Creation time, ISO-8601 UTC.
    pub created_at: DateTime<Utc>,
}

/// A cache record: embedded snapshot plus environment/metadata deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ManifestConfig,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub environment_changes: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata_changes: BTreeMap<String, String>,
}

impl CacheManifest {
    /// Build a v5 manifest around a snapshot and its deltas.
    #[must_use]
    pub fn new(
        cache_key: String,
        operation_type: String,
        platform: Platform,
        snapshot: Snapshot,
        environment_changes: BTreeMap<String, String>,
        metadata_changes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: ManifestConfig {
                cache_key,
                operation_type,
                platform,
                build_version: env!("CARGO_PKG_VERSION").to_string(),
                created_at: Utc::now(),
            },
            annotations: BTreeMap::new(),
            subject: None,
            snapshot: Some(snapshot),
            environment_changes,
            metadata_changes,
        }
    }

    /// Whether the manifest is usable as a cache entry: current schema with
    /// an embedded snapshot.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.schema_version == SCHEMA_VERSION && self.snapshot.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;
    use std::path::PathBuf;

    fn sample_snapshot() -> Snapshot {
        Snapshot::prepared(Some(Digest::zero()), PathBuf::from("/tmp/mount"))
    }

    #[test]
    fn test_roundtrip_preserves_deltas() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        let mut meta = BTreeMap::new();
        meta.insert("build.time".to_string(), "2024-08-01".to_string());

        let manifest = CacheManifest::new(
            "sha256:abc".to_string(),
            "exec".to_string(),
            Platform::linux_arm64(),
            sample_snapshot(),
            env.clone(),
            meta.clone(),
        );

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        let back: CacheManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.environment_changes, env);
        assert_eq!(back.metadata_changes, meta);
        assert_eq!(back.schema_version, SCHEMA_VERSION);
        assert_eq!(back.media_type, MANIFEST_MEDIA_TYPE);
        assert!(back.is_well_formed());
    }

    #[test]
    fn test_created_at_serializes_iso8601() {
        let manifest = CacheManifest::new(
            "sha256:abc".to_string(),
            "image".to_string(),
            Platform::linux_amd64(),
            sample_snapshot(),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        let value = serde_json::to_value(&manifest).unwrap();
        let created_at = value["config"]["createdAt"].as_str().unwrap();
        // RFC 3339 / ISO-8601 with a UTC designator.
        assert!(created_at.ends_with('Z') || created_at.contains("+00:00"));
        assert!(created_at.contains('T'));
    }

    #[test]
    fn test_missing_snapshot_is_malformed() {
        let mut manifest = CacheManifest::new(
            "sha256:abc".to_string(),
            "filesystem".to_string(),
            Platform::linux_arm64(),
            sample_snapshot(),
            BTreeMap::new(),
            BTreeMap::new(),
        );
        manifest.snapshot = None;
        assert!(!manifest.is_well_formed());
    }
}
