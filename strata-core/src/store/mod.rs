//! Content store interface and local implementation.
//!
//! The build cache treats the content store as a blob store with
//! ingest-session semantics: a session stages writes in a private directory,
//! and completing the session publishes the staged blobs under their digest.
//! Files are stored by SHA-256 digest, deduplicating identical content.
//!
//! ```text
//! blobs/
//! └── sha256/
//!     ├── a1/
//!     │   └── a1b2c3...   # blob content (named by digest)
//!     └── ...
//! ingest/
//! └── ingest-<uuid>/      # staged writes, one directory per session
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{Result, StrataError};

/// Reference to a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// An open ingest session.
#[derive(Debug, Clone)]
pub struct IngestSession {
    pub id: String,
    pub directory: PathBuf,
}

/// Blob store with ingest-session semantics.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Open an ingest session with a private staging directory.
    async fn new_ingest_session(&self) -> Result<IngestSession>;

    /// Publish all blobs staged in the session.
    async fn complete_ingest_session(&self, session_id: &str) -> Result<()>;

    /// Discard the session and everything staged in it.
    async fn cancel_ingest_session(&self, session_id: &str) -> Result<()>;

    /// Fetch a blob by digest. `None` when absent.
    async fn get_blob(&self, digest: &Digest) -> Result<Option<Vec<u8>>>;

    /// Delete blobs by digest. Missing blobs are skipped.
    async fn delete(&self, digests: &[Digest]) -> Result<()>;
}

/// Fetch and JSON-deserialize a blob.
///
/// A blob that is present but does not deserialize is reported as absent;
/// callers treat that as an orphan and self-heal.
pub async fn get_typed<T: DeserializeOwned>(
    store: &dyn ContentStore,
    digest: &Digest,
) -> Result<Option<T>> {
    match store.get_blob(digest).await? {
        Some(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(digest = %digest, error = %e, "stored blob failed to deserialize");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

/// Writes values into an ingest session's staging directory.
pub struct ContentWriter {
    ingest_dir: PathBuf,
}

impl ContentWriter {
    pub fn new(ingest_dir: impl Into<PathBuf>) -> Self {
        Self { ingest_dir: ingest_dir.into() }
    }

    /// Serialize `value` as JSON, stage it under its digest, and return the
    /// canonical `(size, digest)` pair.
    pub async fn create<T: Serialize>(&self, value: &T) -> Result<(u64, Digest)> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| StrataError::EncodingFailed { reason: e.to_string() })?;
        let digest = Digest::compute(&bytes);
        let path = self.ingest_dir.join(digest.hex());
        tokio::fs::write(&path, &bytes).await.map_err(|e| StrataError::io(&path, e))?;
        Ok((bytes.len() as u64, digest))
    }
}

/// Filesystem-backed content store.
pub struct LocalContentStore {
    root: PathBuf,
    /// Open session id -> staging directory.
    sessions: Mutex<HashMap<String, PathBuf>>,
}

impl LocalContentStore {
    /// Create a store rooted at `root`, creating the blob directory.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let blobs = root.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs).await.map_err(|e| StrataError::io(&blobs, e))?;
        Ok(Self { root, sessions: Mutex::new(HashMap::new()) })
    }

    /// Path for a blob. The first two hex characters shard the directory.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.root.join("blobs").join("sha256").join(&hex[..2]).join(hex)
    }

    /// Number of stored blobs.
    pub async fn blob_count(&self) -> Result<usize> {
        let blobs = self.root.join("blobs").join("sha256");
        let mut count = 0;
        let mut shards =
            tokio::fs::read_dir(&blobs).await.map_err(|e| StrataError::io(&blobs, e))?;
        while let Some(shard) = shards.next_entry().await.map_err(|e| StrataError::io(&blobs, e))? {
            if !shard.path().is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path())
                .await
                .map_err(|e| StrataError::io(shard.path(), e))?;
            while let Some(entry) =
                entries.next_entry().await.map_err(|e| StrataError::io(shard.path(), e))?
            {
                if entry.path().is_file() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Overwrite a stored blob in place. Test hook for corrupting entries.
    pub async fn overwrite_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        tokio::fs::write(&path, bytes).await.map_err(|e| StrataError::io(&path, e))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn new_ingest_session(&self) -> Result<IngestSession> {
        let id = format!("ingest-{}", Uuid::new_v4());
        let directory = self.root.join("ingest").join(&id);
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(|e| StrataError::io(&directory, e))?;
        self.sessions.lock().await.insert(id.clone(), directory.clone());
        debug!(session = %id, "opened ingest session");
        Ok(IngestSession { id, directory })
    }

    async fn complete_ingest_session(&self, session_id: &str) -> Result<()> {
        let directory = self.sessions.lock().await.remove(session_id).ok_or_else(|| {
            StrataError::NotFound { resource: "ingest session", id: session_id.to_string() }
        })?;

        let mut staged =
            tokio::fs::read_dir(&directory).await.map_err(|e| StrataError::io(&directory, e))?;
        while let Some(entry) =
            staged.next_entry().await.map_err(|e| StrataError::io(&directory, e))?
        {
            let name = entry.file_name();
            let hex = name.to_string_lossy();
            let digest = Digest::parse(&format!("sha256:{hex}")).map_err(|_| {
                StrataError::StorageFailure {
                    reason: format!("staged blob {hex:?} is not digest-named"),
                }
            })?;

            let target = self.blob_path(&digest);
            if let Some(shard) = target.parent() {
                tokio::fs::create_dir_all(shard).await.map_err(|e| StrataError::io(shard, e))?;
            }
            tokio::fs::rename(entry.path(), &target)
                .await
                .map_err(|e| StrataError::io(&target, e))?;
            debug!(digest = %digest, "published blob");
        }

        tokio::fs::remove_dir_all(&directory)
            .await
            .map_err(|e| StrataError::io(&directory, e))?;
        Ok(())
    }

    async fn cancel_ingest_session(&self, session_id: &str) -> Result<()> {
        let Some(directory) = self.sessions.lock().await.remove(session_id) else {
            return Ok(());
        };
        match tokio::fs::remove_dir_all(&directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(&directory, e)),
        }
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(digest);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StrataError::io(&path, e)),
        }
    }

    async fn delete(&self, digests: &[Digest]) -> Result<()> {
        for digest in digests {
            let path = self.blob_path(digest);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(digest = %digest, "deleted blob"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StrataError::io(&path, e)),
            }
        }
        Ok(())
    }
}
