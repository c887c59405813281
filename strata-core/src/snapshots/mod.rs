//! Snapshot lifecycle.
//!
//! A snapshot is a named point-in-time filesystem state: mutable while
//! prepared, frozen once committed. The [`Snapshotter`] materializes and
//! releases the backing mountpoints; [`DirectorySnapshotter`] is the local
//! directory-backed implementation used by the simulated executors and tests.
//!
//! Legal state transitions:
//!
//! ```text
//! prepared ──► in_progress ──► committed
//!     │                            ▲
//!     └────────────────────────────┘        (skip lock)
//! prepared ──► removed                      (cleanup on failure)
//! ```
//!
//! There is no transition out of `committed`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::diff::key::DiffKey;
use crate::digest::Digest;
use crate::error::{Result, StrataError};

/// Media type recorded for committed layers.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SnapshotState {
    /// Mutable, with a working directory on the host.
    Prepared { mountpoint: PathBuf },
    /// Locked by an operation.
    InProgress { operation_id: String },
    /// Immutable terminal state.
    Committed {
        layer_digest: Option<Digest>,
        layer_size: Option<u64>,
        layer_media_type: Option<String>,
        diff_key: Option<DiffKey>,
    },
}

impl SnapshotState {
    /// Whether transitioning to `next` is legal from this state.
    #[must_use]
    pub fn can_transition(&self, next: &SnapshotState) -> bool {
        match (self, next) {
            (Self::Prepared { .. }, Self::InProgress { .. }) => true,
            (Self::Prepared { .. }, Self::Committed { .. }) => true,
            (Self::InProgress { .. }, Self::Committed { .. }) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Prepared { .. } => "prepared",
            Self::InProgress { .. } => "in_progress",
            Self::Committed { .. } => "committed",
        }
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A per-step filesystem state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique snapshot identifier within a process.
    pub id: String,

    /// Content digest of the snapshot.
    pub digest: Digest,

    /// Size of the snapshot contents in bytes.
    pub size: u64,

    /// Digest of the parent snapshot. The all-zero digest roots the snapshot
    /// at scratch; any other parent must already be committed.
    pub parent: Option<Digest>,

    /// When the snapshot was created.
    pub created_at: DateTime<Utc>,

    /// Current lifecycle state.
    pub state: SnapshotState,
}

impl Snapshot {
    /// Create a fresh prepared snapshot with a generated id.
    #[must_use]
    pub fn prepared(parent: Option<Digest>, mountpoint: PathBuf) -> Self {
        let id = format!("snap-{}", Uuid::new_v4());
        let digest = Digest::compute(id.as_bytes());
        Self {
            id,
            digest,
            size: 0,
            parent,
            created_at: Utc::now(),
            state: SnapshotState::Prepared { mountpoint },
        }
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self.state, SnapshotState::Committed { .. })
    }

    /// The working mountpoint, while the snapshot is prepared.
    #[must_use]
    pub fn mountpoint(&self) -> Option<&PathBuf> {
        match &self.state {
            SnapshotState::Prepared { mountpoint } => Some(mountpoint),
            _ => None,
        }
    }

    /// The diff key recorded at commit, if any.
    #[must_use]
    pub fn diff_key(&self) -> Option<&DiffKey> {
        match &self.state {
            SnapshotState::Committed { diff_key, .. } => diff_key.as_ref(),
            _ => None,
        }
    }

    /// Move to a new state, enforcing the transition table.
    pub fn transition(&mut self, next: SnapshotState) -> Result<()> {
        if !self.state.can_transition(&next) {
            return Err(StrataError::InvalidState {
                reason: format!(
                    "snapshot {} cannot transition {} -> {}",
                    self.id, self.state, next
                ),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Attach a diff key to a committed snapshot.
    ///
    /// This augments the terminal state while the commit result is being
    /// assembled; it is not a state transition. Fails on non-committed
    /// snapshots.
    pub fn with_diff_key(mut self, key: DiffKey) -> Result<Self> {
        match &mut self.state {
            SnapshotState::Committed { diff_key, .. } => {
                *diff_key = Some(key);
                Ok(self)
            }
            other => Err(StrataError::InvalidState {
                reason: format!("snapshot {} is {other}, not committed", self.id),
            }),
        }
    }
}

/// Prepares, commits, and removes snapshot mountpoints.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Ensure the working mountpoint exists, materializing the parent first
    /// if it is not yet available. Idempotent for snapshots already in
    /// `prepared` state.
    async fn prepare(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Produce the immutable snapshot with its final digest. The returned
    /// snapshot keeps the same id.
    async fn commit(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Release the mountpoint and any in-progress state. Safe to call on
    /// either prepared or committed snapshots.
    async fn remove(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Directory-backed snapshotter.
///
/// Each prepared snapshot gets a directory on the host; commit freezes the
/// entity and records the digest as materialized so children can stack on
/// top of it.
pub struct DirectorySnapshotter {
    root: PathBuf,
    /// Committed digest -> mountpoint that materialized it.
    materialized: Arc<Mutex<HashMap<Digest, PathBuf>>>,
}

impl DirectorySnapshotter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), materialized: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Directory used to materialize a parent snapshot that is not already
    /// backed by a live mountpoint.
    fn parent_dir(&self, digest: &Digest) -> PathBuf {
        self.root.join("parents").join(digest.hex())
    }
}

#[async_trait]
impl Snapshotter for DirectorySnapshotter {
    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    async fn prepare(&self, snapshot: Snapshot) -> Result<Snapshot> {
        let mountpoint = match snapshot.mountpoint() {
            Some(mountpoint) => mountpoint.clone(),
            None => {
                return Err(StrataError::InvalidState {
                    reason: format!(
                        "snapshot {} is {}, prepare needs a prepared snapshot",
                        snapshot.id, snapshot.state
                    ),
                })
            }
        };

        // Materialize the parent first. The zero digest roots at scratch and
        // has nothing to materialize.
        if let Some(parent) = snapshot.parent.as_ref().filter(|p| !p.is_zero()) {
            let mut materialized = self.materialized.lock().await;
            if !materialized.contains_key(parent) {
                let dir = self.parent_dir(parent);
                tokio::fs::create_dir_all(&dir).await.map_err(|e| StrataError::io(&dir, e))?;
                debug!(parent = %parent, dir = %dir.display(), "materialized parent snapshot");
                materialized.insert(parent.clone(), dir);
            }
        }

        tokio::fs::create_dir_all(&mountpoint)
            .await
            .map_err(|e| StrataError::io(&mountpoint, e))?;
        debug!(mountpoint = %mountpoint.display(), "prepared snapshot");
        Ok(snapshot)
    }

    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    async fn commit(&self, mut snapshot: Snapshot) -> Result<Snapshot> {
        let mountpoint = snapshot.mountpoint().cloned();

        let layer_digest = Digest::compute(format!("layer:{}", snapshot.id).as_bytes());
        snapshot.transition(SnapshotState::Committed {
            layer_digest: Some(layer_digest),
            layer_size: Some(snapshot.size),
            layer_media_type: Some(LAYER_MEDIA_TYPE.to_string()),
            diff_key: None,
        })?;

        if let Some(mountpoint) = mountpoint {
            self.materialized.lock().await.insert(snapshot.digest.clone(), mountpoint);
        }
        debug!(digest = %snapshot.digest, "committed snapshot");
        Ok(snapshot)
    }

    #[instrument(skip(self, snapshot), fields(id = %snapshot.id))]
    async fn remove(&self, snapshot: &Snapshot) -> Result<()> {
        self.materialized.lock().await.remove(&snapshot.digest);
        if let Some(mountpoint) = snapshot.mountpoint() {
            match tokio::fs::remove_dir_all(mountpoint).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(mountpoint = %mountpoint.display(), error = %e,
                          "failed to remove snapshot mountpoint");
                    return Err(StrataError::io(mountpoint, e));
                }
            }
        }
        Ok(())
    }
}
