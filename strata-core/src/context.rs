//! Per-stage execution context.
//!
//! Thread-safe holder for everything a stage mutates while it builds:
//! environment, working directory, user, image configuration, and the
//! snapshot chain. A 1-permit semaphore serializes every filesystem-mutating
//! snapshot sequence (prepare, body, commit/cleanup) so that operations
//! executing in parallel across the scheduler cannot branch a stage's
//! snapshot history. Permits in different contexts do not interfere.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use crate::diff::{Differ, DiffKeyComputer};
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::graph::BuildGraph;
use crate::path::BinaryPath;
use crate::platform::Platform;
use crate::snapshots::{Snapshot, Snapshotter};

/// Image configuration accumulated while a stage executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Mutable per-stage state, guarded by the context lock. Critical sections
/// stay short; no I/O happens while holding it.
#[derive(Debug, Default)]
struct ContextState {
    environment: BTreeMap<String, String>,
    working_directory: BinaryPath,
    user: Option<String>,
    image_config: ImageConfig,
    /// Committed snapshots by operation id.
    snapshots: HashMap<String, Snapshot>,
    /// Prepared-but-uncommitted snapshots by operation id.
    active_snapshots: HashMap<String, Snapshot>,
    /// Most recently committed snapshot for the stage.
    head: Option<Snapshot>,
}

/// Per-stage execution context.
pub struct ExecutionContext {
    stage: String,
    graph: Arc<BuildGraph>,
    platform: Platform,
    mounts_root: PathBuf,
    snapshotter: Arc<dyn Snapshotter>,
    differ: Arc<dyn Differ>,
    state: Mutex<ContextState>,
    /// Serializes filesystem-mutating snapshot sequences within this context.
    fs_permit: Semaphore,
}

impl ExecutionContext {
    pub fn new(
        stage: impl Into<String>,
        graph: Arc<BuildGraph>,
        platform: Platform,
        snapshotter: Arc<dyn Snapshotter>,
        differ: Arc<dyn Differ>,
        mounts_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage: stage.into(),
            graph,
            platform,
            mounts_root: mounts_root.into(),
            snapshotter,
            differ,
            state: Mutex::new(ContextState {
                working_directory: BinaryPath::from("/"),
                ..Default::default()
            }),
            fs_permit: Semaphore::new(1),
        }
    }

    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<BuildGraph> {
        &self.graph
    }

    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub async fn environment(&self) -> BTreeMap<String, String> {
        self.state.lock().await.environment.clone()
    }

    pub async fn set_environment_variable(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().await.environment.insert(key.into(), value.into());
    }

    /// Merge a set of environment changes, e.g. replayed from a cache hit.
    pub async fn apply_environment_changes(&self, changes: &BTreeMap<String, String>) {
        let mut state = self.state.lock().await;
        for (key, value) in changes {
            state.environment.insert(key.clone(), value.clone());
        }
    }

    /// Merge metadata changes into the image configuration labels.
    pub async fn apply_metadata_changes(&self, changes: &BTreeMap<String, String>) {
        let mut state = self.state.lock().await;
        for (key, value) in changes {
            state.image_config.labels.insert(key.clone(), value.clone());
        }
    }

    pub async fn working_directory(&self) -> BinaryPath {
        self.state.lock().await.working_directory.clone()
    }

    pub async fn set_working_directory(&self, dir: BinaryPath) {
        self.state.lock().await.working_directory = dir;
    }

    pub async fn user(&self) -> Option<String> {
        self.state.lock().await.user.clone()
    }

    pub async fn set_user(&self, user: Option<String>) {
        self.state.lock().await.user = user;
    }

    pub async fn image_config(&self) -> ImageConfig {
        self.state.lock().await.image_config.clone()
    }

    /// Mutate the image configuration under the context lock.
    pub async fn update_image_config(&self, update: impl FnOnce(&mut ImageConfig)) {
        let mut state = self.state.lock().await;
        update(&mut state.image_config);
    }

    /// The most recently committed snapshot, or `None` for a fresh context.
    pub async fn head_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.head.clone()
    }

    /// The committed snapshot recorded for an operation, if any.
    pub async fn committed_snapshot(&self, operation_id: &str) -> Option<Snapshot> {
        self.state.lock().await.snapshots.get(operation_id).cloned()
    }

    /// Build and prepare a child snapshot rooted at the context's head.
    ///
    /// The parent digest is the head snapshot's, or the all-zero digest when
    /// the context has no head yet. A fresh per-operation mountpoint is
    /// assigned under the context's mount root.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub async fn prepare_snapshot(&self, operation_id: &str) -> Result<Snapshot> {
        self.prepare_snapshot_from(operation_id, None).await
    }

    async fn prepare_snapshot_from(
        &self,
        operation_id: &str,
        base: Option<&Snapshot>,
    ) -> Result<Snapshot> {
        let parent = {
            let state = self.state.lock().await;
            match base.or(state.head.as_ref()) {
                Some(snapshot) => snapshot.digest.clone(),
                None => Digest::zero(),
            }
        };

        let mountpoint = self.mounts_root.join(operation_id);
        let snapshot = Snapshot::prepared(Some(parent), mountpoint);
        let snapshot = self.snapshotter.prepare(snapshot).await?;

        let mut state = self.state.lock().await;
        state.active_snapshots.insert(operation_id.to_string(), snapshot.clone());
        debug!(id = %snapshot.id, "prepared snapshot");
        Ok(snapshot)
    }

    /// Commit a prepared snapshot and advance the head.
    ///
    /// The differ runs over the snapshot's mountpoint and the resulting diff
    /// key, coupled to the parent lineage, is recorded on the committed
    /// snapshot.
    #[instrument(skip(self, snapshot), fields(stage = %self.stage, id = %snapshot.id))]
    pub async fn commit_snapshot(&self, snapshot: Snapshot, operation_id: &str) -> Result<Snapshot> {
        let diff_key = match snapshot.mountpoint() {
            Some(mountpoint) => {
                let records = self.differ.diff(None, mountpoint).await?;
                let mut computer = DiffKeyComputer::new().target_mount(mountpoint.clone());
                if let Some(parent) = snapshot.parent.as_ref().filter(|p| !p.is_zero()) {
                    computer = computer.base_digest(parent.clone());
                }
                Some(computer.compute(&records).await?)
            }
            None => None,
        };

        let mut committed = self.snapshotter.commit(snapshot).await?;
        if let Some(key) = diff_key {
            committed = committed.with_diff_key(key)?;
        }

        let mut state = self.state.lock().await;
        state.active_snapshots.remove(operation_id);
        state.snapshots.insert(operation_id.to_string(), committed.clone());
        state.head = Some(committed.clone());
        debug!(digest = %committed.digest, "committed snapshot, head advanced");
        Ok(committed)
    }

    /// Remove the active snapshot for an operation and release its
    /// resources. Errors are reported but non-fatal.
    pub async fn cleanup_snapshot(&self, operation_id: &str) {
        let snapshot = self.state.lock().await.active_snapshots.remove(operation_id);
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.snapshotter.remove(&snapshot).await {
                warn!(id = %snapshot.id, error = %e, "snapshot cleanup failed");
            }
        }
    }

    /// Record an already-committed snapshot (e.g. replayed from a cache hit)
    /// for an operation and promote it as the new head.
    pub async fn adopt_snapshot(&self, snapshot: Snapshot, operation_id: &str) -> Result<()> {
        if !snapshot.is_committed() {
            return Err(StrataError::InvalidState {
                reason: format!("snapshot {} is {}, cannot adopt", snapshot.id, snapshot.state),
            });
        }
        let mut state = self.state.lock().await;
        state.snapshots.insert(operation_id.to_string(), snapshot.clone());
        state.head = Some(snapshot);
        Ok(())
    }

    /// Run a filesystem-mutating operation in a prepare/body/commit scope.
    ///
    /// Acquires the context's FS permit, prepares a snapshot from `base` (or
    /// the current head), runs `body`, commits on success, and cleans up on
    /// failure. Returns the body's output together with the committed
    /// snapshot.
    pub async fn with_snapshot<T, F, Fut>(
        &self,
        base: Option<&Snapshot>,
        operation_id: &str,
        body: F,
    ) -> Result<(T, Snapshot)>
    where
        F: FnOnce(Snapshot) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self.fs_permit.acquire().await.map_err(|_| StrataError::InvalidState {
            reason: "execution context is shut down".to_string(),
        })?;

        let snapshot = self.prepare_snapshot_from(operation_id, base).await?;
        match body(snapshot.clone()).await {
            Ok(output) => {
                let committed = self.commit_snapshot(snapshot, operation_id).await?;
                Ok((output, committed))
            }
            Err(e) => {
                self.cleanup_snapshot(operation_id).await;
                Err(e)
            }
        }
    }

    /// Prepare and immediately commit a snapshot, for operations that do not
    /// modify filesystem state (e.g. a base-image load).
    pub async fn prepare_and_commit(
        &self,
        base: Option<&Snapshot>,
        operation_id: &str,
    ) -> Result<Snapshot> {
        let (_, committed) = self.with_snapshot(base, operation_id, |_| async { Ok(()) }).await?;
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EmptyDiffer;
    use crate::snapshots::DirectorySnapshotter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn context_in(dir: &TempDir) -> Arc<ExecutionContext> {
        Arc::new(ExecutionContext::new(
            "default",
            Arc::new(BuildGraph::default()),
            Platform::linux_arm64(),
            Arc::new(DirectorySnapshotter::new(dir.path().join("snapshots"))),
            Arc::new(EmptyDiffer),
            dir.path().join("mounts"),
        ))
    }

    #[tokio::test]
    async fn test_prepare_roots_at_scratch_then_head() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let (_, first) = ctx
            .with_snapshot(None, "op-0", |snapshot| async move {
                assert_eq!(snapshot.parent, Some(Digest::zero()));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(ctx.head_snapshot().await.unwrap().digest, first.digest);

        let first_digest = first.digest.clone();
        ctx.with_snapshot(None, "op-1", move |snapshot| async move {
            assert_eq!(snapshot.parent, Some(first_digest));
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_head_advances_monotonically() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let (_, first) = ctx.with_snapshot(None, "op-0", |_| async { Ok(()) }).await.unwrap();
        assert_eq!(ctx.head_snapshot().await.unwrap().id, first.id);

        let (_, second) = ctx.with_snapshot(None, "op-1", |_| async { Ok(()) }).await.unwrap();
        assert_eq!(ctx.head_snapshot().await.unwrap().id, second.id);
        assert_eq!(ctx.committed_snapshot("op-0").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_failed_body_cleans_up() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let err = ctx
            .with_snapshot(None, "op-0", |_| async {
                Err::<(), _>(StrataError::ExecutionFailed {
                    operation: "op-0".to_string(),
                    reason: "simulated".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ExecutionFailed { .. }));

        // Nothing committed, nothing active, no head.
        assert!(ctx.head_snapshot().await.is_none());
        assert!(ctx.committed_snapshot("op-0").await.is_none());
        assert!(ctx.state.lock().await.active_snapshots.is_empty());
    }

    #[tokio::test]
    async fn test_fs_permit_serializes_with_snapshot() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let ctx = ctx.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                ctx.with_snapshot(None, &format!("op-{i}"), move |_| async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Prepared -> committed windows never overlap within one context.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mutable_state_accessors() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        ctx.set_environment_variable("PATH", "/usr/bin").await;
        let mut changes = BTreeMap::new();
        changes.insert("LANG".to_string(), "C.UTF-8".to_string());
        ctx.apply_environment_changes(&changes).await;

        let env = ctx.environment().await;
        assert_eq!(env.get("PATH").unwrap(), "/usr/bin");
        assert_eq!(env.get("LANG").unwrap(), "C.UTF-8");

        ctx.set_working_directory("/app".into()).await;
        assert_eq!(ctx.working_directory().await, "/app".into());

        ctx.set_user(Some("builder".to_string())).await;
        assert_eq!(ctx.user().await.as_deref(), Some("builder"));

        ctx.update_image_config(|config| {
            config.cmd = Some(vec!["nginx".to_string()]);
        })
        .await;
        assert_eq!(ctx.image_config().await.cmd, Some(vec!["nginx".to_string()]));
    }

    #[tokio::test]
    async fn test_adopt_requires_committed() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let prepared = Snapshot::prepared(None, dir.path().join("loose"));
        assert!(ctx.adopt_snapshot(prepared, "op-0").await.is_err());

        let (_, committed) = ctx.with_snapshot(None, "op-1", |_| async { Ok(()) }).await.unwrap();
        ctx.adopt_snapshot(committed.clone(), "op-2").await.unwrap();
        assert_eq!(ctx.head_snapshot().await.unwrap().id, committed.id);
    }

    #[tokio::test]
    async fn test_prepare_and_commit() {
        let dir = TempDir::new().unwrap();
        let ctx = context_in(&dir);

        let committed = ctx.prepare_and_commit(None, "op-base").await.unwrap();
        assert!(committed.is_committed());
        assert_eq!(ctx.head_snapshot().await.unwrap().id, committed.id);
    }
}
