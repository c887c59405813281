//! Operation executors.
//!
//! Each executor claims one operation kind. The common shape: query the
//! cache with a key derived from the operation and its input digests, replay
//! the cached deltas on a hit, and otherwise run the operation inside a
//! `with_snapshot` scope and store the result. Cache failures never break a
//! build.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::cache::{CacheKey, CachedResult, ContentAddressableCache};
use crate::context::ExecutionContext;
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::graph::{BuildNode, Operation};
use crate::snapshots::Snapshot;

pub mod exec;
pub mod filesystem;
pub mod image;

pub use exec::ExecExecutor;
pub use filesystem::FilesystemExecutor;
pub use image::ImageExecutor;

/// Executor kinds, one per operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Image,
    Filesystem,
    Exec,
}

/// What an executor is capable of; the scheduler selects by tag.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorCapabilities {
    pub kind: ExecutorKind,
    /// Whether executing mutates the stage filesystem (and therefore needs
    /// the context's FS permit via `with_snapshot`).
    pub mutates_filesystem: bool,
}

/// Result of executing one build node.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The committed (or cache-replayed) snapshot.
    pub snapshot: Snapshot,
    /// Whether the result came from the cache.
    pub cache_hit: bool,
}

/// A build-operation executor.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn capabilities(&self) -> ExecutorCapabilities;

    /// Whether this executor handles the operation.
    fn claims(&self, operation: &Operation) -> bool;

    /// Execute one node: cache lookup, then the operation-specific body on a
    /// miss.
    async fn execute(
        &self,
        node: &BuildNode,
        input_digests: Vec<Digest>,
        ctx: &ExecutionContext,
        cache: &ContentAddressableCache,
    ) -> Result<ExecutionOutcome>;
}

/// The set of registered executors, selected by operation tag.
pub struct ExecutorSet {
    executors: Vec<Arc<dyn OperationExecutor>>,
}

impl ExecutorSet {
    #[must_use]
    pub fn new(executors: Vec<Arc<dyn OperationExecutor>>) -> Self {
        Self { executors }
    }

    /// The executor claiming this operation.
    pub fn select(&self, operation: &Operation) -> Result<Arc<dyn OperationExecutor>> {
        self.executors
            .iter()
            .find(|e| e.claims(operation))
            .cloned()
            .ok_or_else(|| StrataError::UnsupportedOperation {
                operation: operation.describe(),
            })
    }
}

impl Default for ExecutorSet {
    fn default() -> Self {
        Self::new(vec![
            Arc::new(ImageExecutor),
            Arc::new(FilesystemExecutor),
            Arc::new(ExecExecutor),
        ])
    }
}

/// Cache key for a node: operation content digest + input digests +
/// platform.
#[must_use]
pub fn cache_key_for(node: &BuildNode, input_digests: Vec<Digest>, ctx: &ExecutionContext) -> CacheKey {
    CacheKey::new(node.operation.content_digest(), input_digests, ctx.platform().clone())
}

/// Replay a cached result onto the context: apply the environment and
/// metadata deltas and promote the cached snapshot as the new head.
pub async fn replay_cached(
    result: CachedResult,
    node: &BuildNode,
    ctx: &ExecutionContext,
) -> Result<ExecutionOutcome> {
    ctx.apply_environment_changes(&result.environment_changes).await;
    ctx.apply_metadata_changes(&result.metadata_changes).await;
    ctx.adopt_snapshot(result.snapshot.clone(), &operation_id(node)).await?;
    info!(operation = %node.operation.describe(), "replayed cached result");
    Ok(ExecutionOutcome { snapshot: result.snapshot, cache_hit: true })
}

/// Store a freshly executed result. Put failures are swallowed by the cache.
pub async fn store_result(
    snapshot: &Snapshot,
    environment_changes: BTreeMap<String, String>,
    metadata_changes: BTreeMap<String, String>,
    key: &CacheKey,
    node: &BuildNode,
    cache: &ContentAddressableCache,
) {
    let result = CachedResult {
        snapshot: snapshot.clone(),
        environment_changes,
        metadata_changes,
    };
    cache.put(&result, key, node.operation.type_name()).await;
}

/// Identifier under which a node's snapshots are tracked in its context.
#[must_use]
pub fn operation_id(node: &BuildNode) -> String {
    format!("op-{}", node.id)
}

/// Wrap an execution error with diagnostics: the environment snapshot, the
/// working directory, and recent output lines.
pub async fn execution_failure(
    node: &BuildNode,
    ctx: &ExecutionContext,
    recent_output: &[String],
    source: StrataError,
) -> StrataError {
    let environment = ctx.environment().await;
    let working_directory = ctx.working_directory().await;
    StrataError::ExecutionFailed {
        operation: node.operation.describe(),
        reason: format!(
            "{source} (env: {environment:?}, cwd: {working_directory}, recent output: {recent_output:?})"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FilesystemAction;

    #[test]
    fn test_executor_set_selects_by_tag() {
        let set = ExecutorSet::default();

        let image = Operation::Image { reference: "alpine:3.19".into() };
        assert_eq!(set.select(&image).unwrap().capabilities().kind, ExecutorKind::Image);

        let filesystem = Operation::Filesystem {
            action: FilesystemAction::Copy,
            sources: vec!["a".into()],
            destination: "/b".into(),
        };
        assert_eq!(
            set.select(&filesystem).unwrap().capabilities().kind,
            ExecutorKind::Filesystem
        );

        let exec = Operation::Exec {
            command: vec!["true".into()],
            env: BTreeMap::new(),
            working_directory: None,
        };
        assert_eq!(set.select(&exec).unwrap().capabilities().kind, ExecutorKind::Exec);
    }

    #[test]
    fn test_empty_set_rejects() {
        let set = ExecutorSet::new(Vec::new());
        let op = Operation::Image { reference: "r".into() };
        match set.select(&op) {
            Err(err) => assert!(matches!(err, StrataError::UnsupportedOperation { .. })),
            Ok(_) => panic!("expected an error"),
        }
    }
}
