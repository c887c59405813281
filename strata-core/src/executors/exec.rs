//! Command execution executor (RUN-style operations).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::cache::ContentAddressableCache;
use crate::context::ExecutionContext;
use crate::digest::Digest;
use crate::error::Result;
use crate::executors::{
    cache_key_for, execution_failure, operation_id, replay_cached, store_result,
    ExecutionOutcome, ExecutorCapabilities, ExecutorKind, OperationExecutor,
};
use crate::graph::{BuildNode, Operation};

/// Timeout applied when joining the command's output stream.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Runs RUN-style commands inside a prepared snapshot.
///
/// Process spawning is simulated; the executor still drives the real output
/// plumbing so the drain path and its timeout behave as in production.
pub struct ExecExecutor;

/// Drain output lines until the stream closes, bounding each read by the
/// drain timeout.
pub async fn drain_output(mut rx: mpsc::Receiver<String>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, rx.recv()).await {
            Ok(Some(line)) => lines.push(line),
            Ok(None) => break,
            Err(_) => {
                warn!("timed out draining command output");
                break;
            }
        }
    }
    lines
}

#[async_trait]
impl OperationExecutor for ExecExecutor {
    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities { kind: ExecutorKind::Exec, mutates_filesystem: true }
    }

    fn claims(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Exec { .. })
    }

    #[instrument(skip_all, fields(node = node.id))]
    async fn execute(
        &self,
        node: &BuildNode,
        input_digests: Vec<Digest>,
        ctx: &ExecutionContext,
        cache: &ContentAddressableCache,
    ) -> Result<ExecutionOutcome> {
        let Operation::Exec { command, env, working_directory } = &node.operation else {
            return Err(crate::error::StrataError::UnsupportedOperation {
                operation: node.operation.describe(),
            });
        };

        let key = cache_key_for(node, input_digests, ctx);
        if let Some(cached) = cache.get(&key, node.operation.type_name()).await? {
            return replay_cached(cached, node, ctx).await;
        }

        if let Some(dir) = working_directory {
            ctx.set_working_directory(dir.clone()).await;
        }

        let rendered = command.join(" ");
        let body_rendered = rendered.clone();
        let executed = ctx
            .with_snapshot(None, &operation_id(node), |_snapshot| async move {
                // Simulated process: the command's stdout is fed through a
                // channel and drained like a real pipe.
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    let _ = tx.send(format!("+ {body_rendered}")).await;
                    let _ = tx.send("exit 0".to_string()).await;
                });
                let lines = drain_output(rx).await;
                debug!(lines = lines.len(), "command output drained");
                Ok(lines)
            })
            .await;

        let (output, snapshot) = match executed {
            Ok(output) => output,
            Err(e) => return Err(execution_failure(node, ctx, &[], e).await),
        };

        let environment_changes = env.clone();
        let mut metadata_changes = BTreeMap::new();
        metadata_changes.insert("exec.command".to_string(), rendered);
        metadata_changes.insert("exec.exit_code".to_string(), "0".to_string());
        metadata_changes.insert("exec.output_lines".to_string(), output.len().to_string());

        ctx.apply_environment_changes(&environment_changes).await;
        ctx.apply_metadata_changes(&metadata_changes).await;
        store_result(&snapshot, environment_changes, metadata_changes, &key, node, cache).await;
        Ok(ExecutionOutcome { snapshot, cache_hit: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::diff::EmptyDiffer;
    use crate::graph::BuildGraph;
    use crate::platform::Platform;
    use crate::snapshots::DirectorySnapshotter;
    use crate::store::LocalContentStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_drain_collects_until_close() {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            tx.send("one".to_string()).await.unwrap();
            tx.send("two".to_string()).await.unwrap();
        });
        let lines = drain_output(rx).await;
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_on_stalled_stream() {
        let (tx, rx) = mpsc::channel::<String>(1);
        // Keep the sender alive so the stream never closes.
        let drain = tokio::spawn(drain_output(rx));
        tokio::time::advance(OUTPUT_DRAIN_TIMEOUT + Duration::from_millis(1)).await;
        let lines = drain.await.unwrap();
        assert!(lines.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_execute_applies_env_and_caches() {
        let dir = TempDir::new().unwrap();

        let mut env = BTreeMap::new();
        env.insert("BUILD_MODE".to_string(), "release".to_string());
        let mut builder = BuildGraph::builder();
        builder.add_operation(
            "default",
            Operation::Exec {
                command: vec!["make".to_string(), "install".to_string()],
                env,
                working_directory: Some("/src".into()),
            },
        );
        let graph = builder.build();
        let node = graph.get_node(0).unwrap().clone();

        let ctx = Arc::new(ExecutionContext::new(
            "default",
            Arc::new(graph),
            Platform::linux_arm64(),
            Arc::new(DirectorySnapshotter::new(dir.path().join("snapshots"))),
            Arc::new(EmptyDiffer),
            dir.path().join("mounts"),
        ));
        let store = Arc::new(LocalContentStore::new(dir.path().join("store")).await.unwrap());
        let mut config = CacheConfig::default();
        config.index_path = dir.path().join("index.json");
        let cache = ContentAddressableCache::new(config, store).unwrap();

        let outcome = ExecExecutor.execute(&node, vec![], &ctx, &cache).await.unwrap();
        assert!(!outcome.cache_hit);
        assert_eq!(ctx.environment().await.get("BUILD_MODE").map(String::as_str), Some("release"));
        assert_eq!(ctx.working_directory().await, "/src".into());

        let replay = ExecExecutor.execute(&node, vec![], &ctx, &cache).await.unwrap();
        assert!(replay.cache_hit);
        assert_eq!(replay.snapshot.digest, outcome.snapshot.digest);
    }
}
