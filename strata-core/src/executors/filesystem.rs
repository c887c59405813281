//! Filesystem operation executor (COPY/ADD-style mutations).

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::cache::ContentAddressableCache;
use crate::context::ExecutionContext;
use crate::digest::Digest;
use crate::error::Result;
use crate::executors::{
    cache_key_for, execution_failure, operation_id, replay_cached, store_result,
    ExecutionOutcome, ExecutorCapabilities, ExecutorKind, OperationExecutor,
};
use crate::graph::{BuildNode, Operation};

/// Applies COPY/ADD-style mutations over a prepared mountpoint.
///
/// The actual file transfer is simulated; the executor exercises the full
/// snapshot prepare/commit sequence and records what would have been copied.
pub struct FilesystemExecutor;

#[async_trait]
impl OperationExecutor for FilesystemExecutor {
    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities { kind: ExecutorKind::Filesystem, mutates_filesystem: true }
    }

    fn claims(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Filesystem { .. })
    }

    #[instrument(skip_all, fields(node = node.id))]
    async fn execute(
        &self,
        node: &BuildNode,
        input_digests: Vec<Digest>,
        ctx: &ExecutionContext,
        cache: &ContentAddressableCache,
    ) -> Result<ExecutionOutcome> {
        let Operation::Filesystem { action, sources, destination } = &node.operation else {
            return Err(crate::error::StrataError::UnsupportedOperation {
                operation: node.operation.describe(),
            });
        };

        let key = cache_key_for(node, input_digests, ctx);
        if let Some(cached) = cache.get(&key, node.operation.type_name()).await? {
            return replay_cached(cached, node, ctx).await;
        }

        let op_id = operation_id(node);
        let action = *action;
        let body_sources = sources.clone();
        let body_destination = destination.clone();

        let executed = ctx
            .with_snapshot(None, &op_id, |snapshot| async move {
                let Some(mountpoint) = snapshot.mountpoint().cloned() else {
                    return Err(crate::error::StrataError::InvalidState {
                        reason: format!("snapshot {} has no mountpoint", snapshot.id),
                    });
                };
                for source in &body_sources {
                    debug!(
                        action = action.as_str(),
                        source = %source,
                        target = %body_destination.join_under(&mountpoint).display(),
                        "would transfer"
                    );
                }
                Ok(body_sources.len())
            })
            .await;

        let (transferred, snapshot) = match executed {
            Ok(output) => output,
            Err(e) => return Err(execution_failure(node, ctx, &[], e).await),
        };

        let mut metadata_changes = BTreeMap::new();
        metadata_changes.insert("filesystem.action".to_string(), action.as_str().to_string());
        metadata_changes.insert("filesystem.destination".to_string(), destination.to_string());
        metadata_changes.insert("filesystem.sources".to_string(), transferred.to_string());

        ctx.apply_metadata_changes(&metadata_changes).await;
        store_result(&snapshot, BTreeMap::new(), metadata_changes, &key, node, cache).await;
        Ok(ExecutionOutcome { snapshot, cache_hit: false })
    }
}
