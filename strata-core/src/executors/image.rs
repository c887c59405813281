//! Base-image load executor.

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

/// Default search path recorded when a base image is loaded.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Loads a base image, producing the stage's root snapshot.
///
/// The actual layer unpack is simulated; the executor produces a parentless
/// snapshot and seeds the context with the image's environment.
pub struct ImageExecutor;

#[async_trait]
impl OperationExecutor for ImageExecutor {
    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities { kind: ExecutorKind::Image, mutates_filesystem: true }
    }

    fn claims(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Image { .. })
    }

    #[instrument(skip_all, fields(node = node.id))]
    async fn execute(
        &self,
        node: &BuildNode,
        input_digests: Vec<Digest>,
        ctx: &ExecutionContext,
        cache: &ContentAddressableCache,
    ) -> Result<ExecutionOutcome> {
        let Operation::Image { reference } = &node.operation else {
            return Err(crate::error::StrataError::UnsupportedOperation {
                operation: node.operation.describe(),
            });
        };

        let key = cache_key_for(node, input_digests, ctx);
        if let Some(cached) = cache.get(&key, node.operation.type_name()).await? {
            return replay_cached(cached, node, ctx).await;
        }

        debug!(reference = %reference, "loading base image");
        let mut environment_changes = BTreeMap::new();
        environment_changes.insert("PATH".to_string(), DEFAULT_PATH.to_string());
        let mut metadata_changes = BTreeMap::new();
        metadata_changes.insert("image.reference".to_string(), reference.clone());

        let op_id = operation_id(node);
        let snapshot = match ctx.prepare_and_commit(None, &op_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(execution_failure(node, ctx, &[], e).await),
        };

        ctx.apply_environment_changes(&environment_changes).await;
        ctx.apply_metadata_changes(&metadata_changes).await;

        store_result(&snapshot, environment_changes, metadata_changes, &key, node, cache).await;
        Ok(ExecutionOutcome { snapshot, cache_hit: false })
    }
}
