//! Integration tests for the full build pipeline: graph walk, executor
//! dispatch, snapshot chaining, and cache reuse across runs.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use strata_core::cache::ContentAddressableCache;
use strata_core::diff::{Differ, EmptyDiffer};
use strata_core::executors::{
    ExecutionOutcome, ExecutorCapabilities, ExecutorKind, ExecutorSet, ImageExecutor,
    OperationExecutor,
};
use strata_core::graph::{BuildNode, FilesystemAction};
use strata_core::scheduler::build_contexts;
use strata_core::{
    BuildGraph, BuildScheduler, CacheConfig, Digest, DirectorySnapshotter, ExecutionContext,
    LocalContentStore, Operation, Platform, SchedulerConfig, Snapshotter, StrataError,
};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn exec(cmd: &str) -> Operation {
    Operation::Exec {
        command: vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()],
        env: BTreeMap::new(),
        working_directory: None,
    }
}

fn multi_stage_graph() -> Arc<BuildGraph> {
    let mut builder = BuildGraph::builder();
    builder.add_operation("builder", Operation::Image { reference: "golang:1.21".into() });
    builder.add_operation(
        "builder",
        Operation::Filesystem {
            action: FilesystemAction::Copy,
            sources: vec!["go.mod".into(), "main.go".into()],
            destination: "/src/".into(),
        },
    );
    let compile = builder.add_operation("builder", exec("go build -o /app"));
    builder.add_operation("final", Operation::Image { reference: "alpine:3.19".into() });
    builder.add_operation_with_deps(
        "final",
        Operation::Filesystem {
            action: FilesystemAction::Copy,
            sources: vec!["/app".into()],
            destination: "/usr/local/bin/".into(),
        },
        &[compile],
    );
    builder.add_operation("final", exec("app --version"));
    Arc::new(builder.build())
}

async fn fixture(
    dir: &TempDir,
    graph: &Arc<BuildGraph>,
) -> (
    std::collections::HashMap<String, Arc<ExecutionContext>>,
    Arc<ContentAddressableCache>,
) {
    let snapshotter: Arc<dyn Snapshotter> =
        Arc::new(DirectorySnapshotter::new(dir.path().join("snapshots")));
    let differ: Arc<dyn Differ> = Arc::new(EmptyDiffer);
    let contexts = build_contexts(
        graph,
        &Platform::linux_arm64(),
        &snapshotter,
        &differ,
        &dir.path().join("mounts"),
    );
    let store = Arc::new(LocalContentStore::new(dir.path().join("store")).await.unwrap());
    let mut config = CacheConfig::default();
    config.index_path = dir.path().join("index.json");
    let cache = Arc::new(ContentAddressableCache::new(config, store).unwrap());
    (contexts, cache)
}

#[tokio::test]
async fn cold_build_then_warm_rebuild() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let graph = multi_stage_graph();
    let (contexts, cache) = fixture(&dir, &graph).await;

    let scheduler = BuildScheduler::new(ExecutorSet::default(), SchedulerConfig::default());
    let cold = scheduler.execute(graph.clone(), &contexts, cache.clone()).await.unwrap();
    assert_eq!(cold.executed, 6);
    assert_eq!(cold.cache_hits, 0);

    // Heads advanced in both stages, and the final head chains back through
    // committed parents.
    let final_head = contexts["final"].head_snapshot().await.expect("final stage head");
    assert!(final_head.is_committed());
    assert!(final_head.parent.is_some());

    // Warm rebuild in fresh contexts: everything replays from the cache.
    let dir2 = TempDir::new().unwrap();
    let (contexts2, _) = fixture(&dir2, &graph).await;
    let warm = scheduler.execute(graph, &contexts2, cache).await.unwrap();
    assert_eq!(warm.executed, 6);
    assert_eq!(warm.cache_hits, 6);
}

#[tokio::test]
async fn snapshots_chain_within_a_stage() {
    let dir = TempDir::new().unwrap();
    let mut builder = BuildGraph::builder();
    builder.add_operation("default", Operation::Image { reference: "alpine:3.19".into() });
    builder.add_operation("default", exec("step one"));
    builder.add_operation("default", exec("step two"));
    let graph = Arc::new(builder.build());
    let (contexts, cache) = fixture(&dir, &graph).await;

    let scheduler = BuildScheduler::new(ExecutorSet::default(), SchedulerConfig::default());
    scheduler.execute(graph, &contexts, cache).await.unwrap();

    let ctx = &contexts["default"];
    let base = ctx.committed_snapshot("op-0").await.unwrap();
    let one = ctx.committed_snapshot("op-1").await.unwrap();
    let two = ctx.committed_snapshot("op-2").await.unwrap();

    assert_eq!(base.parent, Some(Digest::zero()));
    assert_eq!(one.parent, Some(base.digest.clone()));
    assert_eq!(two.parent, Some(one.digest.clone()));
    assert_eq!(ctx.head_snapshot().await.unwrap().digest, two.digest);
}

/// Executor that claims exec operations and always fails.
struct FailingExecutor;

#[async_trait]
impl OperationExecutor for FailingExecutor {
    fn capabilities(&self) -> ExecutorCapabilities {
        ExecutorCapabilities { kind: ExecutorKind::Exec, mutates_filesystem: true }
    }

    fn claims(&self, operation: &Operation) -> bool {
        matches!(operation, Operation::Exec { .. })
    }

    async fn execute(
        &self,
        node: &BuildNode,
        _input_digests: Vec<Digest>,
        _ctx: &ExecutionContext,
        _cache: &ContentAddressableCache,
    ) -> strata_core::Result<ExecutionOutcome> {
        Err(StrataError::ExecutionFailed {
            operation: node.operation.describe(),
            reason: "injected failure".to_string(),
        })
    }
}

fn failing_set() -> ExecutorSet {
    ExecutorSet::new(vec![
        Arc::new(ImageExecutor),
        Arc::new(strata_core::executors::FilesystemExecutor),
        Arc::new(FailingExecutor),
    ])
}

#[tokio::test]
async fn fail_fast_surfaces_first_error() {
    let dir = TempDir::new().unwrap();
    let mut builder = BuildGraph::builder();
    builder.add_operation("default", Operation::Image { reference: "alpine:3.19".into() });
    builder.add_operation("default", exec("boom"));
    builder.add_operation("default", exec("never runs"));
    let graph = Arc::new(builder.build());
    let (contexts, cache) = fixture(&dir, &graph).await;

    let scheduler = BuildScheduler::new(
        failing_set(),
        SchedulerConfig { max_concurrency: 2, fail_fast: true },
    );
    let err = scheduler.execute(graph, &contexts, cache).await.unwrap_err();
    assert!(matches!(err, StrataError::ExecutionFailed { .. }));
}

#[tokio::test]
async fn without_fail_fast_failures_are_collected() {
    let dir = TempDir::new().unwrap();
    let mut builder = BuildGraph::builder();
    builder.add_operation("default", Operation::Image { reference: "alpine:3.19".into() });
    builder.add_operation("default", exec("boom"));
    builder.add_operation("default", exec("blocked by boom"));
    let graph = Arc::new(builder.build());
    let (contexts, cache) = fixture(&dir, &graph).await;

    let scheduler = BuildScheduler::new(
        failing_set(),
        SchedulerConfig { max_concurrency: 2, fail_fast: false },
    );
    let summary = scheduler.execute(graph, &contexts, cache).await.unwrap();

    // The image loaded, the first exec failed, and its dependent never ran.
    assert_eq!(summary.executed, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, 1);
}
