//! Build scheduler.
//!
//! Walks the build graph in dependency order, dispatching each node to the
//! executor that claims it. Independent nodes run concurrently up to the
//! configured limit; nodes sharing a stage still serialize on their
//! context's FS permit.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::cache::ContentAddressableCache;
use crate::context::ExecutionContext;
use crate::diff::Differ;
use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::executors::{ExecutionOutcome, ExecutorSet};
use crate::graph::BuildGraph;
use crate::platform::Platform;
use crate::snapshots::Snapshotter;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum operations in flight at once.
    pub max_concurrency: usize,
    /// Cancel remaining work on the first failure.
    pub fail_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 4, fail_fast: true }
    }
}

/// Outcome of a build run.
#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Nodes that completed (including cache replays).
    pub executed: usize,
    /// Nodes served from the cache.
    pub cache_hits: usize,
    /// Failed nodes with their error messages. Empty under fail-fast, which
    /// surfaces the first failure as an error instead.
    pub failed: Vec<(usize, String)>,
}

/// One execution context per stage in the graph.
pub fn build_contexts(
    graph: &Arc<BuildGraph>,
    platform: &Platform,
    snapshotter: &Arc<dyn Snapshotter>,
    differ: &Arc<dyn Differ>,
    mounts_root: &Path,
) -> HashMap<String, Arc<ExecutionContext>> {
    graph
        .stages()
        .into_iter()
        .map(|stage| {
            let ctx = Arc::new(ExecutionContext::new(
                stage.clone(),
                graph.clone(),
                platform.clone(),
                snapshotter.clone(),
                differ.clone(),
                mounts_root.join(&stage),
            ));
            (stage, ctx)
        })
        .collect()
}

/// Dependency-order graph walker.
pub struct BuildScheduler {
    executors: ExecutorSet,
    config: SchedulerConfig,
}

impl BuildScheduler {
    #[must_use]
    pub fn new(executors: ExecutorSet, config: SchedulerConfig) -> Self {
        Self { executors, config }
    }

    /// Execute the whole graph.
    ///
    /// Under fail-fast, the first failure aborts the remaining work and
    /// propagates. Otherwise failed nodes are collected in the summary and
    /// their dependents are left unexecuted.
    #[instrument(skip_all, fields(nodes = graph.len()))]
    pub async fn execute(
        &self,
        graph: Arc<BuildGraph>,
        contexts: &HashMap<String, Arc<ExecutionContext>>,
        cache: Arc<ContentAddressableCache>,
    ) -> Result<BuildSummary> {
        // Surfaces cycles before any work starts.
        graph.topological_sort()?;

        let mut in_degree: HashMap<usize, usize> =
            graph.nodes().iter().map(|n| (n.id, graph.dependencies(n.id).len())).collect();
        let mut ready: VecDeque<usize> = graph
            .nodes()
            .iter()
            .filter(|n| in_degree[&n.id] == 0)
            .map(|n| n.id)
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set: JoinSet<(usize, Result<ExecutionOutcome>)> = JoinSet::new();
        let mut results: HashMap<usize, Digest> = HashMap::new();
        let mut summary = BuildSummary::default();
        let mut remaining = graph.len();

        info!(concurrency = self.config.max_concurrency, "starting build");

        while remaining > 0 {
            while let Some(id) = ready.pop_front() {
                let node = graph.get_node(id).expect("ready ids come from the graph").clone();
                let ctx = contexts.get(&node.stage).cloned().ok_or_else(|| {
                    StrataError::NotFound { resource: "execution context", id: node.stage.clone() }
                })?;
                let executor = self.executors.select(&node.operation)?;
                let inputs: Vec<Digest> = graph
                    .dependencies(id)
                    .iter()
                    .filter_map(|dep| results.get(dep).cloned())
                    .collect();
                let cache = cache.clone();
                let semaphore = semaphore.clone();

                debug!(node = id, operation = %node.operation.describe(), "dispatching");
                join_set.spawn(async move {
                    let _permit =
                        semaphore.acquire_owned().await.expect("scheduler semaphore stays open");
                    let outcome = executor.execute(&node, inputs, &ctx, &cache).await;
                    (node.id, outcome)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                // Nothing in flight but nodes remain: their dependencies
                // failed, so they can never become ready.
                break;
            };
            remaining -= 1;

            let (id, outcome) = joined.map_err(|e| StrataError::ExecutionFailed {
                operation: "scheduler".to_string(),
                reason: format!("worker task failed: {e}"),
            })?;

            match outcome {
                Ok(outcome) => {
                    summary.executed += 1;
                    if outcome.cache_hit {
                        summary.cache_hits += 1;
                    }
                    results.insert(id, outcome.snapshot.digest.clone());
                    for &dependent in graph.dependents(id) {
                        let degree =
                            in_degree.get_mut(&dependent).expect("dependent is a graph node");
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
                Err(e) => {
                    if self.config.fail_fast {
                        warn!(node = id, error = %e, "operation failed, cancelling build");
                        join_set.abort_all();
                        return Err(e);
                    }
                    warn!(node = id, error = %e, "operation failed, continuing");
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            executed = summary.executed,
            cache_hits = summary.cache_hits,
            failed = summary.failed.len(),
            "build finished"
        );
        Ok(summary)
    }
}
