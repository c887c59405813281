//! Build graph and intermediate representation.
//!
//! A build is a DAG of operations walked in dependency order. Nodes within a
//! stage chain sequentially; cross-stage edges come from explicit
//! dependencies (a copy out of another stage's result, for instance).

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::digest::Digest;
use crate::error::{Result, StrataError};
use crate::path::BinaryPath;

/// Filesystem operation flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemAction {
    Copy,
    Add,
}

impl FilesystemAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Add => "add",
        }
    }
}

/// One build operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Load a base image, producing a parentless snapshot.
    Image { reference: String },
    /// COPY/ADD-style mutation over a prepared mountpoint.
    Filesystem {
        action: FilesystemAction,
        sources: Vec<BinaryPath>,
        destination: BinaryPath,
    },
    /// RUN-style command execution.
    Exec {
        command: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_directory: Option<BinaryPath>,
    },
}

impl Operation {
    /// Operation type name, stable across releases.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Image { .. } => "image",
            Self::Filesystem { .. } => "filesystem",
            Self::Exec { .. } => "exec",
        }
    }

    /// Content digest over the canonical operation encoding.
    ///
    /// Fields are length-prefixed so that no two distinct operations share an
    /// encoding; env maps iterate in key order.
    #[must_use]
    pub fn content_digest(&self) -> Digest {
        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u32).to_be_bytes());
            hasher.update(bytes);
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, self.type_name().as_bytes());
        match self {
            Self::Image { reference } => field(&mut hasher, reference.as_bytes()),
            Self::Filesystem { action, sources, destination } => {
                field(&mut hasher, action.as_str().as_bytes());
                for source in sources {
                    field(&mut hasher, source.as_bytes());
                }
                field(&mut hasher, destination.as_bytes());
            }
            Self::Exec { command, env, working_directory } => {
                for arg in command {
                    field(&mut hasher, arg.as_bytes());
                }
                for (key, value) in env {
                    field(&mut hasher, key.as_bytes());
                    field(&mut hasher, value.as_bytes());
                }
                match working_directory {
                    Some(dir) => field(&mut hasher, dir.as_bytes()),
                    None => field(&mut hasher, b"-"),
                }
            }
        }
        Digest::from(&hasher.finalize().into())
    }

    /// Short human-readable form for logs and diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Image { reference } => format!("image {reference}"),
            Self::Filesystem { action, destination, .. } => {
                format!("{} -> {destination}", action.as_str())
            }
            Self::Exec { command, .. } => format!("exec {}", command.join(" ")),
        }
    }
}

/// A single node in the build graph.
#[derive(Debug, Clone)]
pub struct BuildNode {
    /// Unique node id.
    pub id: usize,
    /// Stage the node executes in.
    pub stage: String,
    /// The operation to execute.
    pub operation: Operation,
    /// Previous node in the same stage, for sequential chaining.
    pub parent: Option<usize>,
}

/// A directed acyclic graph of build operations.
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
    /// All nodes, indexed by id.
    nodes: Vec<BuildNode>,
    /// Adjacency list: node id -> dependent node ids.
    edges: HashMap<usize, Vec<usize>>,
}

impl BuildGraph {
    #[must_use]
    pub fn builder() -> BuildGraphBuilder {
        BuildGraphBuilder::default()
    }

    #[must_use]
    pub fn get_node(&self, id: usize) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn nodes(&self) -> &[BuildNode] {
        &self.nodes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids this node depends on.
    #[must_use]
    pub fn dependencies(&self, id: usize) -> Vec<usize> {
        let mut deps: Vec<usize> = self
            .edges
            .iter()
            .filter(|(_, targets)| targets.contains(&id))
            .map(|(&from, _)| from)
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Node ids depending on this node.
    #[must_use]
    pub fn dependents(&self, id: usize) -> &[usize] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The distinct stages in the graph.
    #[must_use]
    pub fn stages(&self) -> BTreeSet<String> {
        self.nodes.iter().map(|n| n.stage.clone()).collect()
    }

    /// Nodes in execution order, via Kahn's algorithm.
    ///
    /// A cycle is an illegal graph and fails with `InvalidState`.
    pub fn topological_sort(&self) -> Result<Vec<usize>> {
        let mut in_degree: HashMap<usize, usize> =
            self.nodes.iter().map(|n| (n.id, 0)).collect();
        for targets in self.edges.values() {
            for &target in targets {
                *in_degree.entry(target).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<usize> = self
            .nodes
            .iter()
            .filter(|n| in_degree[&n.id] == 0)
            .map(|n| n.id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(targets) = self.edges.get(&id) {
                for &target in targets {
                    let degree = in_degree.get_mut(&target).expect("edge target is a node");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(target);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<usize> = self
                .nodes
                .iter()
                .map(|n| n.id)
                .filter(|id| !order.contains(id))
                .collect();
            return Err(StrataError::InvalidState {
                reason: format!("build graph has a dependency cycle through nodes {stuck:?}"),
            });
        }
        Ok(order)
    }
}

/// Incremental builder for [`BuildGraph`].
#[derive(Debug, Default)]
pub struct BuildGraphBuilder {
    nodes: Vec<BuildNode>,
    edges: HashMap<usize, Vec<usize>>,
    /// Stage name -> last node added in that stage.
    stage_tails: HashMap<String, usize>,
}

impl BuildGraphBuilder {
    /// Append an operation to a stage, chaining after the stage's previous
    /// node. Returns the new node id.
    pub fn add_operation(&mut self, stage: &str, operation: Operation) -> usize {
        self.add_operation_with_deps(stage, operation, &[])
    }

    /// Append an operation with explicit extra dependencies (cross-stage
    /// edges).
    pub fn add_operation_with_deps(
        &mut self,
        stage: &str,
        operation: Operation,
        deps: &[usize],
    ) -> usize {
        let id = self.nodes.len();
        let parent = self.stage_tails.get(stage).copied();

        if let Some(parent) = parent {
            self.edges.entry(parent).or_default().push(id);
        }
        for &dep in deps {
            if Some(dep) != parent {
                self.edges.entry(dep).or_default().push(id);
            }
        }

        self.nodes.push(BuildNode { id, stage: stage.to_string(), operation, parent });
        self.stage_tails.insert(stage.to_string(), id);
        id
    }

    /// Add an explicit edge between existing nodes.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.edges.entry(from).or_default().push(to);
    }

    #[must_use]
    pub fn build(self) -> BuildGraph {
        BuildGraph { nodes: self.nodes, edges: self.edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(cmd: &str) -> Operation {
        Operation::Exec {
            command: vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()],
            env: BTreeMap::new(),
            working_directory: None,
        }
    }

    fn simple_graph() -> BuildGraph {
        let mut builder = BuildGraph::builder();
        builder.add_operation("default", Operation::Image { reference: "alpine:3.19".into() });
        builder.add_operation("default", exec("apk add nginx"));
        builder.add_operation(
            "default",
            Operation::Filesystem {
                action: FilesystemAction::Copy,
                sources: vec!["config.conf".into()],
                destination: "/etc/nginx/".into(),
            },
        );
        builder.build()
    }

    #[test]
    fn test_sequential_chaining() {
        let graph = simple_graph();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get_node(0).unwrap().parent, None);
        assert_eq!(graph.get_node(1).unwrap().parent, Some(0));
        assert_eq!(graph.get_node(2).unwrap().parent, Some(1));

        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_cross_stage_dependency() {
        let mut builder = BuildGraph::builder();
        let base = builder.add_operation("builder", Operation::Image { reference: "golang:1.21".into() });
        let compile = builder.add_operation("builder", exec("go build -o app"));
        builder.add_operation("final", Operation::Image { reference: "alpine:3.19".into() });
        let copy = builder.add_operation_with_deps(
            "final",
            Operation::Filesystem {
                action: FilesystemAction::Copy,
                sources: vec!["/app".into()],
                destination: "/usr/local/bin/".into(),
            },
            &[compile],
        );
        let graph = builder.build();

        let order = graph.topological_sort().unwrap();
        let position = |id: usize| order.iter().position(|&n| n == id).unwrap();
        assert!(position(compile) > position(base));
        assert!(position(copy) > position(compile));

        assert_eq!(graph.stages().len(), 2);
        assert!(graph.dependencies(copy).contains(&compile));
    }

    #[test]
    fn test_cycle_detected() {
        let mut builder = BuildGraph::builder();
        let a = builder.add_operation("default", exec("a"));
        let b = builder.add_operation("default", exec("b"));
        builder.add_edge(b, a);
        let graph = builder.build();

        let err = graph.topological_sort().unwrap_err();
        assert!(matches!(err, StrataError::InvalidState { .. }));
    }

    #[test]
    fn test_content_digest_distinguishes_operations() {
        let run_nginx = exec("apk add nginx");
        let run_curl = exec("apk add curl");
        assert_ne!(run_nginx.content_digest(), run_curl.content_digest());
        assert_eq!(run_nginx.content_digest(), exec("apk add nginx").content_digest());

        // Field boundaries matter: ["ab"] != ["a", "b"].
        let joined = Operation::Exec {
            command: vec!["ab".to_string()],
            env: BTreeMap::new(),
            working_directory: None,
        };
        let split = Operation::Exec {
            command: vec!["a".to_string(), "b".to_string()],
            env: BTreeMap::new(),
            working_directory: None,
        };
        assert_ne!(joined.content_digest(), split.content_digest());
    }

    #[test]
    fn test_content_digest_env_order_independent() {
        let mut env_a = BTreeMap::new();
        env_a.insert("A".to_string(), "1".to_string());
        env_a.insert("B".to_string(), "2".to_string());
        let mut env_b = BTreeMap::new();
        env_b.insert("B".to_string(), "2".to_string());
        env_b.insert("A".to_string(), "1".to_string());

        let one = Operation::Exec { command: vec!["x".into()], env: env_a, working_directory: None };
        let two = Operation::Exec { command: vec!["x".into()], env: env_b, working_directory: None };
        assert_eq!(one.content_digest(), two.content_digest());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(Operation::Image { reference: "r".into() }.type_name(), "image");
        assert_eq!(exec("x").type_name(), "exec");
    }
}
