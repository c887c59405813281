//! Strata build core.
//!
//! The native container-image build core: executes a directed acyclic build
//! graph, maintains ordered filesystem snapshots between operations, computes
//! canonical content-addressed identifiers over filesystem deltas, and caches
//! operation results so repeated builds reuse prior work.

pub mod cache;
pub mod config;
pub mod context;
pub mod diff;
pub mod digest;
pub mod error;
pub mod executors;
pub mod graph;
pub mod path;
pub mod platform;
pub mod scheduler;
pub mod snapshots;
pub mod store;

// Re-export commonly used items
pub use cache::{CacheKey, CachedResult, ContentAddressableCache};
pub use config::{CacheConfig, EvictionPolicy};
pub use context::{ExecutionContext, ImageConfig};
pub use diff::{Diff, DiffKey, DiffKeyComputer, Differ, NodeKind};
pub use digest::Digest;
pub use error::{Result, StrataError};
pub use executors::{ExecutorSet, OperationExecutor};
pub use graph::{BuildGraph, BuildNode, Operation};
pub use path::BinaryPath;
pub use platform::Platform;
pub use scheduler::{BuildScheduler, BuildSummary, SchedulerConfig};
pub use snapshots::{DirectorySnapshotter, Snapshot, SnapshotState, Snapshotter};
pub use store::{ContentStore, ContentWriter, Descriptor, LocalContentStore};
