//! Filesystem diff model.
//!
//! A diff record describes one entry that differs between two snapshots.
//! Record sets feed the canonical diff-key computation in [`key`] and are
//! produced by a [`Differ`] when a snapshot commits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::path::BinaryPath;

pub mod content;
pub mod key;

pub use content::{ContentComparison, ContentHasher, FileContentDiffer};
pub use key::{DiffKey, DiffKeyComputer};

/// Filesystem node type of a diff entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Regular,
    Directory,
    Symlink,
    Device,
    Fifo,
    Socket,
}

impl NodeKind {
    /// Canonical spelling used in the diff-key record encoding.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "reg",
            Self::Directory => "dir",
            Self::Symlink => "sym",
            Self::Device => "dev",
            Self::Fifo => "fifo",
            Self::Socket => "sock",
        }
    }

    /// Node kinds excluded from diff-key hashing.
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        matches!(self, Self::Socket | Self::Device)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What changed about a modified entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    MetadataOnly,
    ContentChanged,
    TypeChanged,
    SymlinkTargetChanged,
}

impl ChangeKind {
    /// Canonical spelling used in the diff-key record encoding.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataOnly => "meta",
            Self::ContentChanged => "content",
            Self::TypeChanged => "type",
            Self::SymlinkTargetChanged => "symlink",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stat-derived attributes attached to added and modified entries.
///
/// Every field is optional; absent scalars encode as `"-"` in the canonical
/// record. Extended attributes are keyed by a map that iterates in key order,
/// matching the sorted xattr hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffAttributes {
    pub permissions: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub link_target: Option<BinaryPath>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub xattrs: Option<BTreeMap<String, Vec<u8>>>,
    pub dev_major: Option<u32>,
    pub dev_minor: Option<u32>,
    pub nlink: Option<u32>,
}

impl DiffAttributes {
    #[must_use]
    pub fn with_permissions(permissions: u32) -> Self {
        Self { permissions: Some(permissions), ..Default::default() }
    }
}

/// One entry describing an addition, modification, or deletion between two
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "lowercase")]
pub enum Diff {
    Added { path: BinaryPath, node: NodeKind, attributes: DiffAttributes },
    Modified { path: BinaryPath, kind: ChangeKind, node: NodeKind, attributes: DiffAttributes },
    Deleted { path: BinaryPath },
}

impl Diff {
    #[must_use]
    pub fn path(&self) -> &BinaryPath {
        match self {
            Self::Added { path, .. } | Self::Modified { path, .. } | Self::Deleted { path } => path,
        }
    }

    /// Convenience constructor for an added entry.
    #[must_use]
    pub fn added(path: impl Into<BinaryPath>, node: NodeKind, attributes: DiffAttributes) -> Self {
        Self::Added { path: path.into(), node, attributes }
    }

    /// Convenience constructor for a deleted entry.
    #[must_use]
    pub fn deleted(path: impl Into<BinaryPath>) -> Self {
        Self::Deleted { path: path.into() }
    }
}

/// Produces the diff records between a parent and a child snapshot mount.
///
/// The build core stubs real filesystem side effects, so the record stream
/// comes from a producer rather than a built-in scanner; executors and tests
/// supply implementations.
#[async_trait]
pub trait Differ: Send + Sync {
    async fn diff(&self, base: Option<&Path>, target: &Path) -> Result<Vec<Diff>>;
}

/// Differ that reports no changes. Used by executors whose side effects are
/// simulated.
#[derive(Debug, Default)]
pub struct EmptyDiffer;

#[async_trait]
impl Differ for EmptyDiffer {
    async fn diff(&self, _base: Option<&Path>, _target: &Path) -> Result<Vec<Diff>> {
        Ok(Vec::new())
    }
}

/// Differ that replays a fixed record set, regardless of the mounts.
#[derive(Debug, Default)]
pub struct StaticDiffer {
    records: Vec<Diff>,
}

impl StaticDiffer {
    #[must_use]
    pub fn new(records: Vec<Diff>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl Differ for StaticDiffer {
    async fn diff(&self, _base: Option<&Path>, _target: &Path) -> Result<Vec<Diff>> {
        Ok(self.records.clone())
    }
}
