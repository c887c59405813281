//! Canonical diff keys.
//!
//! A [`DiffKey`] is a deterministic content-addressed identifier for the
//! delta between two snapshots. The computation is reproducible
//! byte-for-byte: records are encoded with length-prefixed fields, sorted by
//! their raw bytes, folded through a Merkle tree, and domain-separated by the
//! base lineage. Input order, scheduler interleaving, and clock never affect
//! the result.

use data_encoding::HEXLOWER;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::diff::content::ContentHasher;
use crate::diff::{ChangeKind, Diff, DiffAttributes, NodeKind};
use crate::digest::{Digest, DIGEST_LEN};
use crate::error::{Result, StrataError};

/// Record encoding version byte.
const RECORD_VERSION: u8 = 0x01;

/// Record tag bytes.
const TAG_ADDED: u8 = 0x41; // 'A'
const TAG_MODIFIED: u8 = 0x4D; // 'M'
const TAG_DELETED: u8 = 0x44; // 'D'

/// Merkle domain-separation prefixes.
const LEAF_PREFIX: u8 = 0x4C; // 'L'
const EMPTY_PREFIX: u8 = 0x45; // 'E'
const INNER_PREFIX: u8 = 0x49; // 'I'

/// Marker for absent scalar fields.
const MISSING: &[u8] = b"-";

/// Canonical SHA-256 identifier for a sorted set of diff records,
/// domain-separated by base lineage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiffKey([u8; DIGEST_LEN]);

impl DiffKey {
    /// The raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Canonical on-wire form, `"sha256:<64-hex>"` lowercase.
    #[must_use]
    pub fn string_value(&self) -> String {
        format!("sha256:{}", HEXLOWER.encode(&self.0))
    }

    /// Parse the canonical on-wire form.
    ///
    /// Accepts only strings beginning with `"sha256:"` followed by exactly 64
    /// lowercase hex characters.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.strip_prefix("sha256:").ok_or_else(|| StrataError::InvalidFormat {
            reason: format!("diff key {s:?} does not start with \"sha256:\""),
        })?;
        if hex.len() != DIGEST_LEN * 2
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(StrataError::InvalidFormat {
                reason: format!("diff key {s:?} is not 64 lowercase hex characters"),
            });
        }
        let raw = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|e| StrataError::InvalidFormat { reason: format!("bad diff key hex: {e}") })?;
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for DiffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_value())
    }
}

impl std::fmt::Debug for DiffKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DiffKey({})", self.string_value())
    }
}

impl Serialize for DiffKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.string_value())
    }
}

impl<'de> Deserialize<'de> for DiffKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DiffKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Computes diff keys over record sets.
///
/// The target mount is consulted only to stream-hash regular-file content;
/// the base mount only to resolve deleted-entry node types and directory
/// opacity. Both are optional.
#[derive(Debug, Default)]
pub struct DiffKeyComputer {
    target_mount: Option<PathBuf>,
    base_mount: Option<PathBuf>,
    base_digest: Option<Digest>,
    couple_to_base: bool,
}

impl DiffKeyComputer {
    #[must_use]
    pub fn new() -> Self {
        Self { couple_to_base: true, ..Default::default() }
    }

    /// Mount holding the child snapshot contents, used for content hashing.
    #[must_use]
    pub fn target_mount(mut self, mount: impl Into<PathBuf>) -> Self {
        self.target_mount = Some(mount.into());
        self
    }

    /// Mount holding the parent snapshot contents, used for deleted-entry
    /// resolution.
    #[must_use]
    pub fn base_mount(mut self, mount: impl Into<PathBuf>) -> Self {
        self.base_mount = Some(mount.into());
        self
    }

    /// Digest of the base snapshot the diff applies on top of.
    #[must_use]
    pub fn base_digest(mut self, digest: Digest) -> Self {
        self.base_digest = Some(digest);
        self
    }

    /// Whether the key is coupled to the base lineage. Uncoupled keys share
    /// the `"anybase"` tag.
    #[must_use]
    pub fn couple_to_base(mut self, couple: bool) -> Self {
        self.couple_to_base = couple;
        self
    }

    /// Compute the canonical key for a set of diff records.
    pub async fn compute(&self, records: &[Diff]) -> Result<DiffKey> {
        let mut encoded: Vec<Vec<u8>> = Vec::with_capacity(records.len());
        for record in records {
            if let Some(bytes) = self.encode_record(record).await? {
                encoded.push(bytes);
            }
        }

        // Record-byte sort erases producer ordering.
        encoded.sort_unstable();

        let root = merkle_root(&encoded);

        let base_tag = if !self.couple_to_base {
            "anybase".to_string()
        } else if let Some(digest) = &self.base_digest {
            digest.string_value()
        } else {
            "scratch".to_string()
        };

        let mut hasher = Sha256::new();
        hasher.update(format!("diffkey:v1|{base_tag}|").as_bytes());
        hasher.update(root);
        Ok(DiffKey(hasher.finalize().into()))
    }

    /// Encode one record, or `None` when the record is excluded from
    /// hashing (sockets and devices).
    async fn encode_record(&self, record: &Diff) -> Result<Option<Vec<u8>>> {
        match record {
            Diff::Added { path, node, attributes } => {
                if node.is_excluded() {
                    return Ok(None);
                }
                let mut out = vec![RECORD_VERSION, TAG_ADDED];
                push_field(&mut out, path.as_bytes());
                push_field(&mut out, node.as_str().as_bytes());
                self.push_common_fields(&mut out, record, *node, attributes).await?;
                Ok(Some(out))
            }
            Diff::Modified { path, kind, node, attributes } => {
                if node.is_excluded() {
                    return Ok(None);
                }
                let mut out = vec![RECORD_VERSION, TAG_MODIFIED];
                push_field(&mut out, path.as_bytes());
                push_field(&mut out, kind.as_str().as_bytes());
                push_field(&mut out, node.as_str().as_bytes());
                self.push_common_fields(&mut out, record, *node, attributes).await?;
                Ok(Some(out))
            }
            Diff::Deleted { path } => {
                let base_path = self
                    .base_mount
                    .as_deref()
                    .map(|mount| path.join_under(mount));
                let node = match &base_path {
                    Some(p) => stat_node_kind(p).await,
                    None => None,
                };
                if node.map(|n| n.is_excluded()).unwrap_or(false) {
                    return Ok(None);
                }

                let mut out = vec![RECORD_VERSION, TAG_DELETED];
                push_field(&mut out, path.as_bytes());
                match node {
                    Some(node) => push_field(&mut out, node.as_str().as_bytes()),
                    None => push_field(&mut out, MISSING),
                }
                let opaque = match &base_path {
                    Some(p) => dir_non_empty(p).await,
                    None => false,
                };
                push_field(&mut out, if opaque { b"opq:1" } else { b"opq:0" });
                Ok(Some(out))
            }
        }
    }

    /// Trailing fields shared by added and modified records: perms, uid,
    /// gid, link target, xattrs hash, content hash.
    async fn push_common_fields(
        &self,
        out: &mut Vec<u8>,
        record: &Diff,
        node: NodeKind,
        attributes: &DiffAttributes,
    ) -> Result<()> {
        push_scalar(out, attributes.permissions.map(u64::from));
        push_scalar(out, attributes.uid.map(u64::from));
        push_scalar(out, attributes.gid.map(u64::from));
        match &attributes.link_target {
            Some(target) => push_field(out, target.as_bytes()),
            None => push_field(out, MISSING),
        }

        let xattrs_hash = xattrs_hash(attributes.xattrs.as_ref());
        let mut xattrs_field = Vec::with_capacity(3 + DIGEST_LEN * 2);
        xattrs_field.extend_from_slice(b"xh:");
        xattrs_field.extend_from_slice(HEXLOWER.encode(&xattrs_hash).as_bytes());
        push_field(out, &xattrs_field);

        let content_hash = self.content_hash(record, node).await?;
        let mut content_field = Vec::with_capacity(3 + DIGEST_LEN * 2);
        content_field.extend_from_slice(b"ch:");
        match content_hash {
            Some(digest) => content_field.extend_from_slice(digest.hex().as_bytes()),
            None => content_field.extend_from_slice(MISSING),
        }
        push_field(out, &content_field);
        Ok(())
    }

    /// Content hash for a record: only regular files that were added or whose
    /// content changed, and only while the target file still exists.
    async fn content_hash(&self, record: &Diff, node: NodeKind) -> Result<Option<Digest>> {
        if node != NodeKind::Regular {
            return Ok(None);
        }
        let eligible = match record {
            Diff::Added { .. } => true,
            Diff::Modified { kind, .. } => *kind == ChangeKind::ContentChanged,
            Diff::Deleted { .. } => false,
        };
        if !eligible {
            return Ok(None);
        }
        let Some(mount) = self.target_mount.as_deref() else {
            return Ok(None);
        };
        ContentHasher::hash_file(&record.path().join_under(mount)).await
    }
}

/// Append one length-prefixed field: `len32_be || bytes`, no separators, no
/// escaping.
fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Append an optional numeric field as decimal ASCII, `"-"` when absent.
fn push_scalar(out: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(v) => push_field(out, v.to_string().as_bytes()),
        None => push_field(out, MISSING),
    }
}

/// Hash of the sorted extended attributes.
///
/// Keys sort by unsigned-byte lex order of their UTF-8 bytes; each entry
/// contributes `len32_be(key) || key || len32_be(value) || value`. Empty or
/// absent xattrs hash to SHA-256 of the empty string.
fn xattrs_hash(xattrs: Option<&BTreeMap<String, Vec<u8>>>) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    if let Some(xattrs) = xattrs {
        for (key, value) in xattrs {
            let mut entry = Vec::with_capacity(8 + key.len() + value.len());
            push_field(&mut entry, key.as_bytes());
            push_field(&mut entry, value);
            hasher.update(&entry);
        }
    }
    hasher.finalize().into()
}

/// Fold sorted record encodings into a Merkle root.
fn merkle_root(sorted_records: &[Vec<u8>]) -> [u8; DIGEST_LEN] {
    if sorted_records.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update([EMPTY_PREFIX]);
        hasher.update(b"empty");
        return hasher.finalize().into();
    }

    let mut level: Vec<[u8; DIGEST_LEN]> = sorted_records
        .iter()
        .map(|record| {
            let mut hasher = Sha256::new();
            hasher.update([LEAF_PREFIX]);
            hasher.update(record);
            hasher.finalize().into()
        })
        .collect();

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            // An odd count duplicates the last leaf.
            let right = pair.get(1).unwrap_or(&pair[0]);
            let mut hasher = Sha256::new();
            hasher.update([INNER_PREFIX]);
            hasher.update(left);
            hasher.update(right);
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    level[0]
}

/// Node kind of the entry at `path`, via lstat. `None` when the entry is
/// missing or unreadable.
async fn stat_node_kind(path: &Path) -> Option<NodeKind> {
    let metadata = tokio::fs::symlink_metadata(path).await.ok()?;
    let file_type = metadata.file_type();
    if file_type.is_symlink() {
        return Some(NodeKind::Symlink);
    }
    if file_type.is_dir() {
        return Some(NodeKind::Directory);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() || file_type.is_char_device() {
            return Some(NodeKind::Device);
        }
        if file_type.is_fifo() {
            return Some(NodeKind::Fifo);
        }
        if file_type.is_socket() {
            return Some(NodeKind::Socket);
        }
    }
    file_type.is_file().then_some(NodeKind::Regular)
}

/// Whether `path` is a directory with at least one entry.
async fn dir_non_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => entries.next_entry().await.ok().flatten().is_some(),
        Err(_) => false,
    }
}
