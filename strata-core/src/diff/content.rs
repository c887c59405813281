//! Streaming file content hashing and comparison.

use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::digest::{Digest, DigestBuilder};
use crate::error::{Result, StrataError};

/// Chunk size for streaming hashes: 4 MiB.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Streaming SHA-256 hasher over file contents.
pub struct ContentHasher;

impl ContentHasher {
    /// Hash a file's contents in 4 MiB chunks.
    ///
    /// Returns `None` if the file does not exist at hash time.
    pub async fn hash_file(path: &Path) -> Result<Option<Digest>> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StrataError::io(path, e)),
        };

        let mut hasher = DigestBuilder::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| StrataError::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Some(hasher.finalize()))
    }
}

/// Outcome of comparing two file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentComparison {
    /// The caller only wants attribute comparison; content was not read.
    AttributeOnly,
    /// Contents differ, or one side is absent.
    Changed,
    /// Contents hash identically.
    Identical,
}

/// Compares the contents of two optional files.
///
/// Symlink target comparison is metadata and must not go through here, and
/// callers must not invoke the differ for sockets or devices.
pub struct FileContentDiffer;

impl FileContentDiffer {
    /// Compare two optional paths.
    ///
    /// With `attributes_only` set the result is [`ContentComparison::AttributeOnly`]
    /// immediately. If either side is absent the contents are considered
    /// changed. Otherwise both files are stream-hashed and their digests
    /// compared.
    pub async fn compare(
        base: Option<&Path>,
        target: Option<&Path>,
        attributes_only: bool,
    ) -> Result<ContentComparison> {
        if attributes_only {
            return Ok(ContentComparison::AttributeOnly);
        }

        let (base, target) = match (base, target) {
            (Some(base), Some(target)) => (base, target),
            _ => return Ok(ContentComparison::Changed),
        };

        let base_digest = ContentHasher::hash_file(base).await?;
        let target_digest = ContentHasher::hash_file(target).await?;

        match (base_digest, target_digest) {
            (Some(a), Some(b)) if a == b => Ok(ContentComparison::Identical),
            (a, b) => {
                debug!(base = %base.display(), target = %target.display(),
                       base_present = a.is_some(), target_present = b.is_some(),
                       "file contents differ");
                Ok(ContentComparison::Changed)
            }
        }
    }
}
