//! Byte-preserving filesystem paths.
//!
//! Paths that cross the snapshot diff pipeline must survive verbatim: layer
//! contents are not guaranteed to be valid UTF-8, and the canonical diff
//! encoding hashes the raw bytes. [`BinaryPath`] keeps the exact byte
//! sequence and only converts to host path representations at the edges.

use bstr::ByteSlice;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Component separator, `/`.
pub const SEPARATOR: u8 = b'/';

/// An ordered sequence of bytes representing a filesystem path.
///
/// Raw bytes are preserved verbatim (non-UTF-8 permitted); comparison is
/// unsigned-byte lexicographic over the raw bytes.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinaryPath {
    inner: Vec<u8>,
}

impl BinaryPath {
    /// The empty path.
    pub const fn new() -> Self {
        Self { inner: Vec::new() }
    }

    /// Construct from raw bytes, preserved verbatim.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self { inner: bytes.into() }
    }

    /// Construct from a null-terminated C byte buffer.
    ///
    /// Bytes up to (excluding) the first NUL are taken; the buffer must
    /// contain one.
    pub fn from_c_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.iter().position(|&b| b == 0) {
            Some(end) => Ok(Self::from_bytes(&bytes[..end])),
            None => Err(StrataError::InvalidFormat {
                reason: "C path buffer has no NUL terminator".to_string(),
            }),
        }
    }

    /// Construct from a host path.
    ///
    /// On Unix the raw `OsStr` bytes are preserved verbatim.
    pub fn from_host_path(path: &Path) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            Self::from_bytes(path.as_os_str().as_bytes())
        }
        #[cfg(not(unix))]
        {
            Self::from_bytes(path.to_string_lossy().as_bytes())
        }
    }

    /// The raw path bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Append a path component.
    ///
    /// Inserts a `/` if the receiver is non-empty and does not already end in
    /// one; strips one leading `/` from the component.
    #[must_use]
    pub fn append(&self, component: &[u8]) -> Self {
        let component = component.strip_prefix(b"/").unwrap_or(component);
        let mut out = Vec::with_capacity(self.inner.len() + component.len() + 1);
        out.extend_from_slice(&self.inner);
        if !out.is_empty() && out.last() != Some(&SEPARATOR) {
            out.push(SEPARATOR);
        }
        out.extend_from_slice(component);
        Self { inner: out }
    }

    /// The path without its final component.
    ///
    /// Returns `/` if the last separator is at byte 0, and the empty path if
    /// there is no separator at all.
    #[must_use]
    pub fn deleting_last_path_component(&self) -> Self {
        match self.inner.rfind_byte(SEPARATOR) {
            Some(0) => Self::from_bytes(&b"/"[..]),
            Some(idx) => Self::from_bytes(&self.inner[..idx]),
            None => Self::new(),
        }
    }

    /// The final component of the path, in raw bytes.
    #[must_use]
    pub fn last_path_component(&self) -> &[u8] {
        match self.inner.rfind_byte(SEPARATOR) {
            Some(idx) => &self.inner[idx + 1..],
            None => &self.inner,
        }
    }

    /// Iterator over the path components, split on `/` with empty segments
    /// discarded.
    pub fn components(&self) -> impl Iterator<Item = &[u8]> {
        self.inner.split_str(b"/").filter(|c| !c.is_empty())
    }

    /// Whether the raw bytes start with `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.inner.starts_with(prefix)
    }

    /// Whether the raw bytes end with `suffix`.
    #[must_use]
    pub fn has_suffix(&self, suffix: &[u8]) -> bool {
        self.inner.ends_with(suffix)
    }

    /// The bytes of `self` after a `base + "/"` prefix.
    ///
    /// Returns the empty path if `self == base`, and `None` when `self` is
    /// not under `base`.
    #[must_use]
    pub fn relative_path(&self, base: &BinaryPath) -> Option<Self> {
        if self.inner == base.inner {
            return Some(Self::new());
        }
        let mut prefix = base.inner.clone();
        if prefix.last() != Some(&SEPARATOR) {
            prefix.push(SEPARATOR);
        }
        self.inner.strip_prefix(prefix.as_slice()).map(Self::from_bytes)
    }

    /// Run `body` with a null-terminated view of the path bytes.
    ///
    /// Fails with `EncodingFailed` if the path contains an interior NUL.
    pub fn with_c_string<R>(&self, body: impl FnOnce(&std::ffi::CStr) -> R) -> Result<R> {
        let cstr = CString::new(self.inner.clone()).map_err(|_| StrataError::EncodingFailed {
            reason: "path contains an interior NUL byte".to_string(),
        })?;
        Ok(body(&cstr))
    }

    /// Convert to a host path.
    ///
    /// On Unix the raw bytes are preserved verbatim.
    #[must_use]
    pub fn to_host_path(&self) -> PathBuf {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            PathBuf::from(std::ffi::OsStr::from_bytes(&self.inner))
        }
        #[cfg(not(unix))]
        {
            PathBuf::from(String::from_utf8_lossy(&self.inner).into_owned())
        }
    }

    /// Join the path under a host root directory, treating it as relative
    /// (any leading separators are discarded).
    #[must_use]
    pub fn join_under(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.components() {
            #[cfg(unix)]
            {
                use std::os::unix::ffi::OsStrExt;
                out.push(std::ffi::OsStr::from_bytes(component));
            }
            #[cfg(not(unix))]
            {
                out.push(String::from_utf8_lossy(component).into_owned());
            }
        }
        out
    }
}

impl From<&str> for BinaryPath {
    fn from(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }
}

impl From<String> for BinaryPath {
    fn from(s: String) -> Self {
        Self::from_bytes(s.into_bytes())
    }
}

impl From<&[u8]> for BinaryPath {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for BinaryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.as_bstr())
    }
}

impl fmt::Debug for BinaryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryPath({:?})", self.inner.as_bstr())
    }
}

// Serialization policy: valid UTF-8 encodes as a string, anything else as a
// binary byte blob. Decoders accept both shapes.
impl Serialize for BinaryPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.inner) {
            Ok(s) => serializer.serialize_str(s),
            Err(_) => serializer.serialize_bytes(&self.inner),
        }
    }
}

struct BinaryPathVisitor;

impl<'de> Visitor<'de> for BinaryPathVisitor {
    type Value = BinaryPath;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a path string or byte blob")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        Ok(BinaryPath::from(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
        Ok(BinaryPath::from_bytes(v))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Self::Value, E> {
        Ok(BinaryPath::from_bytes(v))
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        Ok(BinaryPath::from_bytes(bytes))
    }
}

impl<'de> Deserialize<'de> for BinaryPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(BinaryPathVisitor)
    }
}
