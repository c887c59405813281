//! Content digests.
//!
//! Everything content-addressed in the build core hashes with SHA-256; the
//! canonical string form is `"sha256:<lowercase-hex>"`.

use bytes::Bytes;
use data_encoding::HEXLOWER;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::StrataError;

/// Digest algorithm identifier.
pub const ALGORITHM: &str = "sha256";

/// Raw digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 content digest.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(Bytes);

impl Digest {
    /// The all-zero digest, used as the parent reference of snapshots rooted
    /// at scratch.
    #[must_use]
    pub fn zero() -> Self {
        Self(Bytes::from_static(&[0u8; DIGEST_LEN]))
    }

    /// Compute the digest of a byte slice.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self::from(&hasher.finalize().into())
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lowercase hex rendering of the raw bytes, without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }

    /// Canonical string form, `"sha256:<lowercase-hex>"`.
    #[must_use]
    pub fn string_value(&self) -> String {
        format!("{ALGORITHM}:{}", self.hex())
    }

    /// Parse the canonical string form.
    ///
    /// Accepts only `"sha256:"` followed by exactly 64 lowercase hex
    /// characters.
    pub fn parse(s: &str) -> Result<Self, StrataError> {
        let hex = s.strip_prefix("sha256:").ok_or_else(|| StrataError::InvalidFormat {
            reason: format!("digest {s:?} does not start with \"sha256:\""),
        })?;
        if hex.len() != DIGEST_LEN * 2
            || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(StrataError::InvalidFormat {
                reason: format!("digest {s:?} is not 64 lowercase hex characters"),
            });
        }
        let raw = HEXLOWER
            .decode(hex.as_bytes())
            .map_err(|e| StrataError::InvalidFormat { reason: format!("bad digest hex: {e}") })?;
        Ok(Self(raw.into()))
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl From<&[u8; DIGEST_LEN]> for Digest {
    fn from(value: &[u8; DIGEST_LEN]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(Bytes::copy_from_slice(&value))
    }
}

impl TryFrom<Vec<u8>> for Digest {
    type Error = StrataError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != DIGEST_LEN {
            return Err(StrataError::InvalidFormat {
                reason: format!("digest length {} != {DIGEST_LEN}", value.len()),
            });
        }
        Ok(Self(value.into()))
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.string_value())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.string_value())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.string_value())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher producing a [`Digest`].
#[derive(Default)]
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    #[must_use]
    pub fn finalize(self) -> Digest {
        Digest::from(&self.hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_compute_known_value() {
        // SHA-256 of the empty string.
        let digest = Digest::compute(b"");
        assert_eq!(
            digest.as_slice(),
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn test_string_roundtrip() {
        let digest = Digest::compute(b"strata");
        let parsed = Digest::parse(&digest.string_value()).unwrap();
        assert_eq!(parsed, digest);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(Digest::parse("sha512:abcd").is_err());
        assert!(Digest::parse("sha256:abcd").is_err());
        let upper = format!("sha256:{}", "A".repeat(64));
        assert!(Digest::parse(&upper).is_err());
        let with_suffix = format!("{}x", Digest::zero().string_value());
        assert!(Digest::parse(&with_suffix).is_err());
    }

    #[test]
    fn test_zero() {
        let zero = Digest::zero();
        assert!(zero.is_zero());
        assert_eq!(zero.string_value(), format!("sha256:{}", "0".repeat(64)));
    }

    #[test]
    fn test_ordering_matches_string_value() {
        let a = Digest::compute(b"a");
        let b = Digest::compute(b"b");
        assert_eq!(a.cmp(&b), a.string_value().cmp(&b.string_value()));
    }

    #[test]
    fn test_serde_as_canonical_string() {
        let digest = Digest::compute(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.string_value()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
