//! Version identifiers
//!
//! A version is a short fixed-width id for one node in a document's DAG.
//! The byte form is what the store indexes; the base64 form is what appears
//! in documents and logs. Engine-generated versions are content hashes so
//! that two peers deriving the same merge derive the same id.

use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Widest version the key layout supports.
pub const MAX_VERSION_SIZE: usize = 6;

/// Default version width in bytes.
pub const DEFAULT_VERSION_SIZE: usize = 6;

/// Errors from version parsing and generation.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version must be 1..={MAX_VERSION_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid base64 version: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("version serialization failed: {0}")]
    Encode(#[from] bson::ser::Error),
}

/// A fixed-width DAG node id.
///
/// Byte width is a per-tree setting (`vSize`), at most [`MAX_VERSION_SIZE`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(Vec<u8>);

impl Version {
    /// Wrap raw version bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VersionError> {
        if bytes.is_empty() || bytes.len() > MAX_VERSION_SIZE {
            return Err(VersionError::InvalidLength(bytes.len()));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Parse the base64 string form.
    pub fn from_base64(s: &str) -> Result<Self, VersionError> {
        let bytes = STANDARD_NO_PAD.decode(s.trim_end_matches('='))?;
        Self::from_bytes(&bytes)
    }

    /// The base64 string form.
    pub fn to_base64(&self) -> String {
        STANDARD_NO_PAD.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive a content-hash version from a canonical document.
    ///
    /// SHA-256 over the BSON serialization, truncated to `size` bytes.
    pub fn content_hash(doc: &bson::Document, size: usize) -> Result<Self, VersionError> {
        if size == 0 || size > MAX_VERSION_SIZE {
            return Err(VersionError::InvalidLength(size));
        }
        let mut buf = Vec::new();
        doc.to_writer(&mut buf)?;
        let digest = Sha256::digest(&buf);
        Ok(Self(digest[..size].to_vec()))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.to_base64())
    }
}

impl AsRef<[u8]> for Version {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Version {
    type Error = VersionError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::from_bytes(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn base64_round_trip() {
        let v = Version::from_bytes(&[1, 2, 3, 4, 5, 6]).unwrap();
        let s = v.to_base64();
        assert_eq!(s.len(), 8);
        assert_eq!(Version::from_base64(&s).unwrap(), v);
    }

    #[test]
    fn rejects_bad_widths() {
        assert!(Version::from_bytes(&[]).is_err());
        assert!(Version::from_bytes(&[0u8; 7]).is_err());
        assert!(Version::from_bytes(&[0u8; 6]).is_ok());
    }

    #[test]
    fn content_hash_is_deterministic() {
        let d = doc! { "id": "a", "pa": [], "d": false, "b": { "x": 1i32 } };
        let v1 = Version::content_hash(&d, 6).unwrap();
        let v2 = Version::content_hash(&d, 6).unwrap();
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 6);

        let other = doc! { "id": "a", "pa": [], "d": false, "b": { "x": 2i32 } };
        assert_ne!(Version::content_hash(&other, 6).unwrap(), v1);
    }

    #[test]
    fn content_hash_respects_width() {
        let d = doc! { "id": "a" };
        assert_eq!(Version::content_hash(&d, 3).unwrap().len(), 3);
        assert!(Version::content_hash(&d, 0).is_err());
        assert!(Version::content_hash(&d, 9).is_err());
    }
}
