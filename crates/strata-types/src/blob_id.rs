use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Name of a blob in the backend store: a short printable ASCII string whose
/// first byte routes storage policy (pack, index, manifest-index, format, …).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

/// Kind prefix of data pack blobs.
pub const PACK_DATA_PREFIX: char = 'p';
/// Kind prefix of metadata pack blobs.
pub const PACK_METADATA_PREFIX: char = 'q';
/// Kind prefix of content index blobs.
pub const INDEX_PREFIX: char = 'n';
/// Kind prefix of manifest-index blobs.
pub const MANIFEST_INDEX_PREFIX: char = 'm';
/// Kind prefix of manifest payload packs.
pub const MANIFEST_DATA_PREFIX: char = 'l';

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First byte of the id, which routes caching and pack policy.
    pub fn kind_prefix(&self) -> Option<char> {
        self.0.chars().next()
    }

    pub fn has_prefix(&self, prefix: char) -> bool {
        self.kind_prefix() == Some(prefix)
    }

    /// Whether this blob is a pack (data or metadata).
    pub fn is_pack(&self) -> bool {
        self.has_prefix(PACK_DATA_PREFIX) || self.has_prefix(PACK_METADATA_PREFIX)
    }

    /// Validate that the id is a plausible backend key: non-empty printable
    /// ASCII with no path separators.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(StrataError::InvalidFormat("empty blob id".into()));
        }
        if !self
            .0
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b'/' && b != b'\\')
        {
            return Err(StrataError::InvalidFormat(format!(
                "blob id contains unsafe characters: '{}'",
                self.0
            )));
        }
        Ok(())
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

/// Listing entry for a stored blob. The timestamp is backend-reported and
/// may be approximate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub id: BlobId,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_prefix_routes() {
        assert_eq!(BlobId::from("p0123").kind_prefix(), Some('p'));
        assert!(BlobId::from("q0123").is_pack());
        assert!(!BlobId::from("n0123").is_pack());
        assert!(BlobId::from("strata.repository").has_prefix('s'));
    }

    #[test]
    fn validate_rejects_unsafe_ids() {
        assert!(BlobId::from("").validate().is_err());
        assert!(BlobId::from("a/b").validate().is_err());
        assert!(BlobId::from("a\\b").validate().is_err());
        assert!(BlobId::from("p deadbeef").validate().is_err());
        assert!(BlobId::from("pdeadbeef").validate().is_ok());
    }
}
