use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StrataError};

/// Minimum truncated hash length in bytes.
pub const MIN_HASH_LEN: usize = 16;
/// Maximum hash length in bytes (untruncated output of the keyed hash).
pub const MAX_HASH_LEN: usize = 32;

/// Identifier of a deduplicated content: an optional one-byte namespace
/// prefix (a lowercase letter or digit) followed by the truncated keyed hash
/// of the plaintext.
///
/// Ids with no prefix address data contents; prefixed ids address metadata
/// contents and route to metadata packs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId {
    prefix: u8, // 0 when absent
    len: u8,    // hash length in bytes
    hash: [u8; MAX_HASH_LEN],
}

impl ContentId {
    /// Build an id from a hash. The hash must be `MIN_HASH_LEN..=MAX_HASH_LEN`
    /// bytes; the prefix, when present, must be a lowercase letter or digit.
    pub fn from_hash(prefix: Option<char>, hash: &[u8]) -> Result<Self> {
        if hash.len() < MIN_HASH_LEN || hash.len() > MAX_HASH_LEN {
            return Err(StrataError::InvalidFormat(format!(
                "content hash must be {MIN_HASH_LEN}..={MAX_HASH_LEN} bytes, got {}",
                hash.len()
            )));
        }
        let prefix = match prefix {
            None => 0,
            Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => c as u8,
            Some(c) => {
                return Err(StrataError::InvalidFormat(format!(
                    "invalid content id prefix: '{c}'"
                )))
            }
        };
        let mut buf = [0u8; MAX_HASH_LEN];
        buf[..hash.len()].copy_from_slice(hash);
        Ok(Self {
            prefix,
            len: hash.len() as u8,
            hash: buf,
        })
    }

    /// Namespace prefix character, if any.
    pub fn prefix(&self) -> Option<char> {
        if self.prefix == 0 {
            None
        } else {
            Some(self.prefix as char)
        }
    }

    /// Whether this id addresses a metadata content (prefixed namespace).
    pub fn is_metadata(&self) -> bool {
        self.prefix != 0
    }

    /// The truncated hash bytes.
    pub fn hash(&self) -> &[u8] {
        &self.hash[..self.len as usize]
    }

    /// Index key bytes: one prefix byte (0 when absent) followed by the hash.
    /// Byte-lexicographic order over these keys is the index entry order.
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.len as usize);
        out.push(self.prefix);
        out.extend_from_slice(self.hash());
        out
    }

    /// Reconstruct an id from index key bytes.
    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(StrataError::InvalidFormat("empty content id key".into()));
        }
        let prefix = match key[0] {
            0 => None,
            b => Some(b as char),
        };
        Self::from_hash(prefix, &key[1..])
    }
}

impl Ord for ContentId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.hash().cmp(other.hash()))
    }
}

impl PartialOrd for ContentId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = self.prefix() {
            write!(f, "{p}")?;
        }
        write!(f, "{}", hex::encode(self.hash()))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl FromStr for ContentId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, hex_part) = if s.len() % 2 == 1 {
            let mut chars = s.chars();
            (chars.next(), chars.as_str())
        } else {
            (None, s)
        };
        let hash = hex::decode(hex_part)
            .map_err(|e| StrataError::InvalidFormat(format!("invalid content id '{s}': {e}")))?;
        Self::from_hash(prefix, &hash)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
