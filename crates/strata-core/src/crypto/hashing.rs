use blake2::digest::consts::U32;
use blake2::digest::Mac as Blake2Mac;
use blake2::Blake2sMac;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;
type KeyedBlake2s256 = Blake2sMac<U32>;

/// Keyed hash used to derive content ids from plaintext.
///
/// The closed algorithm set is part of the repository format; the chosen
/// algorithm is recorded in the format blob and fixed for the repository's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "HMAC-SHA256")]
    HmacSha256,
    #[serde(rename = "BLAKE2S-256")]
    Blake2s256,
    #[serde(rename = "BLAKE3-256")]
    Blake3,
}

impl HashAlgorithm {
    /// Compute the full 32-byte keyed hash of `data`.
    pub fn keyed_hash(&self, key: &[u8; 32], data: &[u8]) -> [u8; 32] {
        match self {
            HashAlgorithm::HmacSha256 => {
                let mut mac =
                    HmacSha256::new_from_slice(key).expect("any key length works for HMAC");
                mac.update(data);
                let mut out = [0u8; 32];
                out.copy_from_slice(&mac.finalize().into_bytes());
                out
            }
            HashAlgorithm::Blake2s256 => {
                let mut mac = KeyedBlake2s256::new_from_slice(key)
                    .expect("32-byte key is valid for BLAKE2s");
                Blake2Mac::update(&mut mac, data);
                let mut out = [0u8; 32];
                out.copy_from_slice(&mac.finalize().into_bytes());
                out
            }
            HashAlgorithm::Blake3 => *blake3::keyed_hash(key, data).as_bytes(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::HmacSha256 => "HMAC-SHA256",
            HashAlgorithm::Blake2s256 => "BLAKE2S-256",
            HashAlgorithm::Blake3 => "BLAKE3-256",
        }
    }
}
