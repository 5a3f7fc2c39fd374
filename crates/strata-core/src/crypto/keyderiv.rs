use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use strata_types::error::{Result, StrataError};

/// Password KDF used to derive the master-key wrapping key.
///
/// Parameters are baked into the algorithm name so a format blob fully
/// determines the derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum KeyDerivationAlgorithm {
    #[default]
    #[serde(rename = "scrypt-65536-8-1")]
    Scrypt,
    #[serde(rename = "pbkdf2-sha256-600000")]
    Pbkdf2Sha256,
    /// Single unsalted-strength hash; only acceptable in tests where KDF
    /// cost would dominate the suite.
    #[serde(rename = "testing-only-insecure")]
    TestingOnlyInsecure,
}

/// Minimum salt length accepted when deriving from a stored format blob.
pub const MIN_SALT_LEN: usize = 16;
/// Salt length written for new repositories.
pub const SALT_LEN: usize = 32;

const PBKDF2_ITERATIONS: u32 = 600_000;

impl KeyDerivationAlgorithm {
    /// Derive a 32-byte wrapping key from a password and salt.
    pub fn derive_key(&self, password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        if salt.len() < MIN_SALT_LEN {
            return Err(StrataError::KeyDerivation(format!(
                "salt must be at least {MIN_SALT_LEN} bytes, got {}",
                salt.len()
            )));
        }

        let mut out = Zeroizing::new([0u8; 32]);
        match self {
            KeyDerivationAlgorithm::Scrypt => {
                let params = scrypt::Params::new(16, 8, 1, 32)
                    .map_err(|e| StrataError::KeyDerivation(format!("scrypt params: {e}")))?;
                scrypt::scrypt(password.as_bytes(), salt, &params, out.as_mut())
                    .map_err(|e| StrataError::KeyDerivation(format!("scrypt: {e}")))?;
            }
            KeyDerivationAlgorithm::Pbkdf2Sha256 => {
                pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, out.as_mut());
            }
            KeyDerivationAlgorithm::TestingOnlyInsecure => {
                let mut hasher = Sha256::new();
                hasher.update(password.as_bytes());
                hasher.update(salt);
                out.copy_from_slice(&hasher.finalize());
            }
        }
        Ok(out)
    }
}
