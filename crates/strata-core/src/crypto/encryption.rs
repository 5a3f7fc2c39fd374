use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};

use strata_types::error::{Result, StrataError};

/// Authenticated content encryption algorithm; part of the repository
/// format, fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    #[default]
    #[serde(rename = "AES256-GCM-HMAC-SHA256")]
    Aes256Gcm,
    #[serde(rename = "CHACHA20-POLY1305-HMAC-SHA256")]
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256Gcm => "AES256-GCM-HMAC-SHA256",
            EncryptionAlgorithm::ChaCha20Poly1305 => "CHACHA20-POLY1305-HMAC-SHA256",
        }
    }
}

/// A content cipher bound to the repository's derived encryption key.
///
/// Nonces are derived from the content/blob identity by the caller; the
/// output is `ciphertext || 16-byte tag` with the nonce implicit.
pub enum ContentCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// Authentication tag length appended to every ciphertext.
pub const TAG_LEN: usize = 16;
/// Derived nonce length.
pub const NONCE_LEN: usize = 12;

impl ContentCipher {
    pub fn new(algorithm: EncryptionAlgorithm, key: &[u8; 32]) -> Self {
        match algorithm {
            EncryptionAlgorithm::Aes256Gcm => ContentCipher::Aes(Box::new(
                Aes256Gcm::new_from_slice(key).expect("valid 32-byte key for AES-256-GCM"),
            )),
            EncryptionAlgorithm::ChaCha20Poly1305 => ContentCipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .expect("valid 32-byte key for ChaCha20-Poly1305"),
            )),
        }
    }

    pub fn encrypt(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        match self {
            ContentCipher::Aes(cipher) => cipher
                .encrypt(Nonce::from_slice(nonce), payload)
                .map_err(|e| StrataError::Other(format!("AES-GCM encrypt: {e}"))),
            ContentCipher::ChaCha(cipher) => cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|e| StrataError::Other(format!("ChaCha20-Poly1305 encrypt: {e}"))),
        }
    }

    pub fn decrypt(&self, nonce: &[u8; NONCE_LEN], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_LEN {
            return Err(StrataError::MacFailed);
        }
        let payload = Payload { msg: data, aad };
        match self {
            ContentCipher::Aes(cipher) => cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| StrataError::MacFailed),
            ContentCipher::ChaCha(cipher) => cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .map_err(|_| StrataError::MacFailed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];
    const NONCE: [u8; 12] = [0x01; 12];

    #[test]
    fn roundtrip_both_ciphers() {
        for alg in [
            EncryptionAlgorithm::Aes256Gcm,
            EncryptionAlgorithm::ChaCha20Poly1305,
        ] {
            let cipher = ContentCipher::new(alg, &KEY);
            let ct = cipher.encrypt(&NONCE, b"secret", b"aad").unwrap();
            assert_eq!(ct.len(), 6 + TAG_LEN);
            assert_eq!(cipher.decrypt(&NONCE, &ct, b"aad").unwrap(), b"secret");
        }
    }

    #[test]
    fn tamper_fails_mac() {
        let cipher = ContentCipher::new(EncryptionAlgorithm::Aes256Gcm, &KEY);
        let mut ct = cipher.encrypt(&NONCE, b"secret", b"").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&NONCE, &ct, b""),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn wrong_aad_fails_mac() {
        let cipher = ContentCipher::new(EncryptionAlgorithm::ChaCha20Poly1305, &KEY);
        let ct = cipher.encrypt(&NONCE, b"secret", b"right").unwrap();
        assert!(matches!(
            cipher.decrypt(&NONCE, &ct, b"wrong"),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn short_input_fails_mac() {
        let cipher = ContentCipher::new(EncryptionAlgorithm::Aes256Gcm, &KEY);
        assert!(matches!(
            cipher.decrypt(&NONCE, b"tiny", b""),
            Err(StrataError::MacFailed)
        ));
    }
}
