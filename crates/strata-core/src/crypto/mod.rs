pub mod encryption;
pub mod hashing;
pub mod keyderiv;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use strata_types::blob_id::BlobId;
use strata_types::content_id::ContentId;
use strata_types::error::{Result, StrataError};

use self::encryption::{ContentCipher, EncryptionAlgorithm, NONCE_LEN};
use self::hashing::HashAlgorithm;

/// The repository master key. Never stored in plaintext; wrapped by a
/// password-derived key inside the format blob. Zeroized on drop.
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(bytes.as_mut());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// HKDF-SHA256 purpose separation from the master key.
fn derive_purpose_key(master: &MasterKey, purpose: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(purpose, out.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    out
}

/// Bundles the repository's hashing and encryption state: computes content
/// ids, encrypts/decrypts content payloads and whole metadata blobs.
///
/// Nonces are deterministic: the content id (itself a MAC of the plaintext)
/// seeds the content nonce, and blob ids seed whole-blob nonces, so
/// identical plaintext encrypts identically and deduplicates.
pub struct Crypter {
    hash_algorithm: HashAlgorithm,
    cipher: ContentCipher,
    hmac_key: Zeroizing<[u8; 32]>,
    list_cache_key: Zeroizing<[u8; 32]>,
    hash_id_length: usize,
}

impl Crypter {
    pub fn new(
        master: &MasterKey,
        hash_algorithm: HashAlgorithm,
        encryption_algorithm: EncryptionAlgorithm,
        hash_id_length: usize,
    ) -> Result<Self> {
        if !(strata_types::content_id::MIN_HASH_LEN..=strata_types::content_id::MAX_HASH_LEN)
            .contains(&hash_id_length)
        {
            return Err(StrataError::InvalidFormat(format!(
                "hash id length {hash_id_length} out of range"
            )));
        }
        let encryption_key = derive_purpose_key(master, b"encryption");
        Ok(Self {
            hash_algorithm,
            cipher: ContentCipher::new(encryption_algorithm, &encryption_key),
            hmac_key: derive_purpose_key(master, b"hmac-secret"),
            list_cache_key: derive_purpose_key(master, b"list-cache"),
            hash_id_length,
        })
    }

    /// Compute the content id of `data`: keyed hash truncated to the
    /// configured length, under the optional namespace prefix.
    pub fn content_id(&self, prefix: Option<char>, data: &[u8]) -> Result<ContentId> {
        let hash = self.hash_algorithm.keyed_hash(&self.hmac_key, data);
        ContentId::from_hash(prefix, &hash[..self.hash_id_length])
    }

    fn content_nonce(&self, id: &ContentId) -> [u8; NONCE_LEN] {
        // Content ids are at least 16 bytes of MAC output.
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&id.hash()[..NONCE_LEN]);
        nonce
    }

    fn derived_nonce(&self, context: &[u8]) -> [u8; NONCE_LEN] {
        let digest = self.hash_algorithm.keyed_hash(&self.hmac_key, context);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        nonce
    }

    /// Encrypt a content payload; the id binds nonce and AAD.
    pub fn encrypt_content(&self, id: &ContentId, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(&self.content_nonce(id), plaintext, &id.key_bytes())
    }

    pub fn decrypt_content(&self, id: &ContentId, data: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(&self.content_nonce(id), data, &id.key_bytes())
    }

    /// Whole-blob encryption for index/manifest blobs whose blob id encodes
    /// its own nonce.
    pub fn encrypt_blob(&self, id: &BlobId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.derived_nonce(id.as_str().as_bytes());
        self.cipher.encrypt(&nonce, plaintext, id.as_str().as_bytes())
    }

    pub fn decrypt_blob(&self, id: &BlobId, data: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.derived_nonce(id.as_str().as_bytes());
        self.cipher.decrypt(&nonce, data, id.as_str().as_bytes())
    }

    /// Encrypt under a caller-supplied context (manifest payloads keyed by
    /// manifest id).
    pub fn encrypt_keyed(&self, context: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(&self.derived_nonce(context), plaintext, context)
    }

    pub fn decrypt_keyed(&self, context: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(&self.derived_nonce(context), data, context)
    }

    /// Secret for HMAC-signing list cache entries.
    pub fn list_cache_secret(&self) -> [u8; 32] {
        *self.list_cache_key
    }

    pub fn hash_id_length(&self) -> usize {
        self.hash_id_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_crypter() -> Crypter {
        Crypter::new(
            &MasterKey::from_bytes([0x11; 32]),
            HashAlgorithm::Blake3,
            EncryptionAlgorithm::Aes256Gcm,
            16,
        )
        .unwrap()
    }

    #[test]
    fn content_id_is_deterministic_and_truncated() {
        let c = test_crypter();
        let a = c.content_id(None, b"hello").unwrap();
        let b = c.content_id(None, b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash().len(), 16);
        assert_ne!(a, c.content_id(None, b"world").unwrap());
    }

    #[test]
    fn prefix_changes_id_namespace_not_hash() {
        let c = test_crypter();
        let plain = c.content_id(None, b"hello").unwrap();
        let meta = c.content_id(Some('k'), b"hello").unwrap();
        assert_eq!(plain.hash(), meta.hash());
        assert_ne!(plain, meta);
    }

    #[test]
    fn content_roundtrip_and_dedup_stable_ciphertext() {
        let c = test_crypter();
        let id = c.content_id(None, b"payload").unwrap();
        let ct1 = c.encrypt_content(&id, b"payload").unwrap();
        let ct2 = c.encrypt_content(&id, b"payload").unwrap();
        // Deterministic nonce derivation keeps ciphertext stable for dedupe.
        assert_eq!(ct1, ct2);
        assert_eq!(c.decrypt_content(&id, &ct1).unwrap(), b"payload");
    }

    #[test]
    fn content_decrypt_with_wrong_id_fails() {
        let c = test_crypter();
        let id = c.content_id(None, b"payload").unwrap();
        let other = c.content_id(None, b"other").unwrap();
        let ct = c.encrypt_content(&id, b"payload").unwrap();
        assert!(matches!(
            c.decrypt_content(&other, &ct),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn blob_roundtrip_binds_blob_id() {
        let c = test_crypter();
        let id = BlobId::from("nabc123");
        let ct = c.encrypt_blob(&id, b"index bytes").unwrap();
        assert_eq!(c.decrypt_blob(&id, &ct).unwrap(), b"index bytes");
        assert!(matches!(
            c.decrypt_blob(&BlobId::from("nxyz"), &ct),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn different_masters_cannot_read_each_other() {
        let a = test_crypter();
        let b = Crypter::new(
            &MasterKey::from_bytes([0x22; 32]),
            HashAlgorithm::Blake3,
            EncryptionAlgorithm::Aes256Gcm,
            16,
        )
        .unwrap();
        let id = a.content_id(None, b"payload").unwrap();
        let ct = a.encrypt_content(&id, b"payload").unwrap();
        assert!(matches!(
            b.decrypt_content(&id, &ct),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn rejects_bad_hash_length() {
        assert!(Crypter::new(
            &MasterKey::from_bytes([0x11; 32]),
            HashAlgorithm::HmacSha256,
            EncryptionAlgorithm::Aes256Gcm,
            8,
        )
        .is_err());
    }
}
