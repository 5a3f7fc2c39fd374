use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::Zeroizing;

use strata_types::blob_id::BlobId;
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, PutOptions};
use crate::crypto::encryption::EncryptionAlgorithm;
use crate::crypto::hashing::HashAlgorithm;
use crate::crypto::keyderiv::{KeyDerivationAlgorithm, SALT_LEN};
use crate::crypto::MasterKey;

/// Name of the repository descriptor blob.
pub const FORMAT_BLOB_ID: &str = "strata.repository";
/// Prefix of format blob backups written while an upgrade lock is placed.
pub const FORMAT_BACKUP_PREFIX: &str = "strata.repository.backup.";

/// Newest content format version this build reads and writes.
pub const MAX_SUPPORTED_FORMAT_VERSION: u8 = 2;
/// Oldest content format version this build reads.
pub const MIN_SUPPORTED_FORMAT_VERSION: u8 = 1;

/// Default maximum pack blob size.
pub const DEFAULT_MAX_PACK_SIZE: u32 = 20 * 1024 * 1024;
/// Hard limit guarding against mistyped configuration.
pub const MAX_PACK_SIZE_LIMIT: u32 = 128 * 1024 * 1024;

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Master key wrapped under the password-derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Administrative intent to upgrade the repository format.
///
/// While present, clients older than `new_format_version` refuse to open the
/// repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeLock {
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub advance_notice_seconds: u64,
    pub new_format_version: u8,
}

/// The repository descriptor stored at [`FORMAT_BLOB_ID`], loaded before
/// anything else. Everything needed to build the crypter lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryFormat {
    #[serde(with = "hex_bytes")]
    pub unique_id: Vec<u8>,
    pub key_derivation_algorithm: KeyDerivationAlgorithm,
    #[serde(with = "hex_bytes")]
    pub kdf_salt: Vec<u8>,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub hash_algorithm: HashAlgorithm,
    pub hash_id_length: usize,
    pub wrapped_master_key: WrappedKey,
    pub max_pack_size: u32,
    pub format_version: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_lock: Option<UpgradeLock>,
}

/// Tunables for creating a new repository.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub key_derivation_algorithm: KeyDerivationAlgorithm,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub hash_algorithm: HashAlgorithm,
    pub hash_id_length: usize,
    pub max_pack_size: u32,
    pub format_version: u8,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            key_derivation_algorithm: KeyDerivationAlgorithm::default(),
            encryption_algorithm: EncryptionAlgorithm::default(),
            hash_algorithm: HashAlgorithm::default(),
            hash_id_length: 16,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            format_version: MAX_SUPPORTED_FORMAT_VERSION,
        }
    }
}

impl RepositoryFormat {
    /// Create a fresh format blob wrapping a new random master key.
    pub fn initialize(password: &str, opts: &FormatOptions) -> Result<(Self, MasterKey)> {
        if opts.max_pack_size > MAX_PACK_SIZE_LIMIT {
            return Err(StrataError::Config(format!(
                "max_pack_size ({}) exceeds hard limit of {} bytes",
                opts.max_pack_size, MAX_PACK_SIZE_LIMIT
            )));
        }
        if !(MIN_SUPPORTED_FORMAT_VERSION..=MAX_SUPPORTED_FORMAT_VERSION)
            .contains(&opts.format_version)
        {
            return Err(StrataError::FormatIncompatible(format!(
                "cannot create format version {}",
                opts.format_version
            )));
        }

        let mut unique_id = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut unique_id);
        let mut kdf_salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut kdf_salt);

        let master = MasterKey::generate();
        let wrapped = wrap_master_key(
            &master,
            password,
            opts.key_derivation_algorithm,
            &kdf_salt,
            &unique_id,
        )?;

        Ok((
            Self {
                unique_id,
                key_derivation_algorithm: opts.key_derivation_algorithm,
                kdf_salt,
                encryption_algorithm: opts.encryption_algorithm,
                hash_algorithm: opts.hash_algorithm,
                hash_id_length: opts.hash_id_length,
                wrapped_master_key: wrapped,
                max_pack_size: opts.max_pack_size,
                format_version: opts.format_version,
                upgrade_lock: None,
            },
            master,
        ))
    }

    /// Load and validate the format blob.
    pub fn load(storage: &dyn BlobStorage) -> Result<Self> {
        let data = crate::blob::get_full(storage, &BlobId::from(FORMAT_BLOB_ID)).map_err(|e| {
            if e.is_not_found() {
                StrataError::InvalidFormat("repository descriptor not found".into())
            } else {
                e
            }
        })?;
        let format: RepositoryFormat = serde_json::from_slice(&data)?;
        format.validate()?;
        Ok(format)
    }

    pub fn store(&self, storage: &dyn BlobStorage) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        storage.put(&BlobId::from(FORMAT_BLOB_ID), &data, &PutOptions::default())
    }

    fn validate(&self) -> Result<()> {
        if self.format_version > MAX_SUPPORTED_FORMAT_VERSION
            || self.format_version < MIN_SUPPORTED_FORMAT_VERSION
        {
            return Err(StrataError::FormatIncompatible(format!(
                "format version {} is outside the supported range {}..={}",
                self.format_version, MIN_SUPPORTED_FORMAT_VERSION, MAX_SUPPORTED_FORMAT_VERSION
            )));
        }
        if self.max_pack_size == 0 || self.max_pack_size > MAX_PACK_SIZE_LIMIT {
            return Err(StrataError::InvalidFormat(format!(
                "invalid max_pack_size: {}",
                self.max_pack_size
            )));
        }
        Ok(())
    }

    /// Unwrap the master key with the given password.
    pub fn unwrap_master_key(&self, password: &str) -> Result<MasterKey> {
        let wrapping_key = self
            .key_derivation_algorithm
            .derive_key(password, &self.kdf_salt)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .expect("valid 32-byte wrapping key");
        if self.wrapped_master_key.nonce.len() != 12 {
            return Err(StrataError::MacFailed);
        }
        let nonce = Nonce::from_slice(&self.wrapped_master_key.nonce);
        let plaintext = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: self.wrapped_master_key.ciphertext.as_ref(),
                    aad: &self.unique_id,
                },
            )
            .map_err(|_| StrataError::MacFailed)?;
        let plaintext = Zeroizing::new(plaintext);
        let bytes: [u8; 32] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| StrataError::MacFailed)?;
        Ok(MasterKey::from_bytes(bytes))
    }

    /// Rewrap the master key under a new password. The master key, and with
    /// it every content key, is unchanged.
    pub fn change_password(&mut self, old_password: &str, new_password: &str) -> Result<()> {
        let master = self.unwrap_master_key(old_password)?;
        let mut salt = vec![0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        self.wrapped_master_key = wrap_master_key(
            &master,
            new_password,
            self.key_derivation_algorithm,
            &salt,
            &self.unique_id,
        )?;
        self.kdf_salt = salt;
        Ok(())
    }
}

fn wrap_master_key(
    master: &MasterKey,
    password: &str,
    kdf: KeyDerivationAlgorithm,
    salt: &[u8],
    unique_id: &[u8],
) -> Result<WrappedKey> {
    let wrapping_key = kdf.derive_key(password, salt)?;
    let cipher =
        Aes256Gcm::new_from_slice(wrapping_key.as_ref()).expect("valid 32-byte wrapping key");
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: master.as_bytes().as_ref(),
                aad: unique_id,
            },
        )
        .map_err(|e| StrataError::KeyDerivation(format!("wrap master key: {e}")))?;
    Ok(WrappedKey {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Place an upgrade lock: back up the current format blob under the owner's
/// name, then store the locked format with the target version.
pub fn set_upgrade_lock(
    storage: &dyn BlobStorage,
    format: &mut RepositoryFormat,
    lock: UpgradeLock,
) -> Result<()> {
    if lock.new_format_version > MAX_SUPPORTED_FORMAT_VERSION {
        return Err(StrataError::FormatIncompatible(format!(
            "cannot upgrade to unknown format version {}",
            lock.new_format_version
        )));
    }
    if format.upgrade_lock.is_some() {
        return Err(StrataError::LockBusy(
            format
                .upgrade_lock
                .as_ref()
                .map(|l| l.owner_id.clone())
                .unwrap_or_default(),
        ));
    }

    let current = crate::blob::get_full(storage, &BlobId::from(FORMAT_BLOB_ID))?;
    let backup_id = BlobId::new(format!("{FORMAT_BACKUP_PREFIX}{}", lock.owner_id));
    storage.put(&backup_id, &current, &PutOptions::default())?;
    info!(owner = %lock.owner_id, version = lock.new_format_version, "placed upgrade lock");

    format.format_version = lock.new_format_version;
    format.upgrade_lock = Some(lock);
    format.store(storage)
}

/// Roll back an in-progress upgrade: restore the newest backup byte-for-byte
/// and delete every backup blob.
pub fn rollback_upgrade(storage: &dyn BlobStorage) -> Result<RepositoryFormat> {
    let backups = crate::blob::list_all(storage, FORMAT_BACKUP_PREFIX)?;
    let newest = backups
        .iter()
        .max_by_key(|m| m.timestamp)
        .ok_or_else(|| StrataError::InvalidFormat("no format blob backups found".into()))?;

    let bytes = crate::blob::get_full(storage, &newest.id)?;
    storage.put(&BlobId::from(FORMAT_BLOB_ID), &bytes, &PutOptions::default())?;
    for backup in &backups {
        storage.delete(&backup.id)?;
    }
    info!(restored_from = %newest.id, "rolled back format upgrade");

    let format: RepositoryFormat = serde_json::from_slice(&bytes)?;
    format.validate()?;
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryStorage;

    fn test_options() -> FormatOptions {
        FormatOptions {
            key_derivation_algorithm: KeyDerivationAlgorithm::TestingOnlyInsecure,
            ..Default::default()
        }
    }

    #[test]
    fn initialize_and_unwrap() {
        let (format, master) = RepositoryFormat::initialize("pw", &test_options()).unwrap();
        let unwrapped = format.unwrap_master_key("pw").unwrap();
        assert_eq!(master.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn wrong_password_fails_mac() {
        let (format, _) = RepositoryFormat::initialize("pw", &test_options()).unwrap();
        assert!(matches!(
            format.unwrap_master_key("wrong"),
            Err(StrataError::MacFailed)
        ));
    }

    #[test]
    fn store_load_roundtrip() {
        let storage = MemoryStorage::new();
        let (format, _) = RepositoryFormat::initialize("pw", &test_options()).unwrap();
        format.store(&storage).unwrap();
        let loaded = RepositoryFormat::load(&storage).unwrap();
        assert_eq!(loaded.unique_id, format.unique_id);
        assert_eq!(loaded.format_version, format.format_version);
        assert!(loaded.unwrap_master_key("pw").is_ok());
    }

    #[test]
    fn change_password_preserves_master_key() {
        let (mut format, master) = RepositoryFormat::initialize("old", &test_options()).unwrap();
        format.change_password("old", "new").unwrap();
        assert!(matches!(
            format.unwrap_master_key("old"),
            Err(StrataError::MacFailed)
        ));
        let unwrapped = format.unwrap_master_key("new").unwrap();
        assert_eq!(master.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn upgrade_lock_and_rollback_restores_exact_bytes() {
        let storage = MemoryStorage::new();
        let mut opts = test_options();
        opts.format_version = 1;
        let (mut format, _) = RepositoryFormat::initialize("pw", &opts).unwrap();
        format.store(&storage).unwrap();
        let original_bytes =
            crate::blob::get_full(&storage, &BlobId::from(FORMAT_BLOB_ID)).unwrap();

        set_upgrade_lock(
            &storage,
            &mut format,
            UpgradeLock {
                owner_id: "admin@host".into(),
                created_at: Utc::now(),
                advance_notice_seconds: 3600,
                new_format_version: 2,
            },
        )
        .unwrap();

        let locked = RepositoryFormat::load(&storage).unwrap();
        assert_eq!(locked.format_version, 2);
        assert!(locked.upgrade_lock.is_some());

        let restored = rollback_upgrade(&storage).unwrap();
        assert_eq!(restored.format_version, 1);
        assert!(restored.upgrade_lock.is_none());
        let restored_bytes =
            crate::blob::get_full(&storage, &BlobId::from(FORMAT_BLOB_ID)).unwrap();
        assert_eq!(restored_bytes, original_bytes);
        assert!(crate::blob::list_all(&storage, FORMAT_BACKUP_PREFIX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn second_upgrade_lock_is_busy() {
        let storage = MemoryStorage::new();
        let (mut format, _) = RepositoryFormat::initialize("pw", &test_options()).unwrap();
        format.store(&storage).unwrap();
        let lock = UpgradeLock {
            owner_id: "a".into(),
            created_at: Utc::now(),
            advance_notice_seconds: 0,
            new_format_version: 2,
        };
        set_upgrade_lock(&storage, &mut format, lock.clone()).unwrap();
        assert!(matches!(
            set_upgrade_lock(&storage, &mut format, lock),
            Err(StrataError::LockBusy(_))
        ));
    }

    #[test]
    fn oversized_pack_limit_rejected() {
        let opts = FormatOptions {
            max_pack_size: MAX_PACK_SIZE_LIMIT + 1,
            ..test_options()
        };
        assert!(RepositoryFormat::initialize("pw", &opts).is_err());
    }
}
