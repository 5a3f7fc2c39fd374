use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use strata_types::error::{Result, StrataError};

use crate::crypto::keyderiv::KeyDerivationAlgorithm;

use super::{ManifestStore, TYPE_LABEL};

/// Manifest type of user profile records.
pub const USER_MANIFEST_TYPE: &str = "user";
/// Label holding the profile's username; the dedupe key for replacement.
pub const USERNAME_LABEL: &str = "username";

/// A server-side user profile, stored as a `type=user` manifest keyed by
/// username. Writing a profile replaces any earlier profile for the same
/// user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub enabled: bool,
    pub password_salt: String,
    pub password_hash: String,
}

impl UserProfile {
    pub fn new(username: impl Into<String>, password: &str) -> Result<Self> {
        let mut profile = Self {
            username: username.into(),
            enabled: true,
            password_salt: String::new(),
            password_hash: String::new(),
        };
        profile.set_password(password)?;
        Ok(profile)
    }

    pub fn set_password(&mut self, password: &str) -> Result<()> {
        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let hash = KeyDerivationAlgorithm::Scrypt.derive_key(password, &salt)?;
        self.password_salt = hex::encode(salt);
        self.password_hash = hex::encode(*hash);
        Ok(())
    }

    /// Constant-time password check.
    pub fn verify_password(&self, password: &str) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        let salt = hex::decode(&self.password_salt)
            .map_err(|_| StrataError::InvalidFormat("corrupt password salt".into()))?;
        let expected = hex::decode(&self.password_hash)
            .map_err(|_| StrataError::InvalidFormat("corrupt password hash".into()))?;
        let derived = KeyDerivationAlgorithm::Scrypt.derive_key(password, &salt)?;
        Ok(derived.ct_eq(expected.as_slice()).into())
    }
}

fn profile_labels(username: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(TYPE_LABEL.to_string(), USER_MANIFEST_TYPE.to_string());
    labels.insert(USERNAME_LABEL.to_string(), username.to_string());
    labels
}

/// Store a profile, replacing any earlier profile for the same username.
pub fn set_user_profile(store: &ManifestStore, profile: &UserProfile) -> Result<()> {
    if profile.username.is_empty() || !profile.username.contains('@') {
        return Err(StrataError::Config(format!(
            "username must be 'user@host', got '{}'",
            profile.username
        )));
    }
    let payload = serde_json::to_vec(profile)?;
    store.replace(profile_labels(&profile.username), USERNAME_LABEL, &payload)?;
    Ok(())
}

/// Look up a profile by username.
pub fn get_user_profile(store: &ManifestStore, username: &str) -> Result<UserProfile> {
    let entries = store.find(&profile_labels(username));
    // Newest entry wins if an uncompacted duplicate is present.
    let entry = entries
        .last()
        .ok_or_else(|| StrataError::ManifestNotFound(format!("user '{username}'")))?;
    let (_, profile) = store.get_typed::<UserProfile>(&entry.id)?;
    Ok(profile)
}

/// All profiles, one per username (newest wins), sorted by username.
pub fn list_user_profiles(store: &ManifestStore) -> Result<Vec<UserProfile>> {
    let mut filter = BTreeMap::new();
    filter.insert(TYPE_LABEL.to_string(), USER_MANIFEST_TYPE.to_string());
    let mut by_user: BTreeMap<String, UserProfile> = BTreeMap::new();
    for entry in store.find(&filter) {
        let (_, profile) = store.get_typed::<UserProfile>(&entry.id)?;
        by_user.insert(profile.username.clone(), profile);
    }
    Ok(by_user.into_values().collect())
}

/// Delete a user's profile. Deleting a missing user is a no-op.
pub fn delete_user_profile(store: &ManifestStore, username: &str) -> Result<()> {
    for entry in store.find(&profile_labels(username)) {
        store.delete(&entry.id)?;
    }
    Ok(())
}
