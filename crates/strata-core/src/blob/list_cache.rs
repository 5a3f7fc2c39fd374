use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::Result;

use crate::blob::{BlobStorage, Capacity, PutOptions};
use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;

/// Serialized cache entry: this JSON followed by a 32-byte HMAC-SHA256 tag.
#[derive(Debug, Serialize, Deserialize)]
struct CachedListing {
    expire_after: DateTime<Utc>,
    blobs: Vec<BlobMetadata>,
}

/// Wrapper that caches the most recent listing of a fixed set of prefixes
/// (typically `n` and `m`) for a short TTL, amortising expensive LIST calls.
///
/// Entries are persisted in a local cache store, HMAC-signed so a tampered
/// cache degrades to a fresh listing rather than forged results. Any local
/// PUT or DELETE whose id matches a cached prefix drops that prefix's entry.
pub struct ListCacheStorage {
    inner: Arc<dyn BlobStorage>,
    cache: Arc<dyn BlobStorage>,
    prefixes: Vec<String>,
    ttl: Duration,
    hmac_secret: [u8; 32],
    clock: Arc<dyn Clock>,
}

impl ListCacheStorage {
    pub fn new(
        inner: Arc<dyn BlobStorage>,
        cache: Arc<dyn BlobStorage>,
        prefixes: &[&str],
        ttl: Duration,
        hmac_secret: [u8; 32],
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            cache,
            prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            ttl,
            hmac_secret,
            clock,
        }
    }

    fn is_cached_prefix(&self, prefix: &str) -> bool {
        self.prefixes.iter().any(|p| p == prefix)
    }

    fn cache_entry_id(prefix: &str) -> BlobId {
        BlobId::new(format!("list-{prefix}"))
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret).expect("any key length works");
        mac.update(payload);
        let tag = mac.finalize().into_bytes();
        let mut out = Vec::with_capacity(payload.len() + TAG_LEN);
        out.extend_from_slice(payload);
        out.extend_from_slice(&tag);
        out
    }

    fn verify_and_strip<'a>(&self, data: &'a [u8]) -> Option<&'a [u8]> {
        if data.len() < TAG_LEN {
            return None;
        }
        let (payload, tag) = data.split_at(data.len() - TAG_LEN);
        let mut mac = HmacSha256::new_from_slice(&self.hmac_secret).expect("any key length works");
        mac.update(payload);
        mac.verify_slice(tag).ok()?;
        Some(payload)
    }

    fn read_cached(&self, prefix: &str) -> Option<Vec<BlobMetadata>> {
        let data = crate::blob::get_full(&*self.cache, &Self::cache_entry_id(prefix)).ok()?;
        let payload = self.verify_and_strip(&data).or_else(|| {
            debug!(prefix, "invalid list cache HMAC, ignoring");
            None
        })?;
        let listing: CachedListing = serde_json::from_slice(payload).ok()?;
        if self.clock.now() >= listing.expire_after {
            return None;
        }
        Some(listing.blobs)
    }

    fn save_cached(&self, prefix: &str, blobs: &[BlobMetadata]) {
        let listing = CachedListing {
            expire_after: self.clock.now() + self.ttl,
            blobs: blobs.to_vec(),
        };
        let Ok(payload) = serde_json::to_vec(&listing) else {
            return;
        };
        let signed = self.sign(&payload);
        if let Err(e) = self
            .cache
            .put(&Self::cache_entry_id(prefix), &signed, &PutOptions::default())
        {
            debug!(prefix, "unable to persist list cache entry: {e}");
        }
    }

    fn invalidate_for(&self, id: &BlobId) {
        for prefix in &self.prefixes {
            if id.as_str().starts_with(prefix.as_str()) {
                let _ = self.cache.delete(&Self::cache_entry_id(prefix));
            }
        }
    }
}

impl BlobStorage for ListCacheStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        if !self.is_cached_prefix(prefix) {
            return self.inner.list(prefix, cb);
        }

        let blobs = match self.read_cached(prefix) {
            Some(blobs) => blobs,
            None => {
                let blobs = crate::blob::list_all(&*self.inner, prefix)?;
                self.save_cached(prefix, &blobs);
                blobs
            }
        };

        for meta in blobs {
            cb(meta)?;
        }
        Ok(())
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        self.inner.get(id, offset, length)
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        let result = self.inner.put(id, data, opts);
        if result.is_ok() {
            self.invalidate_for(id);
        }
        result
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        let result = self.inner.delete(id);
        self.invalidate_for(id);
        result
    }

    fn set_time(&self, id: &BlobId, ts: DateTime<Utc>) -> Result<()> {
        self.inner.set_time(id, ts)
    }

    fn get_capacity(&self) -> Result<Capacity> {
        self.inner.get_capacity()
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::memory::MemoryStorage;
    use crate::clock::system_clock;

    fn setup() -> (Arc<MemoryStorage>, Arc<MemoryStorage>, ListCacheStorage) {
        let backend = Arc::new(MemoryStorage::new());
        let cache = Arc::new(MemoryStorage::new());
        let wrapper = ListCacheStorage::new(
            backend.clone(),
            cache.clone(),
            &["n", "m"],
            Duration::seconds(60),
            [0x42; 32],
            system_clock(),
        );
        (backend, cache, wrapper)
    }

    fn put(storage: &dyn BlobStorage, id: &str) {
        storage
            .put(&BlobId::from(id), b"x", &PutOptions::default())
            .unwrap();
    }

    #[test]
    fn second_list_is_served_from_cache() {
        let (backend, _cache, wrapper) = setup();
        put(&*backend, "n01");

        assert_eq!(crate::blob::list_all(&wrapper, "n").unwrap().len(), 1);

        // Write directly to the backend, bypassing the wrapper: the cached
        // listing must mask it until the TTL expires or a local write lands.
        put(&*backend, "n02");
        assert_eq!(crate::blob::list_all(&wrapper, "n").unwrap().len(), 1);
    }

    #[test]
    fn local_put_invalidates_prefix() {
        let (_backend, _cache, wrapper) = setup();
        put(&wrapper, "n01");
        assert_eq!(crate::blob::list_all(&wrapper, "n").unwrap().len(), 1);

        put(&wrapper, "n02");
        let listed = crate::blob::list_all(&wrapper, "n").unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn uncached_prefixes_pass_through() {
        let (backend, cache, wrapper) = setup();
        put(&*backend, "p01");
        assert_eq!(crate::blob::list_all(&wrapper, "p").unwrap().len(), 1);
        // No cache entry was written for "p".
        assert!(crate::blob::list_all(&*cache, "list-p").unwrap().is_empty());
    }

    #[test]
    fn tampered_cache_entry_is_ignored() {
        let (backend, cache, wrapper) = setup();
        put(&*backend, "n01");
        assert_eq!(crate::blob::list_all(&wrapper, "n").unwrap().len(), 1);

        // Corrupt the signed payload.
        let entry_id = BlobId::from("list-n");
        let mut data = crate::blob::get_full(&*cache, &entry_id).unwrap();
        data[0] ^= 0xFF;
        cache.put(&entry_id, &data, &PutOptions::default()).unwrap();

        put(&*backend, "n02");
        // Invalid HMAC forces a fresh listing, which sees both blobs.
        assert_eq!(crate::blob::list_all(&wrapper, "n").unwrap().len(), 2);
    }
}
