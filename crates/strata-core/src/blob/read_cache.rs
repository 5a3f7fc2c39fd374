use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, Capacity, PutOptions, FULL_BLOB};

/// Per-blob caching decision, taken from the blob id (typically its kind
/// prefix).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Serve reads from a locally cached copy of the full blob; fill the
    /// cache on miss and on local writes.
    Cache,
    /// Forward without caching; local deletes still drop any stale copy.
    PassThrough,
    /// Forward without caching and without touching the cache at all.
    Ignore,
}

pub type ActionFn = dyn Fn(&BlobId) -> CacheAction + Send + Sync;

/// Wrapper serving range reads from locally cached full-blob data.
///
/// Metadata blobs (`n`, `m`, `l`) are read whole repeatedly at session open;
/// caching them locally turns refreshes into local reads.
pub struct ReadCachingStorage {
    inner: Arc<dyn BlobStorage>,
    cache: Arc<dyn BlobStorage>,
    action: Box<ActionFn>,
}

impl ReadCachingStorage {
    pub fn new(
        inner: Arc<dyn BlobStorage>,
        cache: Arc<dyn BlobStorage>,
        action: Box<ActionFn>,
    ) -> Self {
        Self {
            inner,
            cache,
            action,
        }
    }

    /// Cache metadata blobs (`n`, `m`, `l`); pass packs and format blobs
    /// through untouched.
    pub fn metadata_action() -> Box<ActionFn> {
        Box::new(|id: &BlobId| match id.kind_prefix() {
            Some('n') | Some('m') | Some('l') => CacheAction::Cache,
            _ => CacheAction::PassThrough,
        })
    }

    fn slice_range(data: Vec<u8>, offset: u64, length: i64) -> Result<Vec<u8>> {
        let total = data.len() as u64;
        if length < FULL_BLOB || offset > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        if length == FULL_BLOB {
            return Ok(data[offset as usize..].to_vec());
        }
        let end = offset + length as u64;
        if end > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        Ok(data[offset as usize..end as usize].to_vec())
    }
}

impl BlobStorage for ReadCachingStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        self.inner.list(prefix, cb)
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        if (self.action)(id) != CacheAction::Cache {
            return self.inner.get(id, offset, length);
        }

        if let Ok(cached) = crate::blob::get_full(&*self.cache, id) {
            return Self::slice_range(cached, offset, length);
        }

        let full = crate::blob::get_full(&*self.inner, id)?;
        if let Err(e) = self.cache.put(id, &full, &PutOptions::default()) {
            debug!(%id, "unable to cache blob: {e}");
        }
        Self::slice_range(full, offset, length)
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        self.inner.put(id, data, opts)?;
        if (self.action)(id) == CacheAction::Cache {
            if let Err(e) = self.cache.put(id, data, &PutOptions::default()) {
                debug!(%id, "unable to cache written blob: {e}");
            }
        }
        Ok(())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        let result = self.inner.delete(id);
        if (self.action)(id) != CacheAction::Ignore {
            let _ = self.cache.delete(id);
        }
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

    fn setup() -> (Arc<MemoryStorage>, Arc<MemoryStorage>, ReadCachingStorage) {
        let backend = Arc::new(MemoryStorage::new());
        let cache = Arc::new(MemoryStorage::new());
        let wrapper = ReadCachingStorage::new(
            backend.clone(),
            cache.clone(),
            ReadCachingStorage::metadata_action(),
        );
        (backend, cache, wrapper)
    }

    #[test]
    fn cached_read_survives_backend_loss() {
        let (backend, _cache, wrapper) = setup();
        backend
            .put(&BlobId::from("n01"), b"index data", &PutOptions::default())
            .unwrap();

        assert_eq!(
            crate::blob::get_full(&wrapper, &BlobId::from("n01")).unwrap(),
            b"index data"
        );

        // Remove from the backend: the cached copy still serves reads.
        backend.delete(&BlobId::from("n01")).unwrap();
        assert_eq!(
            crate::blob::get_full(&wrapper, &BlobId::from("n01")).unwrap(),
            b"index data"
        );
    }

    #[test]
    fn range_reads_are_served_from_cached_blob() {
        let (backend, _cache, wrapper) = setup();
        backend
            .put(&BlobId::from("n01"), b"0123456789", &PutOptions::default())
            .unwrap();
        assert_eq!(wrapper.get(&BlobId::from("n01"), 2, 4).unwrap(), b"2345");
        assert_eq!(wrapper.get(&BlobId::from("n01"), 7, FULL_BLOB).unwrap(), b"789");
    }

    #[test]
    fn pack_blobs_are_not_cached() {
        let (backend, cache, wrapper) = setup();
        backend
            .put(&BlobId::from("p01"), b"pack", &PutOptions::default())
            .unwrap();
        let _ = crate::blob::get_full(&wrapper, &BlobId::from("p01")).unwrap();
        assert!(crate::blob::get_full(&*cache, &BlobId::from("p01")).is_err());
    }

    #[test]
    fn delete_drops_cached_copy() {
        let (_backend, cache, wrapper) = setup();
        wrapper
            .put(&BlobId::from("n01"), b"index", &PutOptions::default())
            .unwrap();
        assert!(crate::blob::get_full(&*cache, &BlobId::from("n01")).is_ok());
        wrapper.delete(&BlobId::from("n01")).unwrap();
        assert!(crate::blob::get_full(&*cache, &BlobId::from("n01")).is_err());
    }
}
