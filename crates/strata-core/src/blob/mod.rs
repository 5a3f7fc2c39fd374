pub mod filesystem;
pub mod list_cache;
pub mod logging;
pub mod memory;
pub mod read_cache;
pub mod retry;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::Result;

/// Read the whole blob in `get` calls.
pub const FULL_BLOB: i64 = -1;

/// Options for [`BlobStorage::put`].
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Fail with `BlobAlreadyExists` when the blob exists and the backend
    /// supports uniqueness. Backends without uniqueness overwrite
    /// (last-writer-wins); putting identical bytes must stay idempotent.
    pub if_not_exists: bool,
    /// Backdate or otherwise pin the stored timestamp; used by backends that
    /// support it, ignored elsewhere.
    pub set_mod_time: Option<DateTime<Utc>>,
}

/// Reported storage capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub size_bytes: u64,
    pub free_bytes: u64,
}

/// Uniform interface over an object store holding listable, immutable-ish
/// named opaque blobs. Every operation is individually atomic; the store is
/// shared by all sessions in a process.
pub trait BlobStorage: Send + Sync {
    /// Yield metadata for every blob whose id starts with `prefix`, in
    /// unspecified order.
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()>;

    /// Read `length` bytes starting at `offset`; `length == FULL_BLOB` reads
    /// to the end. A negative or past-end range is `InvalidRange`.
    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>>;

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()>;

    /// Delete a blob; a missing id is `BlobNotFound` (callers usually treat
    /// that as success).
    fn delete(&self, id: &BlobId) -> Result<()>;

    /// Adjust a blob's stored timestamp. Optional; `SetTimeUnsupported` when
    /// the backend cannot.
    fn set_time(&self, _id: &BlobId, _ts: DateTime<Utc>) -> Result<()> {
        Err(strata_types::error::StrataError::SetTimeUnsupported)
    }

    /// Total/free capacity of the underlying volume. Optional.
    fn get_capacity(&self) -> Result<Capacity> {
        Err(strata_types::error::StrataError::CapacityUnknown)
    }

    fn display_name(&self) -> String;

    fn is_read_only(&self) -> bool {
        false
    }
}

impl BlobStorage for Arc<dyn BlobStorage> {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        (**self).list(prefix, cb)
    }
    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        (**self).get(id, offset, length)
    }
    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        (**self).put(id, data, opts)
    }
    fn delete(&self, id: &BlobId) -> Result<()> {
        (**self).delete(id)
    }
    fn set_time(&self, id: &BlobId, ts: DateTime<Utc>) -> Result<()> {
        (**self).set_time(id, ts)
    }
    fn get_capacity(&self) -> Result<Capacity> {
        (**self).get_capacity()
    }
    fn display_name(&self) -> String {
        (**self).display_name()
    }
    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
}

/// Collect a full listing for a prefix.
pub fn list_all(storage: &dyn BlobStorage, prefix: &str) -> Result<Vec<BlobMetadata>> {
    let mut out = Vec::new();
    storage.list(prefix, &mut |meta| {
        out.push(meta);
        Ok(())
    })?;
    Ok(out)
}

/// Fetch an entire blob.
pub fn get_full(storage: &dyn BlobStorage, id: &BlobId) -> Result<Vec<u8>> {
    storage.get(id, 0, FULL_BLOB)
}
