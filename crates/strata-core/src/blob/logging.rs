use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::debug;

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::Result;

use crate::blob::{BlobStorage, Capacity, PutOptions};

/// Wrapper that logs each backend call with its duration at debug level.
/// Sits directly above the driver so retries are visible as repeated calls.
pub struct LoggingStorage {
    inner: Arc<dyn BlobStorage>,
}

impl LoggingStorage {
    pub fn new(inner: Arc<dyn BlobStorage>) -> Self {
        Self { inner }
    }
}

impl BlobStorage for LoggingStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        let start = Instant::now();
        let mut count = 0usize;
        let result = self.inner.list(prefix, &mut |meta| {
            count += 1;
            cb(meta)
        });
        debug!(
            prefix,
            count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "blob list"
        );
        result
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        let start = Instant::now();
        let result = self.inner.get(id, offset, length);
        debug!(
            %id,
            offset,
            length,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "blob get"
        );
        result
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.put(id, data, opts);
        debug!(
            %id,
            bytes = data.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "blob put"
        );
        result
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.delete(id);
        debug!(
            %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "blob delete"
        );
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
