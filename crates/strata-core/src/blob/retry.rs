use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, Capacity, PutOptions};

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
        }
    }
}

/// Wrapper retrying `Unavailable` errors with exponential backoff + jitter.
/// Reads, listings, and deletes retry; `put` is retried as well because the
/// contract requires idempotence for identical bytes under the same id.
pub struct RetryingStorage {
    inner: Arc<dyn BlobStorage>,
    policy: RetryPolicy,
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn BlobStorage>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn retry<T>(&self, op_name: &str, f: impl Fn() -> Result<T>) -> Result<T> {
        let mut delay_ms = self.policy.initial_delay_ms;
        let mut last_err = None;

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(self.policy.max_delay_ms);
            }
            match f() {
                Ok(val) => return Ok(val),
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    warn!(
                        "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                        attempt + 1,
                        self.policy.max_retries,
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| StrataError::Other(format!("{op_name}: retries exhausted"))))
    }
}

impl BlobStorage for RetryingStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        // Listings buffer before dispatch so a retried attempt does not
        // replay entries into the callback.
        let metas = self.retry("list", || {
            let mut out = Vec::new();
            self.inner.list(prefix, &mut |meta| {
                out.push(meta);
                Ok(())
            })?;
            Ok(out)
        })?;
        for meta in metas {
            cb(meta)?;
        }
        Ok(())
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        self.retry("get", || self.inner.get(id, offset, length))
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        self.retry("put", || self.inner.put(id, data, opts))
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        self.retry("delete", || self.inner.delete(id))
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend that fails the first N calls with `Unavailable`.
    struct FlakyStorage {
        fail_count: AtomicU32,
        data: Mutex<Option<Vec<u8>>>,
    }

    impl FlakyStorage {
        fn new(failures: u32) -> Self {
            Self {
                fail_count: AtomicU32::new(failures),
                data: Mutex::new(Some(b"payload".to_vec())),
            }
        }

        fn maybe_fail(&self) -> Result<()> {
            if self.fail_count.load(Ordering::SeqCst) > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                return Err(StrataError::Unavailable("simulated outage".into()));
            }
            Ok(())
        }
    }

    impl BlobStorage for FlakyStorage {
        fn list(
            &self,
            _prefix: &str,
            _cb: &mut dyn FnMut(BlobMetadata) -> Result<()>,
        ) -> Result<()> {
            self.maybe_fail()
        }
        fn get(&self, _id: &BlobId, _offset: u64, _length: i64) -> Result<Vec<u8>> {
            self.maybe_fail()?;
            Ok(self.data.lock().unwrap().clone().unwrap())
        }
        fn put(&self, _id: &BlobId, _data: &[u8], _opts: &PutOptions) -> Result<()> {
            self.maybe_fail()
        }
        fn delete(&self, _id: &BlobId) -> Result<()> {
            self.maybe_fail()
        }
        fn display_name(&self) -> String {
            "flaky".into()
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn transient_errors_are_retried() {
        let storage = RetryingStorage::new(Arc::new(FlakyStorage::new(2)), fast_policy());
        let data = storage.get(&BlobId::from("p01"), 0, -1).unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn retries_exhaust_and_surface() {
        let storage = RetryingStorage::new(Arc::new(FlakyStorage::new(10)), fast_policy());
        assert!(matches!(
            storage.get(&BlobId::from("p01"), 0, -1),
            Err(StrataError::Unavailable(_))
        ));
    }

    #[test]
    fn non_retryable_errors_pass_through() {
        struct DeniedStorage;
        impl BlobStorage for DeniedStorage {
            fn list(
                &self,
                _p: &str,
                _cb: &mut dyn FnMut(BlobMetadata) -> Result<()>,
            ) -> Result<()> {
                Err(StrataError::PermissionDenied("acl".into()))
            }
            fn get(&self, _id: &BlobId, _o: u64, _l: i64) -> Result<Vec<u8>> {
                Err(StrataError::PermissionDenied("acl".into()))
            }
            fn put(&self, _id: &BlobId, _d: &[u8], _o: &PutOptions) -> Result<()> {
                Err(StrataError::PermissionDenied("acl".into()))
            }
            fn delete(&self, _id: &BlobId) -> Result<()> {
                Err(StrataError::PermissionDenied("acl".into()))
            }
            fn display_name(&self) -> String {
                "denied".into()
            }
        }

        let storage = RetryingStorage::new(Arc::new(DeniedStorage), fast_policy());
        assert!(matches!(
            storage.get(&BlobId::from("p01"), 0, -1),
            Err(StrataError::PermissionDenied(_))
        ));
    }
}
