use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, Capacity, PutOptions, FULL_BLOB};
use crate::clock::{system_clock, Clock};

struct StoredBlob {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
}

/// In-memory backend. Timestamps come from the injected clock so maintenance
/// timing is testable; the map is ordered so listings are deterministic.
pub struct MemoryStorage {
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    clock: Arc<dyn Clock>,
    read_only: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            clock,
            read_only: false,
        }
    }

    pub fn read_only(clock: Arc<dyn Clock>) -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            clock,
            read_only: true,
        }
    }

    /// Total bytes stored across blobs matching `prefix` (test helper).
    pub fn total_bytes_with_prefix(&self, prefix: &str) -> u64 {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(_, b)| b.data.len() as u64)
            .sum()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStorage for MemoryStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        let metas: Vec<BlobMetadata> = {
            let blobs = self.blobs.lock().unwrap();
            blobs
                .range(prefix.to_string()..)
                .take_while(|(id, _)| id.starts_with(prefix))
                .map(|(id, b)| BlobMetadata {
                    id: BlobId::new(id.clone()),
                    length: b.data.len() as u64,
                    timestamp: b.timestamp,
                })
                .collect()
        };
        // Dispatch outside the lock so callbacks may re-enter the store.
        for meta in metas {
            cb(meta)?;
        }
        Ok(())
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get(id.as_str())
            .ok_or_else(|| StrataError::BlobNotFound(id.to_string()))?;

        let total = blob.data.len() as u64;
        if length < FULL_BLOB || offset > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        if length == FULL_BLOB {
            return Ok(blob.data[offset as usize..].to_vec());
        }
        let end = offset + length as u64;
        if end > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        Ok(blob.data[offset as usize..end as usize].to_vec())
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        self.check_writable()?;
        id.validate()?;
        let mut blobs = self.blobs.lock().unwrap();
        if opts.if_not_exists && blobs.contains_key(id.as_str()) {
            return Err(StrataError::BlobAlreadyExists(id.to_string()));
        }
        let timestamp = opts.set_mod_time.unwrap_or_else(|| self.clock.now());
        blobs.insert(
            id.as_str().to_string(),
            StoredBlob {
                data: data.to_vec(),
                timestamp,
            },
        );
        Ok(())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        self.check_writable()?;
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.remove(id.as_str()) {
            Some(_) => Ok(()),
            None => Err(StrataError::BlobNotFound(id.to_string())),
        }
    }

    fn set_time(&self, id: &BlobId, ts: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.get_mut(id.as_str()) {
            Some(blob) => {
                blob.timestamp = ts;
                Ok(())
            }
            None => Err(StrataError::BlobNotFound(id.to_string())),
        }
    }

    fn get_capacity(&self) -> Result<Capacity> {
        let used: u64 = {
            let blobs = self.blobs.lock().unwrap();
            blobs.values().map(|b| b.data.len() as u64).sum()
        };
        Ok(Capacity {
            size_bytes: u64::MAX,
            free_bytes: u64::MAX - used,
        })
    }

    fn display_name(&self) -> String {
        "memory".into()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{get_full, list_all};

    fn put_simple(s: &MemoryStorage, id: &str, data: &[u8]) {
        s.put(&BlobId::from(id), data, &PutOptions::default()).unwrap();
    }

    #[test]
    fn put_get_roundtrip() {
        let s = MemoryStorage::new();
        put_simple(&s, "pabc", b"hello");
        assert_eq!(get_full(&s, &BlobId::from("pabc")).unwrap(), b"hello");
    }

    #[test]
    fn get_missing_is_not_found() {
        let s = MemoryStorage::new();
        assert!(matches!(
            get_full(&s, &BlobId::from("pnope")),
            Err(StrataError::BlobNotFound(_))
        ));
    }

    #[test]
    fn range_reads() {
        let s = MemoryStorage::new();
        put_simple(&s, "pabc", b"hello world");
        assert_eq!(s.get(&BlobId::from("pabc"), 6, 5).unwrap(), b"world");
        assert_eq!(s.get(&BlobId::from("pabc"), 6, FULL_BLOB).unwrap(), b"world");
        assert!(matches!(
            s.get(&BlobId::from("pabc"), 6, 100),
            Err(StrataError::InvalidRange { .. })
        ));
        assert!(matches!(
            s.get(&BlobId::from("pabc"), 100, 1),
            Err(StrataError::InvalidRange { .. })
        ));
    }

    #[test]
    fn list_filters_by_prefix() {
        let s = MemoryStorage::new();
        put_simple(&s, "p01", b"a");
        put_simple(&s, "p02", b"b");
        put_simple(&s, "n01", b"c");
        let packs = list_all(&s, "p").unwrap();
        assert_eq!(packs.len(), 2);
        assert!(packs.iter().all(|m| m.id.has_prefix('p')));
    }

    #[test]
    fn put_if_not_exists_conflicts() {
        let s = MemoryStorage::new();
        put_simple(&s, "p01", b"a");
        let opts = PutOptions {
            if_not_exists: true,
            ..Default::default()
        };
        assert!(matches!(
            s.put(&BlobId::from("p01"), b"b", &opts),
            Err(StrataError::BlobAlreadyExists(_))
        ));
    }

    #[test]
    fn delete_missing_is_distinguished() {
        let s = MemoryStorage::new();
        assert!(matches!(
            s.delete(&BlobId::from("p01")),
            Err(StrataError::BlobNotFound(_))
        ));
    }

    #[test]
    fn set_time_updates_listing() {
        use chrono::TimeZone;
        let s = MemoryStorage::new();
        put_simple(&s, "p01", b"a");
        let ts = Utc.with_ymd_and_hms(2020, 5, 1, 12, 0, 0).unwrap();
        s.set_time(&BlobId::from("p01"), ts).unwrap();
        let metas = list_all(&s, "p").unwrap();
        assert_eq!(metas[0].timestamp, ts);
    }
}
