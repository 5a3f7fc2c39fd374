use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, warn};

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, PutOptions, FULL_BLOB};
use crate::clock::{system_clock, Clock};

/// Local cache pack files rotate at this size.
pub const CACHE_PACK_SIZE: u64 = 20 * 1024 * 1024;

const PACK_FILE_PREFIX: &str = "pack-";

/// Content-addressed local cache that re-packs many small cached entries
/// into large local pack files.
///
/// Implements the blob interface so it can sit behind the read-cache and
/// list-cache wrappers. The in-memory index is rebuilt by scanning the pack
/// files on open; entries carry an LRU touch time and whole pack files are
/// evicted, least-recently-touched first, when the on-disk total exceeds
/// the budget.
pub struct PackedCache {
    directory: PathBuf,
    max_bytes: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    index: HashMap<String, CacheSlot>,
    /// Newest touch time per pack file, driving eviction order.
    pack_touch: HashMap<String, DateTime<Utc>>,
    current_pack: Option<String>,
    total_bytes: u64,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    pack_file: String,
    offset: u64,
    length: u64,
}

impl PackedCache {
    pub fn open(directory: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        Self::open_with_clock(directory, max_bytes, system_clock())
    }

    pub fn open_with_clock(
        directory: impl Into<PathBuf>,
        max_bytes: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let directory: PathBuf = directory.into();
        fs::create_dir_all(&directory)?;
        let cache = Self {
            directory,
            max_bytes,
            clock,
            state: Mutex::new(CacheState::default()),
        };
        cache.rebuild_index()?;
        Ok(cache)
    }

    /// Scan local pack files and rebuild the in-memory index. A corrupt
    /// frame stops the scan of that file; everything before it stays usable.
    fn rebuild_index(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.index.clear();
        state.pack_touch.clear();
        state.total_bytes = 0;

        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(PACK_FILE_PREFIX) {
                continue;
            }
            let meta = entry.metadata()?;
            state.total_bytes += meta.len();
            let mtime: DateTime<Utc> = meta.modified()?.into();
            state.pack_touch.insert(name.to_string(), mtime);

            let mut file = fs::File::open(entry.path())?;
            let mut pos = 0u64;
            loop {
                let mut header = [0u8; 6];
                match file.read_exact(&mut header) {
                    Ok(()) => {}
                    Err(_) => break,
                }
                let key_len = u16::from_le_bytes(header[..2].try_into().unwrap()) as u64;
                let data_len = u32::from_le_bytes(header[2..6].try_into().unwrap()) as u64;
                let mut key = vec![0u8; key_len as usize];
                if file.read_exact(&mut key).is_err() {
                    warn!(pack = name, "truncated cache pack frame, ignoring tail");
                    break;
                }
                let Ok(key) = String::from_utf8(key) else {
                    warn!(pack = name, "corrupt cache pack key, ignoring tail");
                    break;
                };
                let data_offset = pos + 6 + key_len;
                state.index.insert(
                    key,
                    CacheSlot {
                        pack_file: name.to_string(),
                        offset: data_offset,
                        length: data_len,
                    },
                );
                pos = data_offset + data_len;
                if file.seek(SeekFrom::Start(pos)).is_err() {
                    break;
                }
            }
        }

        debug!(
            entries = state.index.len(),
            total_bytes = state.total_bytes,
            "rebuilt packed cache index"
        );
        Ok(())
    }

    fn pack_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn fresh_pack_name() -> String {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{PACK_FILE_PREFIX}{}", hex::encode(bytes))
    }

    /// Evict least-recently-touched pack files until under budget. The
    /// current write pack is never evicted.
    fn evict_if_needed(&self, state: &mut CacheState) {
        while state.total_bytes > self.max_bytes {
            let victim = state
                .pack_touch
                .iter()
                .filter(|(name, _)| Some(name.as_str()) != state.current_pack.as_deref())
                .min_by_key(|(_, touch)| **touch)
                .map(|(name, _)| name.clone());
            let Some(victim) = victim else { break };

            let path = self.pack_path(&victim);
            let freed = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if let Err(e) = fs::remove_file(&path) {
                warn!(pack = victim, "unable to evict cache pack: {e}");
                state.pack_touch.remove(&victim);
                continue;
            }
            debug!(pack = victim, freed, "evicted cache pack");
            state.total_bytes = state.total_bytes.saturating_sub(freed);
            state.pack_touch.remove(&victim);
            state.index.retain(|_, slot| slot.pack_file != victim);
        }
    }
}

impl BlobStorage for PackedCache {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        let entries: Vec<(String, u64)> = {
            let state = self.state.lock().unwrap();
            state
                .index
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, slot)| (key.clone(), slot.length))
                .collect()
        };
        for (key, length) in entries {
            cb(BlobMetadata {
                id: BlobId::new(key),
                length,
                timestamp: self.clock.now(),
            })?;
        }
        Ok(())
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        let slot = {
            let mut state = self.state.lock().unwrap();
            let slot = state
                .index
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| StrataError::BlobNotFound(id.to_string()))?;
            let now = self.clock.now();
            state.pack_touch.insert(slot.pack_file.clone(), now);
            slot
        };

        if length < FULL_BLOB || offset > slot.length {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        let want = if length == FULL_BLOB {
            slot.length - offset
        } else {
            let want = length as u64;
            if offset + want > slot.length {
                return Err(StrataError::InvalidRange {
                    offset: offset as i64,
                    length,
                });
            }
            want
        };

        let mut file = match fs::File::open(self.pack_path(&slot.pack_file)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Pack was evicted under us.
                return Err(StrataError::BlobNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(slot.offset + offset))?;
        let mut out = vec![0u8; want as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    fn put(&self, id: &BlobId, data: &[u8], _opts: &PutOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        // Rotate the write pack at the size limit.
        let pack_name = match &state.current_pack {
            Some(name)
                if fs::metadata(self.pack_path(name))
                    .map(|m| m.len())
                    .unwrap_or(0)
                    < CACHE_PACK_SIZE =>
            {
                name.clone()
            }
            _ => {
                let name = Self::fresh_pack_name();
                state.current_pack = Some(name.clone());
                name
            }
        };

        let path = self.pack_path(&pack_name);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();

        let key = id.as_str().as_bytes();
        let mut frame = Vec::with_capacity(6 + key.len() + data.len());
        frame.extend_from_slice(&(key.len() as u16).to_le_bytes());
        frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
        frame.extend_from_slice(key);
        frame.extend_from_slice(data);
        file.write_all(&frame)?;

        state.total_bytes += frame.len() as u64;
        state.index.insert(
            id.as_str().to_string(),
            CacheSlot {
                pack_file: pack_name.clone(),
                offset: offset + 6 + key.len() as u64,
                length: data.len() as u64,
            },
        );
        state.pack_touch.insert(pack_name, self.clock.now());

        self.evict_if_needed(&mut state);
        Ok(())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.index.remove(id.as_str()) {
            Some(_) => Ok(()),
            None => Err(StrataError::BlobNotFound(id.to_string())),
        }
    }

    fn set_time(&self, id: &BlobId, ts: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let pack = match state.index.get(id.as_str()) {
            Some(slot) => slot.pack_file.clone(),
            None => return Err(StrataError::BlobNotFound(id.to_string())),
        };
        state.pack_touch.insert(pack, ts);
        Ok(())
    }

    fn display_name(&self) -> String {
        format!("packed-cache:{}", self.directory.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::get_full;

    fn put(cache: &PackedCache, id: &str, data: &[u8]) {
        cache
            .put(&BlobId::from(id), data, &PutOptions::default())
            .unwrap();
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackedCache::open(dir.path(), 1 << 30).unwrap();
        put(&cache, "c-one", b"hello");
        put(&cache, "c-two", b"world");
        assert_eq!(get_full(&cache, &BlobId::from("c-one")).unwrap(), b"hello");
        assert_eq!(get_full(&cache, &BlobId::from("c-two")).unwrap(), b"world");
        assert_eq!(cache.get(&BlobId::from("c-two"), 1, 3).unwrap(), b"orl");
    }

    #[test]
    fn entries_share_one_pack_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackedCache::open(dir.path(), 1 << 30).unwrap();
        for i in 0..50 {
            put(&cache, &format!("c-{i}"), &[i as u8; 100]);
        }
        let packs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(PACK_FILE_PREFIX))
            .collect();
        assert_eq!(packs.len(), 1);
    }

    #[test]
    fn index_rebuilds_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = PackedCache::open(dir.path(), 1 << 30).unwrap();
            put(&cache, "survivor", b"persisted bytes");
        }
        let reopened = PackedCache::open(dir.path(), 1 << 30).unwrap();
        assert_eq!(
            get_full(&reopened, &BlobId::from("survivor")).unwrap(),
            b"persisted bytes"
        );
    }

    #[test]
    fn delete_hides_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PackedCache::open(dir.path(), 1 << 30).unwrap();
        put(&cache, "gone", b"x");
        cache.delete(&BlobId::from("gone")).unwrap();
        assert!(get_full(&cache, &BlobId::from("gone")).is_err());
        assert!(cache.delete(&BlobId::from("gone")).is_err());
    }

    #[test]
    fn eviction_respects_budget() {
        let dir = tempfile::tempdir().unwrap();
        // Budget fits roughly one 100-byte entry.
        let cache = PackedCache::open(dir.path(), 150).unwrap();
        put(&cache, "a", &[1u8; 100]);
        // Rotate the write pack so "a"'s pack becomes evictable.
        {
            let mut state = cache.state.lock().unwrap();
            state.current_pack = None;
        }
        put(&cache, "b", &[2u8; 100]);
        // "a"'s pack was evicted; "b" remains readable.
        assert!(get_full(&cache, &BlobId::from("a")).is_err());
        assert_eq!(get_full(&cache, &BlobId::from("b")).unwrap(), [2u8; 100]);
    }
}
