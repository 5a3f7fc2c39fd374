pub mod index;
pub mod merged;
pub mod pack_builder;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use strata_types::blob_id::{
    BlobId, INDEX_PREFIX, PACK_DATA_PREFIX, PACK_METADATA_PREFIX,
};
use strata_types::content_id::ContentId;
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, PutOptions};
use crate::clock::Clock;
use crate::compress::{self, Compression};
use crate::crypto::Crypter;
use crate::format::{MAX_SUPPORTED_FORMAT_VERSION, MIN_SUPPORTED_FORMAT_VERSION};

use self::index::{encode_index, index_blob_id, IndexBlob, IndexEntry, INDEX_VERSION_1, INDEX_VERSION_2};
use self::merged::MergedIndex;
use self::pack_builder::{PackBuilder, SealedPack};

/// Options for opening a content manager.
pub struct ContentManagerOptions {
    pub format_version: u8,
    pub max_pack_size: usize,
    pub read_only: bool,
    /// Local store for encrypted content payloads (typically a packed cache).
    pub content_cache: Option<Arc<dyn BlobStorage>>,
}

struct WriterState {
    data_pack: PackBuilder,
    meta_pack: PackBuilder,
    /// Entries visible to this session but not yet written to an index
    /// blob: sealed-pack entries awaiting flush plus fresh tombstones.
    uncommitted: BTreeMap<ContentId, IndexEntry>,
    /// Every entry this session has produced, for the life of the session.
    own_writes: BTreeMap<ContentId, IndexEntry>,
}

/// Deduplicated, encrypted content store over the blob layer.
///
/// Reads consult the session's own writes first, then the merged committed
/// view. At most one writer session mutates a manager; internal state is
/// guarded by coarse locks and backend I/O never runs under them.
pub struct ContentManager {
    storage: Arc<dyn BlobStorage>,
    crypter: Arc<Crypter>,
    clock: Arc<dyn Clock>,
    format_version: u8,
    max_pack_size: usize,
    read_only: bool,
    content_cache: Option<Arc<dyn BlobStorage>>,
    committed: RwLock<Arc<MergedIndex>>,
    state: Mutex<WriterState>,
}

impl ContentManager {
    /// Open the manager and build the merged index view.
    pub fn open(
        storage: Arc<dyn BlobStorage>,
        crypter: Arc<Crypter>,
        clock: Arc<dyn Clock>,
        opts: ContentManagerOptions,
    ) -> Result<Self> {
        if !(MIN_SUPPORTED_FORMAT_VERSION..=MAX_SUPPORTED_FORMAT_VERSION)
            .contains(&opts.format_version)
        {
            return Err(StrataError::FormatIncompatible(format!(
                "content format version {}",
                opts.format_version
            )));
        }
        let manager = Self {
            committed: RwLock::new(Arc::new(MergedIndex::empty())),
            state: Mutex::new(WriterState {
                data_pack: PackBuilder::new(PACK_DATA_PREFIX, opts.max_pack_size),
                meta_pack: PackBuilder::new(PACK_METADATA_PREFIX, opts.max_pack_size),
                uncommitted: BTreeMap::new(),
                own_writes: BTreeMap::new(),
            }),
            storage,
            crypter,
            clock,
            format_version: opts.format_version,
            max_pack_size: opts.max_pack_size,
            read_only: opts.read_only,
            content_cache: opts.content_cache,
        };
        manager.refresh()?;
        Ok(manager)
    }

    /// Re-list index blobs and swap in a freshly merged view. Entries this
    /// session has written stay visible through the own-writes overlay.
    pub fn refresh(&self) -> Result<()> {
        let blobs = load_index_blobs(&*self.storage, &self.crypter)?;
        let merged = Arc::new(MergedIndex::build(blobs));
        debug!(
            indexes = merged.source_blobs().len(),
            entries = merged.len(),
            "refreshed merged index"
        );
        *self.committed.write().unwrap() = merged;
        Ok(())
    }

    /// Snapshot of the committed merged view.
    pub fn committed_view(&self) -> Arc<MergedIndex> {
        self.committed.read().unwrap().clone()
    }

    fn now_seconds(&self) -> i64 {
        self.clock.now().timestamp()
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only || self.storage.is_read_only() {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    /// Authoritative entry for `id` as this session sees it: own writes
    /// first, then the committed view.
    pub fn entry(&self, id: &ContentId) -> Option<IndexEntry> {
        {
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.own_writes.get(id) {
                return Some(entry.clone());
            }
        }
        self.committed_view().get(id).cloned()
    }

    /// Whether the referenced pack blob still exists.
    fn pack_exists(&self, pack: &BlobId) -> bool {
        !pack.as_str().is_empty() && self.storage.get(pack, 0, 0).is_ok()
    }

    /// Write a content: dedupe against the index, compress, encrypt, queue
    /// into the pack for its prefix. Returns the content id.
    pub fn write(
        &self,
        data: &[u8],
        prefix: Option<char>,
        compression: Compression,
    ) -> Result<ContentId> {
        self.check_writable()?;
        let id = self.crypter.content_id(prefix, data)?;

        // Dedupe against this session and the committed view.
        if let Some(existing) = self.entry(&id) {
            if !existing.deleted {
                return Ok(id);
            }
            // Tombstoned: undelete in place when the pack still holds the
            // bytes, otherwise fall through and re-write the plaintext.
            if self.pack_exists(&existing.pack_blob_id) {
                let mut revived = existing;
                revived.deleted = false;
                revived.timestamp_seconds = self.now_seconds();
                let mut state = self.state.lock().unwrap();
                state.uncommitted.insert(id, revived.clone());
                state.own_writes.insert(id, revived);
                return Ok(id);
            }
        } else {
            let state = self.state.lock().unwrap();
            let builder = if id.is_metadata() {
                &state.meta_pack
            } else {
                &state.data_pack
            };
            if builder.contains(&id) {
                return Ok(id);
            }
        }

        // Index v1 has no per-entry compression id; store uncompressed.
        let compression = if self.format_version == 1 {
            Compression::None
        } else {
            compression
        };
        let compressed = compress::compress(compression, data)?;
        let payload = self.crypter.encrypt_content(&id, &compressed)?;
        if payload.len() > self.max_pack_size {
            return Err(StrataError::Oversized(data.len() as u64));
        }

        let sealed = {
            let mut state = self.state.lock().unwrap();
            // A session-local tombstone is superseded by this re-write; drop
            // it so the fresh entry is not outranked at equal timestamps.
            if state.own_writes.get(&id).is_some_and(|e| e.deleted) {
                state.own_writes.remove(&id);
                state.uncommitted.remove(&id);
            }
            let builder = if id.is_metadata() {
                &mut state.meta_pack
            } else {
                &mut state.data_pack
            };
            builder.add(
                id,
                &payload,
                data.len() as u32,
                compression.id(),
                self.now_seconds(),
                self.format_version,
            )?;
            if builder.is_full() {
                builder.seal()
            } else {
                None
            }
        };

        if let Some(sealed) = sealed {
            self.commit_sealed_pack(sealed)?;
        }
        Ok(id)
    }

    /// Upload a sealed pack and an index blob covering its entries, then
    /// make the entries visible to this session.
    fn commit_sealed_pack(&self, sealed: SealedPack) -> Result<()> {
        let SealedPack {
            blob_id,
            data,
            entries,
        } = sealed;
        self.storage.put(&blob_id, &data, &PutOptions::default())?;
        debug!(pack = %blob_id, bytes = data.len(), contents = entries.len(), "wrote pack blob");
        self.write_index_blob(&entries)?;

        let mut state = self.state.lock().unwrap();
        for entry in entries {
            state.own_writes.insert(entry.content_id, entry);
        }
        Ok(())
    }

    /// Encrypt and store an index blob for the given entries.
    fn write_index_blob(&self, entries: &[IndexEntry]) -> Result<BlobId> {
        let version = if self.format_version == 1 {
            INDEX_VERSION_1
        } else {
            INDEX_VERSION_2
        };
        let payload = encode_index(version, entries)?;
        let blob_id = index_blob_id(&payload);
        let encrypted = self.crypter.encrypt_blob(&blob_id, &payload)?;
        self.storage
            .put(&blob_id, &encrypted, &PutOptions::default())?;
        debug!(index = %blob_id, entries = entries.len(), "wrote index blob");
        Ok(blob_id)
    }

    /// Read a content's plaintext. Tombstoned contents read as missing.
    pub fn read(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.read_inner(id, false)
    }

    /// Privileged read that sees through tombstones; maintenance uses this
    /// to move deleted contents during rewrite.
    pub fn read_for_maintenance(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.read_inner(id, true)
    }

    fn read_inner(&self, id: &ContentId, allow_deleted: bool) -> Result<Vec<u8>> {
        // Contents still sitting in an unflushed pack are readable by the
        // session that wrote them.
        let pending_payload = {
            let state = self.state.lock().unwrap();
            let builder = if id.is_metadata() {
                &state.meta_pack
            } else {
                &state.data_pack
            };
            builder.pending_payload(id)
        };
        if let Some(payload) = pending_payload {
            return self.decode_payload(id, &payload);
        }

        let entry = self
            .entry(id)
            .ok_or_else(|| StrataError::ContentNotFound(id.to_string()))?;
        if entry.deleted && !allow_deleted {
            return Err(StrataError::ContentNotFound(id.to_string()));
        }
        let payload = self.fetch_payload(&entry)?;
        self.decode_payload(id, &payload)
    }

    /// Fetch the encrypted payload for an entry, via the local content
    /// cache when configured.
    fn fetch_payload(&self, entry: &IndexEntry) -> Result<Vec<u8>> {
        let cache_key = BlobId::new(entry.content_id.to_string());
        if let Some(cache) = &self.content_cache {
            if let Ok(cached) = crate::blob::get_full(&**cache, &cache_key) {
                return Ok(cached);
            }
        }

        if entry.pack_blob_id.as_str().is_empty() {
            return Err(StrataError::ContentNotFound(entry.content_id.to_string()));
        }
        let payload = self.storage.get(
            &entry.pack_blob_id,
            entry.pack_offset,
            entry.packed_length as i64,
        )?;

        if let Some(cache) = &self.content_cache {
            if let Err(e) = cache.put(&cache_key, &payload, &PutOptions::default()) {
                debug!(content = %entry.content_id, "unable to cache content: {e}");
            }
        }
        Ok(payload)
    }

    fn decode_payload(&self, id: &ContentId, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.crypter.decrypt_content(id, payload)?;
        compress::decompress(&compressed)
    }

    /// Tombstone a content. Idempotent for already-deleted contents.
    pub fn delete(&self, id: &ContentId) -> Result<()> {
        self.check_writable()?;

        // A content still pending in a builder cannot be unqueued; record a
        // tombstone that outranks its entry once both land in the index.
        let pending = {
            let state = self.state.lock().unwrap();
            let builder = if id.is_metadata() {
                &state.meta_pack
            } else {
                &state.data_pack
            };
            builder.contains(id)
        };

        let entry = self.entry(id);
        let tombstone = match (&entry, pending) {
            (Some(e), _) if e.deleted => return Ok(()),
            (Some(e), _) => {
                let mut t = e.clone();
                t.deleted = true;
                t.timestamp_seconds = self.now_seconds();
                t
            }
            (None, true) => IndexEntry {
                content_id: *id,
                pack_blob_id: BlobId::new(""),
                pack_offset: 0,
                packed_length: 0,
                original_length: 0,
                timestamp_seconds: self.now_seconds(),
                deleted: true,
                format_version: self.format_version,
                compression_id: 0,
            },
            (None, false) => return Err(StrataError::ContentNotFound(id.to_string())),
        };

        let mut state = self.state.lock().unwrap();
        state.uncommitted.insert(*id, tombstone.clone());
        state.own_writes.insert(*id, tombstone);
        Ok(())
    }

    /// Stream entries in ascending content id order: the committed view
    /// overlaid with this session's writes.
    pub fn iterate(
        &self,
        start: Bound<&ContentId>,
        include_deleted: bool,
        cb: &mut dyn FnMut(&IndexEntry) -> Result<()>,
    ) -> Result<()> {
        let committed = self.committed_view();
        let own: Vec<IndexEntry> = {
            let state = self.state.lock().unwrap();
            state.own_writes.values().cloned().collect()
        };

        let mut own_iter = own.iter().peekable();
        let in_range = |id: &ContentId| match start {
            Bound::Unbounded => true,
            Bound::Included(s) => id >= s,
            Bound::Excluded(s) => id > s,
        };
        let mut emit = |entry: &IndexEntry| -> Result<()> {
            if entry.deleted && !include_deleted {
                return Ok(());
            }
            cb(entry)
        };

        committed.iterate(start, true, &mut |entry| {
            // Emit own-writes entries ordered before this committed id.
            while let Some(next) = own_iter.peek() {
                if next.content_id < entry.content_id {
                    if in_range(&next.content_id) {
                        emit(next)?;
                    }
                    own_iter.next();
                } else {
                    break;
                }
            }
            // The session's entry supersedes the committed one.
            if let Some(next) = own_iter.peek() {
                if next.content_id == entry.content_id {
                    emit(next)?;
                    own_iter.next();
                    return Ok(());
                }
            }
            emit(entry)
        })?;
        for rest in own_iter {
            if in_range(&rest.content_id) {
                emit(rest)?;
            }
        }
        Ok(())
    }

    /// Copy an existing entry's payload into a fresh pack, preserving its
    /// deleted flag. The ciphertext is location-independent, so the bytes
    /// move verbatim after an integrity check.
    pub fn rewrite_entry(&self, entry: &IndexEntry) -> Result<()> {
        self.check_writable()?;
        if entry.pack_blob_id.as_str().is_empty() {
            return Err(StrataError::ContentNotFound(entry.content_id.to_string()));
        }
        let payload = self.storage.get(
            &entry.pack_blob_id,
            entry.pack_offset,
            entry.packed_length as i64,
        )?;
        // Verify before propagating bytes into a new pack.
        self.decode_payload(&entry.content_id, &payload)?;

        let sealed = {
            let mut state = self.state.lock().unwrap();
            let builder = if entry.content_id.is_metadata() {
                &mut state.meta_pack
            } else {
                &mut state.data_pack
            };
            builder.add_with_flags(
                entry.content_id,
                &payload,
                entry.original_length,
                entry.compression_id,
                self.now_seconds(),
                entry.format_version,
                entry.deleted,
            )?;
            if builder.is_full() {
                builder.seal()
            } else {
                None
            }
        };
        if let Some(sealed) = sealed {
            self.commit_sealed_pack(sealed)?;
        }
        Ok(())
    }

    /// Seal and upload both builders plus one index blob covering every
    /// entry this flush produced (sealed packs and tombstones).
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        let (sealed, buffered) = {
            let mut state = self.state.lock().unwrap();
            let mut sealed = Vec::new();
            if let Some(pack) = state.data_pack.seal() {
                sealed.push(pack);
            }
            if let Some(pack) = state.meta_pack.seal() {
                sealed.push(pack);
            }
            let buffered: Vec<IndexEntry> = state.uncommitted.values().cloned().collect();
            state.uncommitted.clear();
            (sealed, buffered)
        };

        let mut entries = buffered.clone();
        for pack in &sealed {
            entries.extend_from_slice(&pack.entries);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let result = (|| {
            for pack in &sealed {
                self.storage
                    .put(&pack.blob_id, &pack.data, &PutOptions::default())?;
                debug!(pack = %pack.blob_id, bytes = pack.data.len(), "flushed pack blob");
            }
            self.write_index_blob(&entries)
        })();

        match result {
            Ok(_) => {
                let mut state = self.state.lock().unwrap();
                for entry in entries {
                    state.own_writes.insert(entry.content_id, entry);
                }
                Ok(())
            }
            Err(e) => {
                // Keep buffered tombstones so a retried flush persists them;
                // any pack blob that did land is an orphan candidate.
                let mut state = self.state.lock().unwrap();
                for entry in buffered {
                    state.uncommitted.entry(entry.content_id).or_insert(entry);
                }
                Err(e)
            }
        }
    }

    /// Drop all buffered state without writing anything.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if state.data_pack.has_pending() || state.meta_pack.has_pending() {
            warn!("discarding buffered pack data on abort");
        }
        state.data_pack = PackBuilder::new(PACK_DATA_PREFIX, self.max_pack_size);
        state.meta_pack = PackBuilder::new(PACK_METADATA_PREFIX, self.max_pack_size);
        state.uncommitted.clear();
    }

    /// Whether the session has buffered writes that a flush would persist.
    pub fn has_pending_writes(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.data_pack.has_pending()
            || state.meta_pack.has_pending()
            || !state.uncommitted.is_empty()
    }

    pub fn crypter(&self) -> &Arc<Crypter> {
        &self.crypter
    }

    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    pub fn format_version(&self) -> u8 {
        self.format_version
    }

    pub fn max_pack_size(&self) -> usize {
        self.max_pack_size
    }
}

/// List and decode every index blob in the repository.
pub fn load_index_blobs(
    storage: &dyn BlobStorage,
    crypter: &Crypter,
) -> Result<Vec<(BlobId, IndexBlob)>> {
    let metas = crate::blob::list_all(storage, &INDEX_PREFIX.to_string())?;
    let mut out = Vec::with_capacity(metas.len());
    for meta in metas {
        let encrypted = crate::blob::get_full(storage, &meta.id)?;
        let payload = crypter.decrypt_blob(&meta.id, &encrypted)?;
        out.push((meta.id.clone(), IndexBlob::decode(&payload)?));
    }
    Ok(out)
}
