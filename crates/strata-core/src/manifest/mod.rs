pub mod users;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use strata_types::blob_id::{BlobId, MANIFEST_DATA_PREFIX, MANIFEST_INDEX_PREFIX};
use strata_types::error::{Result, StrataError};
use strata_types::manifest_id::ManifestId;

use crate::blob::{BlobStorage, PutOptions};
use crate::clock::Clock;
use crate::crypto::Crypter;

/// Label key every manifest must carry.
pub const TYPE_LABEL: &str = "type";

/// Extent of a manifest payload inside a manifest-data pack blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub pack_blob_id: BlobId,
    pub offset: u64,
    pub length: u32,
}

/// Metadata of one manifest record as stored in a manifest-index blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ManifestId,
    pub labels: BTreeMap<String, String>,
    pub mod_time: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadRef>,
}

/// On-disk manifest-index blob payload (whole-blob encrypted JSON).
#[derive(Debug, Serialize, Deserialize)]
struct ManifestIndexPayload {
    entries: Vec<ManifestEntry>,
}

fn entry_wins(candidate: &ManifestEntry, current: &ManifestEntry) -> bool {
    if candidate.mod_time != current.mod_time {
        return candidate.mod_time > current.mod_time;
    }
    if candidate.deleted != current.deleted {
        return candidate.deleted;
    }
    candidate.id > current.id
}

struct ManifestState {
    /// Committed view: manifest id → authoritative entry.
    merged: HashMap<ManifestId, ManifestEntry>,
    /// Manifest-index blobs the committed view was built from.
    source_blobs: Vec<BlobId>,
    /// Entries produced this session, flushed as one `m` blob.
    session: Vec<ManifestEntry>,
    /// Encrypted payloads awaiting the session's `l` pack, by session index.
    pending_payloads: Vec<(usize, Vec<u8>)>,
    /// Plaintext of session-written payloads, readable before flush.
    payload_cache: HashMap<ManifestId, Vec<u8>>,
}

/// Labelled, typed, small JSON records on top of the blob layer.
///
/// Payloads append into `l` packs; `m` index blobs map manifest ids to
/// labels and payload extents. Manifests are mutable-by-replacement: updates
/// write a new entry, and logically-singleton records are deduped by
/// explicitly deleting earlier entries with the same label.
pub struct ManifestStore {
    storage: Arc<dyn BlobStorage>,
    crypter: Arc<Crypter>,
    clock: Arc<dyn Clock>,
    read_only: bool,
    state: Mutex<ManifestState>,
}

impl ManifestStore {
    pub fn open(
        storage: Arc<dyn BlobStorage>,
        crypter: Arc<Crypter>,
        clock: Arc<dyn Clock>,
        read_only: bool,
    ) -> Result<Self> {
        let store = Self {
            storage,
            crypter,
            clock,
            read_only,
            state: Mutex::new(ManifestState {
                merged: HashMap::new(),
                source_blobs: Vec::new(),
                session: Vec::new(),
                pending_payloads: Vec::new(),
                payload_cache: HashMap::new(),
            }),
        };
        store.refresh()?;
        Ok(store)
    }

    /// Reload every manifest-index blob and rebuild the merged view.
    pub fn refresh(&self) -> Result<()> {
        let metas = crate::blob::list_all(&*self.storage, &MANIFEST_INDEX_PREFIX.to_string())?;
        let mut merged: HashMap<ManifestId, ManifestEntry> = HashMap::new();
        let mut source_blobs = Vec::with_capacity(metas.len());
        for meta in metas {
            let encrypted = crate::blob::get_full(&*self.storage, &meta.id)?;
            let payload = self.crypter.decrypt_blob(&meta.id, &encrypted)?;
            let decoded: ManifestIndexPayload = serde_json::from_slice(&payload)?;
            for entry in decoded.entries {
                match merged.get(&entry.id) {
                    Some(current) if !entry_wins(&entry, current) => {}
                    _ => {
                        merged.insert(entry.id, entry);
                    }
                }
            }
            source_blobs.push(meta.id);
        }
        debug!(
            blobs = source_blobs.len(),
            manifests = merged.len(),
            "loaded manifest view"
        );

        let mut state = self.state.lock().unwrap();
        state.merged = merged;
        state.source_blobs = source_blobs;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only || self.storage.is_read_only() {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    fn payload_context(id: &ManifestId) -> Vec<u8> {
        let mut ctx = b"manifest:".to_vec();
        ctx.extend_from_slice(&id.0);
        ctx
    }

    /// Store a manifest. Labels must include `type`.
    pub fn put(&self, labels: BTreeMap<String, String>, payload: &[u8]) -> Result<ManifestId> {
        self.check_writable()?;
        if labels.get(TYPE_LABEL).map(String::as_str).unwrap_or("") == "" {
            return Err(StrataError::InvalidFormat(
                "manifest labels must include a non-empty 'type'".into(),
            ));
        }

        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let id = ManifestId::from_bytes(id_bytes);

        let encrypted = self
            .crypter
            .encrypt_keyed(&Self::payload_context(&id), payload)?;

        let mut state = self.state.lock().unwrap();
        let session_idx = state.session.len();
        state.session.push(ManifestEntry {
            id,
            labels,
            mod_time: self.clock.now(),
            deleted: false,
            payload: None, // extent assigned when the l pack is built
        });
        state.pending_payloads.push((session_idx, encrypted));
        state.payload_cache.insert(id, payload.to_vec());
        Ok(id)
    }

    /// Authoritative entry as this session sees it (session overlay first).
    fn lookup(&self, id: &ManifestId) -> Option<ManifestEntry> {
        let state = self.state.lock().unwrap();
        let session_hit = state
            .session
            .iter()
            .rev()
            .find(|e| e.id == *id)
            .cloned();
        session_hit.or_else(|| state.merged.get(id).cloned())
    }

    /// Fetch a manifest's payload bytes.
    pub fn get(&self, id: &ManifestId) -> Result<(ManifestEntry, Vec<u8>)> {
        let entry = self
            .lookup(id)
            .ok_or_else(|| StrataError::ManifestNotFound(id.to_string()))?;
        if entry.deleted {
            return Err(StrataError::ManifestNotFound(id.to_string()));
        }

        if let Some(plain) = self.state.lock().unwrap().payload_cache.get(id) {
            return Ok((entry, plain.clone()));
        }

        let payload_ref = entry
            .payload
            .clone()
            .ok_or_else(|| StrataError::ManifestNotFound(id.to_string()))?;
        let encrypted = self.storage.get(
            &payload_ref.pack_blob_id,
            payload_ref.offset,
            payload_ref.length as i64,
        )?;
        let plain = self
            .crypter
            .decrypt_keyed(&Self::payload_context(id), &encrypted)?;
        Ok((entry, plain))
    }

    /// Fetch and deserialize a manifest payload.
    pub fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        id: &ManifestId,
    ) -> Result<(ManifestEntry, T)> {
        let (entry, bytes) = self.get(id)?;
        let value = serde_json::from_slice(&bytes)?;
        Ok((entry, value))
    }

    /// All live manifests whose labels are a superset of `filter`
    /// (AND across keys).
    pub fn find(&self, filter: &BTreeMap<String, String>) -> Vec<ManifestEntry> {
        let state = self.state.lock().unwrap();
        let mut best: HashMap<ManifestId, ManifestEntry> = HashMap::new();
        for entry in state.merged.values() {
            best.insert(entry.id, entry.clone());
        }
        for entry in &state.session {
            match best.get(&entry.id) {
                Some(current) if !entry_wins(entry, current) => {}
                _ => {
                    best.insert(entry.id, entry.clone());
                }
            }
        }
        let mut out: Vec<ManifestEntry> = best
            .into_values()
            .filter(|e| !e.deleted)
            .filter(|e| {
                filter
                    .iter()
                    .all(|(k, v)| e.labels.get(k).map(String::as_str) == Some(v.as_str()))
            })
            .collect();
        out.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then(a.id.cmp(&b.id)));
        out
    }

    /// Tombstone a manifest. Idempotent for already-deleted ids.
    pub fn delete(&self, id: &ManifestId) -> Result<()> {
        self.check_writable()?;
        let Some(entry) = self.lookup(id) else {
            return Err(StrataError::ManifestNotFound(id.to_string()));
        };
        if entry.deleted {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.payload_cache.remove(id);
        state.session.push(ManifestEntry {
            id: *id,
            labels: entry.labels,
            mod_time: self.clock.now(),
            deleted: true,
            payload: None,
        });
        Ok(())
    }

    /// Write a logically-singleton manifest: store the new entry, then
    /// delete every earlier manifest carrying the same `type` and the same
    /// value for `dedupe_label`.
    pub fn replace(
        &self,
        labels: BTreeMap<String, String>,
        dedupe_label: &str,
        payload: &[u8],
    ) -> Result<ManifestId> {
        let manifest_type = labels.get(TYPE_LABEL).cloned().unwrap_or_default();
        let dedupe_value = labels.get(dedupe_label).cloned();
        let new_id = self.put(labels, payload)?;

        let mut filter = BTreeMap::new();
        filter.insert(TYPE_LABEL.to_string(), manifest_type);
        if let Some(value) = dedupe_value {
            filter.insert(dedupe_label.to_string(), value);
        }
        for prior in self.find(&filter) {
            if prior.id != new_id {
                self.delete(&prior.id)?;
            }
        }
        Ok(new_id)
    }

    /// Persist the session: one `l` payload pack (when payloads exist) and
    /// one `m` index blob listing the session's entries.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        let (mut entries, payloads) = {
            let mut state = self.state.lock().unwrap();
            if state.session.is_empty() {
                return Ok(());
            }
            let entries = std::mem::take(&mut state.session);
            let payloads = std::mem::take(&mut state.pending_payloads);
            (entries, payloads)
        };

        if !payloads.is_empty() {
            let mut pack = Vec::new();
            let pack_id = random_manifest_pack_id();
            for (session_idx, encrypted) in payloads {
                let offset = pack.len() as u64;
                pack.extend_from_slice(&encrypted);
                entries[session_idx].payload = Some(PayloadRef {
                    pack_blob_id: pack_id.clone(),
                    offset,
                    length: encrypted.len() as u32,
                });
            }
            self.storage.put(&pack_id, &pack, &PutOptions::default())?;
            debug!(pack = %pack_id, bytes = pack.len(), "wrote manifest data pack");
        }

        self.write_manifest_index(&entries)?;

        let mut state = self.state.lock().unwrap();
        for entry in entries {
            match state.merged.get(&entry.id) {
                Some(current) if !entry_wins(&entry, current) => {}
                _ => {
                    state.merged.insert(entry.id, entry);
                }
            }
        }
        state.payload_cache.clear();
        Ok(())
    }

    fn write_manifest_index(&self, entries: &[ManifestEntry]) -> Result<BlobId> {
        let payload = serde_json::to_vec(&ManifestIndexPayload {
            entries: entries.to_vec(),
        })?;
        let blob_id = manifest_index_blob_id(&payload);
        let encrypted = self.crypter.encrypt_blob(&blob_id, &payload)?;
        self.storage
            .put(&blob_id, &encrypted, &PutOptions::default())?;
        debug!(index = %blob_id, entries = entries.len(), "wrote manifest index blob");
        Ok(blob_id)
    }

    /// Merge every manifest-index blob into a single replacement blob.
    /// Returns the superseded blob ids (the replacement excluded); the
    /// caller schedules their deletion once the safety window passes.
    pub fn compact(&self) -> Result<Vec<BlobId>> {
        self.check_writable()?;
        self.flush()?;
        self.refresh()?;

        let (entries, sources) = {
            let state = self.state.lock().unwrap();
            let mut entries: Vec<ManifestEntry> = state.merged.values().cloned().collect();
            entries.sort_by(|a, b| a.id.cmp(&b.id));
            (entries, state.source_blobs.clone())
        };
        if entries.is_empty() || sources.len() <= 1 {
            return Ok(Vec::new());
        }

        let replacement = self.write_manifest_index(&entries)?;
        Ok(sources.into_iter().filter(|b| *b != replacement).collect())
    }

    /// Pack blobs referenced by any authoritative manifest entry.
    pub fn referenced_payload_packs(&self) -> Vec<BlobId> {
        let state = self.state.lock().unwrap();
        let mut packs: Vec<BlobId> = state
            .merged
            .values()
            .chain(state.session.iter())
            .filter_map(|e| e.payload.as_ref())
            .map(|p| p.pack_blob_id.clone())
            .collect();
        packs.sort();
        packs.dedup();
        packs
    }

    /// Whether the session has buffered manifests that a flush would persist.
    pub fn has_pending_writes(&self) -> bool {
        !self.state.lock().unwrap().session.is_empty()
    }

    /// Drop all buffered session state without writing anything.
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        state.session.clear();
        state.pending_payloads.clear();
        state.payload_cache.clear();
    }
}

fn random_manifest_pack_id() -> BlobId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BlobId::new(format!("{MANIFEST_DATA_PREFIX}{}", hex::encode(bytes)))
}

/// Derive an `m` blob id from its plaintext payload so equal index sets
/// dedupe.
fn manifest_index_blob_id(payload: &[u8]) -> BlobId {
    let digest = Sha256::digest(payload);
    BlobId::new(format!("{MANIFEST_INDEX_PREFIX}{}", hex::encode(digest)))
}
