use sha2::{Digest, Sha256};

use strata_types::blob_id::BlobId;
use strata_types::content_id::ContentId;
use strata_types::error::{Result, StrataError};

/// First on-disk index layout: u32 pack offsets, no per-entry compression.
pub const INDEX_VERSION_1: u8 = 1;
/// Second layout: adds original length + compression id, widens offsets.
pub const INDEX_VERSION_2: u8 = 2;

/// One content descriptor inside an index blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub content_id: ContentId,
    /// Empty for tombstones whose pack is already unknown.
    pub pack_blob_id: BlobId,
    pub pack_offset: u64,
    pub packed_length: u32,
    /// Plaintext length; zero when recorded by a v1 index.
    pub original_length: u32,
    /// First-seen wall time, seconds. Monotonic per writer.
    pub timestamp_seconds: i64,
    pub deleted: bool,
    pub format_version: u8,
    pub compression_id: u32,
}

const FLAG_DELETED: u8 = 0b0000_0001;

fn fixed_entry_size(version: u8, key_len: usize) -> usize {
    match version {
        INDEX_VERSION_1 => key_len + 4 + 4 + 4 + 8 + 1 + 1,
        _ => key_len + 4 + 8 + 4 + 8 + 1 + 1 + 4 + 4,
    }
}

/// Serialize entries into an index blob payload.
///
/// Layout: `[version u8][key_len u8][entry_count u32][pack_count u32]`,
/// a length-prefixed pack blob id table, then fixed-size entries sorted
/// ascending byte-lexicographically by content id key. Binary-searchable
/// once decoded; the sort order is also the iteration order.
pub fn encode_index(version: u8, entries: &[IndexEntry]) -> Result<Vec<u8>> {
    if entries.is_empty() {
        return Err(StrataError::InvalidFormat(
            "cannot encode an empty index".into(),
        ));
    }
    if version != INDEX_VERSION_1 && version != INDEX_VERSION_2 {
        return Err(StrataError::InvalidFormat(format!(
            "unknown index version {version}"
        )));
    }

    let key_len = entries[0].content_id.key_bytes().len();
    let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.content_id.cmp(&b.content_id));

    // Dedup-index the pack blob ids into a table at the head.
    let mut packs: Vec<&BlobId> = Vec::new();
    let mut pack_idx_of = std::collections::HashMap::new();
    for entry in &sorted {
        pack_idx_of.entry(&entry.pack_blob_id).or_insert_with(|| {
            packs.push(&entry.pack_blob_id);
            (packs.len() - 1) as u32
        });
    }
    if packs.len() > u32::MAX as usize {
        return Err(StrataError::InvalidFormat("too many packs in index".into()));
    }

    let mut out = Vec::with_capacity(
        10 + packs.iter().map(|p| 1 + p.as_str().len()).sum::<usize>()
            + sorted.len() * fixed_entry_size(version, key_len),
    );
    out.push(version);
    out.push(key_len as u8);
    out.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
    out.extend_from_slice(&(packs.len() as u32).to_le_bytes());

    for pack in &packs {
        let bytes = pack.as_str().as_bytes();
        if bytes.len() > u8::MAX as usize {
            return Err(StrataError::InvalidFormat(format!(
                "pack blob id too long: {pack}"
            )));
        }
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }

    for entry in &sorted {
        let key = entry.content_id.key_bytes();
        if key.len() != key_len {
            return Err(StrataError::InvalidFormat(
                "mixed content id lengths in one index".into(),
            ));
        }
        out.extend_from_slice(&key);
        out.extend_from_slice(&pack_idx_of[&entry.pack_blob_id].to_le_bytes());
        match version {
            INDEX_VERSION_1 => {
                let offset: u32 = entry.pack_offset.try_into().map_err(|_| {
                    StrataError::InvalidFormat(format!(
                        "pack offset {} does not fit index v1",
                        entry.pack_offset
                    ))
                })?;
                out.extend_from_slice(&offset.to_le_bytes());
            }
            _ => out.extend_from_slice(&entry.pack_offset.to_le_bytes()),
        }
        out.extend_from_slice(&entry.packed_length.to_le_bytes());
        out.extend_from_slice(&entry.timestamp_seconds.to_le_bytes());
        out.push(if entry.deleted { FLAG_DELETED } else { 0 });
        out.push(entry.format_version);
        if version == INDEX_VERSION_2 {
            out.extend_from_slice(&entry.original_length.to_le_bytes());
            out.extend_from_slice(&entry.compression_id.to_le_bytes());
        }
    }

    Ok(out)
}

/// A decoded index blob: entries sorted by content id, ready for binary
/// search and ordered iteration.
#[derive(Debug, Clone)]
pub struct IndexBlob {
    version: u8,
    entries: Vec<IndexEntry>,
}

impl IndexBlob {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let version = r.u8()?;
        if version != INDEX_VERSION_1 && version != INDEX_VERSION_2 {
            return Err(StrataError::InvalidFormat(format!(
                "unknown index version {version}"
            )));
        }
        let key_len = r.u8()? as usize;
        let entry_count = r.u32()? as usize;
        let pack_count = r.u32()? as usize;

        let mut packs = Vec::with_capacity(pack_count);
        for _ in 0..pack_count {
            let len = r.u8()? as usize;
            let bytes = r.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| StrataError::InvalidFormat("pack id is not UTF-8".into()))?;
            packs.push(BlobId::from(s));
        }

        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let key = r.take(key_len)?.to_vec();
            let content_id = ContentId::from_key_bytes(&key)?;
            let pack_idx = r.u32()? as usize;
            let pack_blob_id = packs
                .get(pack_idx)
                .cloned()
                .ok_or_else(|| StrataError::InvalidFormat("pack index out of range".into()))?;
            let pack_offset = match version {
                INDEX_VERSION_1 => r.u32()? as u64,
                _ => r.u64()?,
            };
            let packed_length = r.u32()?;
            let timestamp_seconds = r.i64()?;
            let flags = r.u8()?;
            let format_version = r.u8()?;
            let (original_length, compression_id) = if version == INDEX_VERSION_2 {
                (r.u32()?, r.u32()?)
            } else {
                (0, 0)
            };
            entries.push(IndexEntry {
                content_id,
                pack_blob_id,
                pack_offset,
                packed_length,
                original_length,
                timestamp_seconds,
                deleted: flags & FLAG_DELETED != 0,
                format_version,
                compression_id,
            });
        }

        // Entries are written sorted; tolerate (and fix) disorder anyway so a
        // foreign-but-well-formed blob still merges correctly.
        if !entries.windows(2).all(|w| w[0].content_id <= w[1].content_id) {
            entries.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        }

        Ok(Self { version, entries })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search by content id.
    pub fn get(&self, id: &ContentId) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.content_id.cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Entries in ascending content id order.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

/// Derive the blob id of an index from its plaintext payload, so equal
/// indexes dedupe to the same blob.
pub fn index_blob_id(payload: &[u8]) -> BlobId {
    let digest = Sha256::digest(payload);
    BlobId::new(format!("n{}", hex::encode(digest)))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(StrataError::InvalidFormat("truncated index blob".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(byte: u8) -> ContentId {
        ContentId::from_hash(None, &[byte; 16]).unwrap()
    }

    fn entry(byte: u8, pack: &str, offset: u64) -> IndexEntry {
        IndexEntry {
            content_id: cid(byte),
            pack_blob_id: BlobId::from(pack),
            pack_offset: offset,
            packed_length: 100,
            original_length: 80,
            timestamp_seconds: 1_700_000_000,
            deleted: false,
            format_version: 2,
            compression_id: 2,
        }
    }

    #[test]
    fn roundtrip_v2() {
        let entries = vec![entry(3, "p01", 0), entry(1, "p01", 100), entry(2, "p02", 0)];
        let encoded = encode_index(INDEX_VERSION_2, &entries).unwrap();
        let blob = IndexBlob::decode(&encoded).unwrap();
        assert_eq!(blob.version(), INDEX_VERSION_2);
        assert_eq!(blob.len(), 3);
        // Sorted ascending regardless of input order.
        let ids: Vec<_> = blob.entries().iter().map(|e| e.content_id).collect();
        assert_eq!(ids, vec![cid(1), cid(2), cid(3)]);
        let found = blob.get(&cid(2)).unwrap();
        assert_eq!(found.pack_blob_id, BlobId::from("p02"));
        assert_eq!(found.original_length, 80);
        assert_eq!(found.compression_id, 2);
    }

    #[test]
    fn roundtrip_v1_drops_v2_fields() {
        let entries = vec![entry(1, "p01", 16)];
        let encoded = encode_index(INDEX_VERSION_1, &entries).unwrap();
        let blob = IndexBlob::decode(&encoded).unwrap();
        let e = blob.get(&cid(1)).unwrap();
        assert_eq!(e.pack_offset, 16);
        assert_eq!(e.original_length, 0);
        assert_eq!(e.compression_id, 0);
    }

    #[test]
    fn v1_rejects_wide_offsets() {
        let entries = vec![entry(1, "p01", u64::from(u32::MAX) + 1)];
        assert!(encode_index(INDEX_VERSION_1, &entries).is_err());
    }

    #[test]
    fn tombstone_roundtrip() {
        let mut e = entry(1, "p01", 0);
        e.deleted = true;
        let encoded = encode_index(INDEX_VERSION_2, &[e]).unwrap();
        let blob = IndexBlob::decode(&encoded).unwrap();
        assert!(blob.get(&cid(1)).unwrap().deleted);
    }

    #[test]
    fn equal_entry_sets_produce_equal_blob_ids() {
        let a = encode_index(INDEX_VERSION_2, &[entry(1, "p01", 0), entry(2, "p01", 50)]).unwrap();
        let b = encode_index(INDEX_VERSION_2, &[entry(2, "p01", 50), entry(1, "p01", 0)]).unwrap();
        assert_eq!(index_blob_id(&a), index_blob_id(&b));
        assert!(index_blob_id(&a).has_prefix('n'));
    }

    #[test]
    fn missing_entry_is_none() {
        let encoded = encode_index(INDEX_VERSION_2, &[entry(1, "p01", 0)]).unwrap();
        let blob = IndexBlob::decode(&encoded).unwrap();
        assert!(blob.get(&cid(9)).is_none());
    }

    #[test]
    fn truncated_blob_is_invalid() {
        let encoded = encode_index(INDEX_VERSION_2, &[entry(1, "p01", 0)]).unwrap();
        assert!(IndexBlob::decode(&encoded[..encoded.len() - 3]).is_err());
        assert!(IndexBlob::decode(&[]).is_err());
    }
}
