use std::collections::HashSet;
use std::ops::Bound;

use strata_types::blob_id::BlobId;
use strata_types::content_id::ContentId;
use strata_types::error::Result;

use super::index::{IndexBlob, IndexEntry};

/// Pick the authoritative entry when two indexes describe the same content.
///
/// Precedence: larger timestamp wins; at equal timestamps the tombstone wins
/// (so deletes survive coalescing at the same instant); within equal deleted
/// flags the larger `(pack_blob_id, pack_offset)` wins as stable arbitration.
pub fn reconcile<'a>(a: &'a IndexEntry, b: &'a IndexEntry) -> &'a IndexEntry {
    if entry_wins(b, a) {
        b
    } else {
        a
    }
}

/// Whether `candidate` supersedes `current` under the precedence rule.
fn entry_wins(candidate: &IndexEntry, current: &IndexEntry) -> bool {
    if candidate.timestamp_seconds != current.timestamp_seconds {
        return candidate.timestamp_seconds > current.timestamp_seconds;
    }
    if candidate.deleted != current.deleted {
        return candidate.deleted;
    }
    (&candidate.pack_blob_id, candidate.pack_offset) > (&current.pack_blob_id, current.pack_offset)
}

/// Immutable merged view over a set of index blobs.
///
/// Built at session open and swapped wholesale on refresh; readers hold an
/// `Arc` so lookups stay lock-free after the build.
#[derive(Debug, Default)]
pub struct MergedIndex {
    /// Reconciled entries sorted by content id.
    entries: Vec<IndexEntry>,
    /// Ids of the index blobs this view was built from.
    source_blobs: Vec<BlobId>,
}

impl MergedIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge loaded index blobs, applying the precedence rule per content id.
    pub fn build(blobs: Vec<(BlobId, IndexBlob)>) -> Self {
        let mut source_blobs = Vec::with_capacity(blobs.len());
        let mut all: Vec<IndexEntry> = Vec::new();
        for (id, blob) in blobs {
            source_blobs.push(id);
            all.extend_from_slice(blob.entries());
        }
        all.sort_by(|a, b| a.content_id.cmp(&b.content_id));

        let mut entries: Vec<IndexEntry> = Vec::with_capacity(all.len());
        for entry in all {
            match entries.last_mut() {
                Some(last) if last.content_id == entry.content_id => {
                    if entry_wins(&entry, last) {
                        *last = entry;
                    }
                }
                _ => entries.push(entry),
            }
        }

        Self {
            entries,
            source_blobs,
        }
    }

    /// Authoritative entry for a content id, tombstones included.
    pub fn get(&self, id: &ContentId) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by(|e| e.content_id.cmp(id))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Stream entries in ascending content id order, starting at `start`.
    pub fn iterate(
        &self,
        start: Bound<&ContentId>,
        include_deleted: bool,
        cb: &mut dyn FnMut(&IndexEntry) -> Result<()>,
    ) -> Result<()> {
        let begin = match start {
            Bound::Unbounded => 0,
            Bound::Included(id) => self
                .entries
                .partition_point(|e| e.content_id < *id),
            Bound::Excluded(id) => self
                .entries
                .partition_point(|e| e.content_id <= *id),
        };
        for entry in &self.entries[begin..] {
            if entry.deleted && !include_deleted {
                continue;
            }
            cb(entry)?;
        }
        Ok(())
    }

    /// Every pack blob referenced by an authoritative entry.
    pub fn referenced_packs(&self) -> HashSet<BlobId> {
        self.entries
            .iter()
            .filter(|e| !e.pack_blob_id.as_str().is_empty())
            .map(|e| e.pack_blob_id.clone())
            .collect()
    }

    /// Ids of the index blobs this view was built from.
    pub fn source_blobs(&self) -> &[BlobId] {
        &self.source_blobs
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::index::{encode_index, INDEX_VERSION_2};

    fn cid(byte: u8) -> ContentId {
        ContentId::from_hash(None, &[byte; 16]).unwrap()
    }

    fn entry(byte: u8, ts: i64, deleted: bool, pack: &str) -> IndexEntry {
        IndexEntry {
            content_id: cid(byte),
            pack_blob_id: BlobId::from(pack),
            pack_offset: 0,
            packed_length: 10,
            original_length: 10,
            timestamp_seconds: ts,
            deleted,
            format_version: 2,
            compression_id: 0,
        }
    }

    fn blob_of(entries: &[IndexEntry]) -> (BlobId, IndexBlob) {
        let payload = encode_index(INDEX_VERSION_2, entries).unwrap();
        (
            crate::content::index::index_blob_id(&payload),
            IndexBlob::decode(&payload).unwrap(),
        )
    }

    #[test]
    fn newer_timestamp_wins() {
        let merged = MergedIndex::build(vec![
            blob_of(&[entry(1, 100, false, "p-old")]),
            blob_of(&[entry(1, 200, false, "p-new")]),
        ]);
        assert_eq!(merged.get(&cid(1)).unwrap().pack_blob_id, BlobId::from("p-new"));
    }

    #[test]
    fn tombstone_wins_at_equal_timestamp() {
        let merged = MergedIndex::build(vec![
            blob_of(&[entry(1, 100, false, "p01")]),
            blob_of(&[entry(1, 100, true, "p01")]),
        ]);
        assert!(merged.get(&cid(1)).unwrap().deleted);
    }

    #[test]
    fn later_write_beats_earlier_tombstone() {
        let merged = MergedIndex::build(vec![
            blob_of(&[entry(1, 100, true, "p01")]),
            blob_of(&[entry(1, 150, false, "p02")]),
        ]);
        let e = merged.get(&cid(1)).unwrap();
        assert!(!e.deleted);
        assert_eq!(e.pack_blob_id, BlobId::from("p02"));
    }

    #[test]
    fn location_arbitration_is_stable() {
        let a = entry(1, 100, false, "pa");
        let b = entry(1, 100, false, "pb");
        let left = MergedIndex::build(vec![blob_of(&[a.clone()]), blob_of(&[b.clone()])]);
        let right = MergedIndex::build(vec![blob_of(&[b]), blob_of(&[a])]);
        assert_eq!(
            left.get(&cid(1)).unwrap().pack_blob_id,
            right.get(&cid(1)).unwrap().pack_blob_id
        );
        assert_eq!(left.get(&cid(1)).unwrap().pack_blob_id, BlobId::from("pb"));
    }

    #[test]
    fn iterate_skips_tombstones_unless_asked() {
        let merged = MergedIndex::build(vec![blob_of(&[
            entry(1, 100, false, "p01"),
            entry(2, 100, true, "p01"),
            entry(3, 100, false, "p01"),
        ])]);

        let mut seen = Vec::new();
        merged
            .iterate(Bound::Unbounded, false, &mut |e| {
                seen.push(e.content_id);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![cid(1), cid(3)]);

        let mut seen_all = Vec::new();
        merged
            .iterate(Bound::Unbounded, true, &mut |e| {
                seen_all.push(e.content_id);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen_all, vec![cid(1), cid(2), cid(3)]);
    }

    #[test]
    fn iterate_respects_start_bound() {
        let merged = MergedIndex::build(vec![blob_of(&[
            entry(1, 100, false, "p01"),
            entry(2, 100, false, "p01"),
            entry(3, 100, false, "p01"),
        ])]);
        let mut seen = Vec::new();
        let start = cid(2);
        merged
            .iterate(Bound::Included(&start), false, &mut |e| {
                seen.push(e.content_id);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![cid(2), cid(3)]);
    }

    #[test]
    fn referenced_packs_excludes_empty() {
        let mut tombstone = entry(2, 100, true, "");
        tombstone.packed_length = 0;
        let merged = MergedIndex::build(vec![blob_of(&[entry(1, 100, false, "p01"), tombstone])]);
        let packs = merged.referenced_packs();
        assert_eq!(packs.len(), 1);
        assert!(packs.contains(&BlobId::from("p01")));
    }
}
