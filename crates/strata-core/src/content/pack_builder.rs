use std::collections::HashMap;

use rand::RngCore;

use strata_types::blob_id::BlobId;
use strata_types::content_id::ContentId;
use strata_types::error::{Result, StrataError};

use super::index::IndexEntry;
use crate::gather::WriteBuffer;

/// A content queued in the current pack, not yet visible to readers.
#[derive(Debug, Clone)]
struct PendingContent {
    content_id: ContentId,
    offset: u64,
    packed_length: u32,
    original_length: u32,
    compression_id: u32,
    timestamp_seconds: i64,
    format_version: u8,
    deleted: bool,
}

/// A finalised pack ready for upload, plus the index entries describing it.
pub struct SealedPack {
    pub blob_id: BlobId,
    pub data: Vec<u8>,
    pub entries: Vec<IndexEntry>,
}

/// Accumulates encrypted content payloads for one pack prefix (`p` or `q`).
///
/// The pack blob is a raw concatenation of payloads with no framing; the
/// index entries produced at seal time carry the offsets. One builder per
/// prefix per session; writes are serialised by the session writer and
/// readers never touch an in-flight builder.
pub struct PackBuilder {
    prefix: char,
    buffer: WriteBuffer,
    pending: Vec<PendingContent>,
    by_id: HashMap<ContentId, usize>,
    max_pack_size: usize,
}

impl PackBuilder {
    pub fn new(prefix: char, max_pack_size: usize) -> Self {
        Self {
            prefix,
            buffer: WriteBuffer::new(),
            pending: Vec::new(),
            by_id: HashMap::new(),
            max_pack_size,
        }
    }

    pub fn prefix(&self) -> char {
        self.prefix
    }

    /// Append an encrypted payload and record its pending index entry.
    pub fn add(
        &mut self,
        content_id: ContentId,
        payload: &[u8],
        original_length: u32,
        compression_id: u32,
        timestamp_seconds: i64,
        format_version: u8,
    ) -> Result<()> {
        self.add_with_flags(
            content_id,
            payload,
            original_length,
            compression_id,
            timestamp_seconds,
            format_version,
            false,
        )
    }

    /// Append a payload carrying an explicit deleted flag. Content rewrite
    /// uses this to move tombstoned contents into a fresh pack without
    /// resurrecting them.
    #[allow(clippy::too_many_arguments)]
    pub fn add_with_flags(
        &mut self,
        content_id: ContentId,
        payload: &[u8],
        original_length: u32,
        compression_id: u32,
        timestamp_seconds: i64,
        format_version: u8,
        deleted: bool,
    ) -> Result<()> {
        if payload.len() > self.max_pack_size {
            return Err(StrataError::Oversized(payload.len() as u64));
        }
        let offset = self.buffer.len() as u64;
        self.buffer.append(payload);
        self.by_id.insert(content_id, self.pending.len());
        self.pending.push(PendingContent {
            content_id,
            offset,
            packed_length: payload.len() as u32,
            original_length,
            compression_id,
            timestamp_seconds,
            format_version,
            deleted,
        });
        Ok(())
    }

    /// Whether a content is queued in this builder.
    pub fn contains(&self, id: &ContentId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Copy out the encrypted payload of a pending content, for reads of
    /// own writes before the pack is flushed.
    pub fn pending_payload(&self, id: &ContentId) -> Option<Vec<u8>> {
        let p = &self.pending[*self.by_id.get(id)?];
        self.buffer
            .section_to_vec(p.offset as usize, p.packed_length as usize)
            .ok()
    }

    /// Byte size the pack would have right now.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// The pack is finalised when its byte size reaches the maximum.
    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.max_pack_size
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Finalise the pack: choose a fresh random blob id with this builder's
    /// prefix, hand back the bytes and index entries, and reset.
    pub fn seal(&mut self) -> Option<SealedPack> {
        if self.pending.is_empty() {
            return None;
        }

        let blob_id = random_pack_id(self.prefix);
        let entries = self
            .pending
            .drain(..)
            .map(|p| IndexEntry {
                content_id: p.content_id,
                pack_blob_id: blob_id.clone(),
                pack_offset: p.offset,
                packed_length: p.packed_length,
                original_length: p.original_length,
                timestamp_seconds: p.timestamp_seconds,
                deleted: p.deleted,
                format_version: p.format_version,
                compression_id: p.compression_id,
            })
            .collect();
        let data = self.buffer.to_contiguous();
        self.buffer.reset();
        self.by_id.clear();

        Some(SealedPack {
            blob_id,
            data,
            entries,
        })
    }
}

/// A fresh pack blob id: prefix + 32 hex characters of random bytes.
pub fn random_pack_id(prefix: char) -> BlobId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    BlobId::new(format!("{prefix}{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(byte: u8) -> ContentId {
        ContentId::from_hash(None, &[byte; 16]).unwrap()
    }

    fn add_simple(b: &mut PackBuilder, byte: u8, payload: &[u8]) {
        b.add(cid(byte), payload, payload.len() as u32, 0, 1_700_000_000, 2)
            .unwrap();
    }

    #[test]
    fn offsets_are_contiguous() {
        let mut b = PackBuilder::new('p', 1 << 20);
        add_simple(&mut b, 1, b"aaaa");
        add_simple(&mut b, 2, b"bbbbbb");
        let sealed = b.seal().unwrap();
        assert_eq!(sealed.data, b"aaaabbbbbb");
        assert_eq!(sealed.entries[0].pack_offset, 0);
        assert_eq!(sealed.entries[0].packed_length, 4);
        assert_eq!(sealed.entries[1].pack_offset, 4);
        assert_eq!(sealed.entries[1].packed_length, 6);
        assert!(sealed.blob_id.has_prefix('p'));
        assert_eq!(sealed.blob_id.as_str().len(), 33);
    }

    #[test]
    fn is_full_after_max_size() {
        let mut b = PackBuilder::new('p', 8);
        assert!(!b.is_full());
        add_simple(&mut b, 1, b"0123456789");
        assert!(b.is_full());
    }

    #[test]
    fn oversized_payload_rejected() {
        let mut b = PackBuilder::new('p', 4);
        assert!(matches!(
            b.add(cid(1), b"too large", 9, 0, 0, 2),
            Err(StrataError::Oversized(_))
        ));
    }

    #[test]
    fn pending_payload_reads_back() {
        let mut b = PackBuilder::new('q', 1 << 20);
        add_simple(&mut b, 1, b"first");
        add_simple(&mut b, 2, b"second");
        assert!(b.contains(&cid(2)));
        assert_eq!(b.pending_payload(&cid(2)).unwrap(), b"second");
        assert!(b.pending_payload(&cid(9)).is_none());
    }

    #[test]
    fn seal_resets_builder() {
        let mut b = PackBuilder::new('p', 1 << 20);
        add_simple(&mut b, 1, b"data");
        let first = b.seal().unwrap();
        assert!(!b.has_pending());
        assert!(b.seal().is_none());

        add_simple(&mut b, 2, b"more");
        let second = b.seal().unwrap();
        assert_ne!(first.blob_id, second.blob_id);
    }
}
