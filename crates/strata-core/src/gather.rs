use std::io::Write;
use std::sync::Mutex;

use strata_types::error::{Result, StrataError};

/// Size of each pooled chunk. Pack assembly, encryption, and uploads append
/// into these instead of growing one contiguous allocation.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on pooled free chunks (4 MiB of standby memory).
const MAX_POOLED_CHUNKS: usize = 64;

static CHUNK_POOL: Mutex<Vec<Box<[u8; CHUNK_SIZE]>>> = Mutex::new(Vec::new());

fn alloc_chunk() -> Box<[u8; CHUNK_SIZE]> {
    if let Some(chunk) = CHUNK_POOL.lock().unwrap().pop() {
        return chunk;
    }
    // Zeroed allocation keeps the unsafe-free path; the cost is negligible
    // next to hashing and encryption of the same bytes.
    Box::new([0u8; CHUNK_SIZE])
}

fn release_chunk(chunk: Box<[u8; CHUNK_SIZE]>) {
    let mut pool = CHUNK_POOL.lock().unwrap();
    if pool.len() < MAX_POOLED_CHUNKS {
        pool.push(chunk);
    }
}

/// A scatter-gather byte buffer: an ordered sequence of pooled fixed-size
/// chunks, only the last of which is partially filled.
///
/// Avoids large contiguous allocations on the write path; consumers read
/// either through [`WriteBuffer::section_to`] or by materializing with
/// [`WriteBuffer::to_contiguous`].
#[derive(Default)]
pub struct WriteBuffer {
    chunks: Vec<Box<[u8; CHUNK_SIZE]>>,
    /// Filled bytes of the final chunk. All earlier chunks are full.
    last_len: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes in the buffer.
    pub fn len(&self) -> usize {
        match self.chunks.len() {
            0 => 0,
            n => (n - 1) * CHUNK_SIZE + self.last_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append bytes, spilling into fresh pooled chunks as needed.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.chunks.is_empty() || self.last_len == CHUNK_SIZE {
                self.chunks.push(alloc_chunk());
                self.last_len = 0;
            }
            let chunk = self.chunks.last_mut().unwrap();
            let n = data.len().min(CHUNK_SIZE - self.last_len);
            chunk[self.last_len..self.last_len + n].copy_from_slice(&data[..n]);
            self.last_len += n;
            data = &data[n..];
        }
    }

    /// Write `size` bytes starting at `offset` to `w`.
    pub fn section_to(&self, w: &mut dyn Write, offset: usize, size: usize) -> Result<()> {
        if offset + size > self.len() {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length: size as i64,
            });
        }
        let mut remaining = size;
        let mut pos = offset;
        while remaining > 0 {
            let chunk_idx = pos / CHUNK_SIZE;
            let within = pos % CHUNK_SIZE;
            let chunk_len = self.chunk_len(chunk_idx);
            let n = remaining.min(chunk_len - within);
            w.write_all(&self.chunks[chunk_idx][within..within + n])?;
            pos += n;
            remaining -= n;
        }
        Ok(())
    }

    /// Copy a section into a `Vec`.
    pub fn section_to_vec(&self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size);
        self.section_to(&mut out, offset, size)?;
        Ok(out)
    }

    /// Materialize the whole buffer as one contiguous `Vec`.
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for (i, chunk) in self.chunks.iter().enumerate() {
            out.extend_from_slice(&chunk[..self.chunk_len(i)]);
        }
        out
    }

    /// Release all chunks back to the pool and reset to empty.
    pub fn reset(&mut self) {
        for chunk in self.chunks.drain(..) {
            release_chunk(chunk);
        }
        self.last_len = 0;
    }

    fn chunk_len(&self, idx: usize) -> usize {
        if idx + 1 == self.chunks.len() {
            self.last_len
        } else {
            CHUNK_SIZE
        }
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        self.reset();
    }
}

impl Write for WriteBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
