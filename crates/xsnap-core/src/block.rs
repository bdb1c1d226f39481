//! Chunk block
//!
//! Variable-length data (strings, bigint digits, array items, bytecode,
//! buffer bytes) lives in chunks carved out of one contiguous byte buffer.
//! A chunk is addressed by the offset of its data, so the whole block can be
//! written and read back verbatim: offsets survive relocation unchanged.
//!
//! Layout of a chunk: `size: u32 (little-endian) | data | padding to 8`.

use std::fmt;
use std::num::NonZeroU32;

/// Size of the chunk header
pub const CHUNK_HEADER: usize = 4;

/// Chunk alignment
pub const CHUNK_ALIGN: usize = 8;

/// Offset of a chunk's data inside the block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkRef(NonZeroU32);

impl ChunkRef {
    /// Create from a raw offset, `None` for 0
    pub fn new(offset: u32) -> Option<Self> {
        NonZeroU32::new(offset).map(Self)
    }

    /// Offset of the chunk data in the block
    pub fn offset(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// Contiguous chunk memory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    bytes: Vec<u8>,
    incremental: usize,
}

impl Block {
    /// Create an empty block reserving `initial` bytes
    pub fn with_capacity(initial: usize, incremental: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(initial),
            incremental: incremental.max(CHUNK_ALIGN),
        }
    }

    /// Adopt bytes read from a snapshot. The chunk chain is not checked here,
    /// see [`Block::chunks`].
    pub fn from_bytes(bytes: Vec<u8>, incremental: usize) -> Self {
        Self {
            bytes,
            incremental: incremental.max(CHUNK_ALIGN),
        }
    }

    /// Raw bytes, as written to snapshots
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Used size in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Has nothing been allocated yet
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Allocate a chunk holding a copy of `data`
    pub fn allocate(&mut self, data: &[u8]) -> ChunkRef {
        let start = self.bytes.len();
        let total = align(CHUNK_HEADER + data.len());
        if self.bytes.capacity() - start < total {
            self.bytes.reserve(total.max(self.incremental));
        }
        self.bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self.bytes.resize(start + total, 0);
        // the header precedes the data, so the offset is never 0
        ChunkRef(NonZeroU32::MIN.saturating_add((start + CHUNK_HEADER - 1) as u32))
    }

    /// Size of a chunk's data
    pub fn size(&self, chunk: ChunkRef) -> usize {
        let at = chunk.offset() as usize - CHUNK_HEADER;
        let mut header = [0u8; CHUNK_HEADER];
        header.copy_from_slice(&self.bytes[at..at + CHUNK_HEADER]);
        u32::from_le_bytes(header) as usize
    }

    /// Chunk data
    pub fn data(&self, chunk: ChunkRef) -> &[u8] {
        let start = chunk.offset() as usize;
        &self.bytes[start..start + self.size(chunk)]
    }

    /// Mutable chunk data
    pub fn data_mut(&mut self, chunk: ChunkRef) -> &mut [u8] {
        let start = chunk.offset() as usize;
        let size = self.size(chunk);
        &mut self.bytes[start..start + size]
    }

    /// Walk the chunk chain. Yields `Err(offset)` at the first header that
    /// does not fit in the block and stops.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            bytes: &self.bytes,
            at: 0,
            failed: false,
        }
    }
}

/// Iterator over the chunks of a block
pub struct Chunks<'a> {
    bytes: &'a [u8],
    at: usize,
    failed: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Result<ChunkRef, u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.at >= self.bytes.len() {
            return None;
        }
        let at = self.at;
        if at + CHUNK_HEADER > self.bytes.len() {
            self.failed = true;
            return Some(Err(at as u32));
        }
        let mut header = [0u8; CHUNK_HEADER];
        header.copy_from_slice(&self.bytes[at..at + CHUNK_HEADER]);
        let size = u32::from_le_bytes(header) as usize;
        let total = align(CHUNK_HEADER + size);
        if at + total > self.bytes.len() {
            self.failed = true;
            return Some(Err(at as u32));
        }
        self.at = at + total;
        Some(ChunkRef::new((at + CHUNK_HEADER) as u32).ok_or(at as u32))
    }
}

fn align(size: usize) -> usize {
    (size + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_aligned() {
        let mut block = Block::with_capacity(64, 64);
        let a = block.allocate(b"abc");
        let b = block.allocate(b"defghijkl");
        assert_eq!(a.offset(), 4);
        assert_eq!(b.offset(), 12);
        assert_eq!(block.len(), 24);
        assert_eq!(block.data(a), b"abc");
        assert_eq!(block.data(b), b"defghijkl");
    }

    #[test]
    fn test_chunks_reports_truncated_header() {
        let mut block = Block::with_capacity(0, 0);
        block.allocate(b"hello");
        let mut bytes = block.as_bytes().to_vec();
        bytes.extend_from_slice(&[200, 0, 0, 0]);
        let damaged = Block::from_bytes(bytes, 0);
        let chunks: Vec<_> = damaged.chunks().collect();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert_eq!(chunks[1], Err(16));
    }

    #[test]
    fn test_empty_chunk() {
        let mut block = Block::with_capacity(0, 0);
        let empty = block.allocate(&[]);
        assert_eq!(block.size(empty), 0);
        assert!(block.data(empty).is_empty());
    }
}
