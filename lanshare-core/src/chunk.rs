//! Chunk arithmetic: split a file into fixed-size ranges with 1-based sequence numbers.

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024; // 64 KiB

/// Largest file the node will offer.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB

/// One byte range of a file. `seq` starts at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub seq: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

fn effective_size(chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    }
}

/// `ceil(total_len / chunk_size)`. A zero-byte file has no chunks.
pub fn chunk_count(total_len: u64, chunk_size: u64) -> u64 {
    total_len.div_ceil(effective_size(chunk_size))
}

/// Split `total_len` bytes into consecutive ranges of `chunk_size` (the last may be shorter).
pub fn split_into_chunks(total_len: u64, chunk_size: u64) -> Vec<ChunkRange> {
    let size = effective_size(chunk_size);
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut seq = 1u32;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { seq, start, end });
        start = end;
        seq += 1;
    }
    out
}
