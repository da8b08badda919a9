//! Range arithmetic for segmented downloads
//!
//! Splits a resource into fixed-size inclusive byte ranges and works out
//! which ranges are still missing after a partial transfer. No state, no I/O.

use chunkfetch_types::ByteRange;

/// Split `[0, total_size - 1]` into ranges of `chunk_size` bytes.
///
/// The final range is clipped to `total_size - 1`. Returns an empty plan
/// when either argument is zero.
pub fn plan_ranges(total_size: u64, chunk_size: u64) -> Vec<ByteRange> {
    if total_size == 0 || chunk_size == 0 {
        return Vec::new();
    }

    let mut ranges = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    while start < total_size {
        let end = start.saturating_add(chunk_size - 1).min(total_size - 1);
        ranges.push(ByteRange::new(start, end));
        start = end + 1;
    }
    ranges
}

/// Ranges of `[0, total_size - 1]` not covered by `retrieved`.
///
/// Gaps between retrieved spans are emitted whole, as is the trailing gap
/// after the last span. With nothing retrieved the result equals
/// [`plan_ranges`].
pub fn missing_ranges(total_size: u64, chunk_size: u64, retrieved: &[ByteRange]) -> Vec<ByteRange> {
    if total_size == 0 {
        return Vec::new();
    }
    if retrieved.is_empty() {
        return plan_ranges(total_size, chunk_size);
    }

    let mut spans = retrieved.to_vec();
    spans.sort_by_key(|r| r.start);

    let mut missing = Vec::new();
    // Next byte not yet known to be covered
    let mut cursor = 0u64;
    for span in spans {
        if span.start >= total_size {
            break;
        }
        if span.start > cursor {
            missing.push(ByteRange::new(cursor, span.start - 1));
        }
        cursor = cursor.max(span.end.saturating_add(1));
    }

    if cursor < total_size {
        missing.push(ByteRange::new(cursor, total_size - 1));
    }
    missing
}

/// Cut `range` into pieces of at most `chunk_size` bytes
pub fn split_range(range: ByteRange, chunk_size: u64) -> Vec<ByteRange> {
    if chunk_size == 0 {
        return vec![range];
    }
    plan_ranges(range.len(), chunk_size)
        .into_iter()
        .map(|r| ByteRange::new(range.start + r.start, range.start + r.end))
        .collect()
}

/// Scheduler bound to a fixed chunk size
#[derive(Debug, Clone, Copy)]
pub struct ChunkScheduler {
    chunk_size: u64,
}

impl ChunkScheduler {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn plan(&self, total_size: u64) -> Vec<ByteRange> {
        plan_ranges(total_size, self.chunk_size)
    }

    pub fn missing(&self, total_size: u64, retrieved: &[ByteRange]) -> Vec<ByteRange> {
        missing_ranges(total_size, self.chunk_size, retrieved)
    }

    pub fn split(&self, range: ByteRange) -> Vec<ByteRange> {
        split_range(range, self.chunk_size)
    }

    /// Missing ranges re-chunked for issuance
    pub fn work_list(&self, total_size: u64, retrieved: &[ByteRange]) -> Vec<ByteRange> {
        self.missing(total_size, retrieved)
            .into_iter()
            .flat_map(|gap| self.split(gap))
            .collect()
    }
}
