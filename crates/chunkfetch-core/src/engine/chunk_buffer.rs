//! In-memory store for retrieved ranges
//!
//! Payloads are keyed by range start so arrivals can land in any order.

use bytes::{Bytes, BytesMut};
use chunkfetch_types::ByteRange;
use std::collections::BTreeMap;

/// Why an insertion was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertRejection {
    /// A payload with this start offset is already stored
    Duplicate,
    /// The payload would overlap a stored range or reach past the total size
    OutOfBounds,
}

/// Ordered mapping from range start offset to payload
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: BTreeMap<u64, Bytes>,
    stored: u64,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` at `start`.
    ///
    /// Insertion is idempotent per start offset; the stored total never
    /// exceeds `total_size`.
    pub fn insert(&mut self, start: u64, payload: Bytes, total_size: u64) -> Result<u64, InsertRejection> {
        let len = payload.len() as u64;
        if len == 0 || start.saturating_add(len) > total_size {
            return Err(InsertRejection::OutOfBounds);
        }
        if self.chunks.contains_key(&start) {
            return Err(InsertRejection::Duplicate);
        }

        let end = start + len - 1;
        if let Some((prev_start, prev)) = self.chunks.range(..start).next_back() {
            if prev_start + prev.len() as u64 > start {
                return Err(InsertRejection::OutOfBounds);
            }
        }
        if let Some((&next_start, _)) = self.chunks.range(start..).next() {
            if next_start <= end {
                return Err(InsertRejection::OutOfBounds);
            }
        }

        self.chunks.insert(start, payload);
        self.stored += len;
        Ok(len)
    }

    /// Total bytes stored
    pub fn stored_bytes(&self) -> u64 {
        self.stored
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Spans currently held, in ascending order
    pub fn retrieved(&self) -> Vec<ByteRange> {
        self.chunks
            .iter()
            .map(|(&start, payload)| ByteRange::from_len(start, payload.len() as u64))
            .collect()
    }

    /// Whether every byte of `[0, total_size - 1]` is present
    pub fn is_complete(&self, total_size: u64) -> bool {
        // Stored ranges never overlap, so the byte count decides coverage
        total_size > 0 && self.stored == total_size
    }

    /// Concatenate the stored payloads in ascending start order
    pub fn assemble(&self) -> Bytes {
        if self.chunks.len() == 1 {
            if let Some(only) = self.chunks.values().next() {
                return only.clone();
            }
        }
        let mut out = BytesMut::with_capacity(self.stored as usize);
        for payload in self.chunks.values() {
            out.extend_from_slice(payload);
        }
        out.freeze()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.stored = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_of(fill: u8, len: usize) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn test_out_of_order_assembly() {
        let mut buffer = ChunkBuffer::new();
        assert_eq!(buffer.insert(4, Bytes::from_static(b"efgh"), 10), Ok(4));
        assert_eq!(buffer.insert(8, Bytes::from_static(b"ij"), 10), Ok(2));
        assert!(!buffer.is_complete(10));
        assert_eq!(buffer.insert(0, Bytes::from_static(b"abcd"), 10), Ok(4));

        assert!(buffer.is_complete(10));
        assert_eq!(&buffer.assemble()[..], b"abcdefghij");
    }

    #[test]
    fn test_duplicate_insert_is_not_counted() {
        let mut buffer = ChunkBuffer::new();
        buffer.insert(0, bytes_of(1, 5), 10).unwrap();
        assert_eq!(buffer.insert(0, bytes_of(1, 5), 10), Err(InsertRejection::Duplicate));
        assert_eq!(buffer.stored_bytes(), 5);
    }

    #[test]
    fn test_rejects_overlap_and_overflow() {
        let mut buffer = ChunkBuffer::new();
        buffer.insert(10, bytes_of(0, 10), 100).unwrap();
        assert_eq!(buffer.insert(5, bytes_of(0, 6), 100), Err(InsertRejection::OutOfBounds));
        assert_eq!(buffer.insert(19, bytes_of(0, 2), 100), Err(InsertRejection::OutOfBounds));
        assert_eq!(buffer.insert(95, bytes_of(0, 6), 100), Err(InsertRejection::OutOfBounds));
        assert_eq!(buffer.insert(20, bytes_of(0, 0), 100), Err(InsertRejection::OutOfBounds));
        assert_eq!(buffer.stored_bytes(), 10);
    }

    #[test]
    fn test_retrieved_spans_and_clear() {
        let mut buffer = ChunkBuffer::new();
        buffer.insert(30, bytes_of(0, 10), 100).unwrap();
        buffer.insert(0, bytes_of(0, 10), 100).unwrap();
        assert_eq!(
            buffer.retrieved(),
            vec![ByteRange::new(0, 9), ByteRange::new(30, 39)]
        );

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.stored_bytes(), 0);
        assert!(buffer.retrieved().is_empty());
    }
}
