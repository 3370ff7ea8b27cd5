use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Half-open byte interval `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn from_size(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start + size,
        }
    }

    pub fn count(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, pos: u64) -> bool {
        self.start <= pos && pos < self.end
    }

    pub fn contains_range(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// One decoded article: its bytes plus where they sit in the whole file.
#[derive(Debug, Clone, Default)]
pub struct SegmentData {
    pub body: Bytes,
    pub range: ByteRange,
    /// Size of the whole file the segment belongs to.
    pub file_size: u64,
    /// Declared size of this part.
    pub part_size: u64,
}

impl SegmentData {
    /// The decoded bytes at and after `pos` (an absolute file offset).
    pub fn slice_from(&self, pos: u64) -> Bytes {
        if !self.range.contains(pos) {
            return Bytes::new();
        }
        let offset = (pos - self.range.start) as usize;
        if offset >= self.body.len() {
            return Bytes::new();
        }
        self.body.slice(offset..)
    }
}
