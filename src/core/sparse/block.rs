//! A single contiguous run of buffered bytes

/// Bytes buffered at a fixed logical offset
///
/// Blocks are ordered by `offset` inside a [`super::SparseBlockList`], which
/// keeps them non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    offset: u64,
    data: Vec<u8>,
}

impl MemoryBlock {
    pub fn new(offset: u64, data: Vec<u8>) -> Self {
        MemoryBlock { offset, data }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Exclusive end offset
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether `position` falls inside this block
    #[inline]
    pub fn contains(&self, position: u64) -> bool {
        position >= self.offset && position < self.end()
    }

    /// Grow (zero-filling) or shrink the block so it ends at `end`
    pub(crate) fn resize_to_end(&mut self, end: u64) {
        debug_assert!(end >= self.offset);
        self.data.resize((end - self.offset) as usize, 0);
    }

    /// Overwrite bytes starting at absolute `position`, growing if needed
    pub(crate) fn write_at(&mut self, position: u64, bytes: &[u8]) {
        debug_assert!(position >= self.offset);
        let start = (position - self.offset) as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(bytes);
    }

    /// Append the bytes of `other` that lie past this block's end
    ///
    /// Any gap between the two blocks is zero-filled.
    pub(crate) fn absorb_tail_of(&mut self, other: &MemoryBlock) {
        if other.end() <= self.end() {
            return;
        }
        if other.offset > self.end() {
            self.resize_to_end(other.offset);
        }
        let skip = (self.end() - other.offset) as usize;
        self.data.extend_from_slice(&other.data[skip..]);
    }

    /// Keep only bytes before absolute `end`
    pub(crate) fn truncate_at(&mut self, end: u64) {
        if end <= self.offset {
            self.data.clear();
        } else if end < self.end() {
            self.data.truncate((end - self.offset) as usize);
        }
    }

    /// Drop bytes before absolute `start`, moving the block's offset forward
    pub(crate) fn drop_front_until(&mut self, start: u64) {
        if start <= self.offset {
            return;
        }
        if start >= self.end() {
            self.offset = self.end();
            self.data.clear();
            return;
        }
        self.data.drain(..(start - self.offset) as usize);
        self.offset = start;
    }

    /// Split off the bytes from absolute `at` onward into a new block
    pub(crate) fn split_off_at(&mut self, at: u64) -> Option<MemoryBlock> {
        if at <= self.offset || at >= self.end() {
            return None;
        }
        let tail = self.data.split_off((at - self.offset) as usize);
        Some(MemoryBlock::new(at, tail))
    }
}
