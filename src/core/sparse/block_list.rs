//! Ordered, non-overlapping collection of memory blocks

use super::block::MemoryBlock;
use crate::config::SparseConfig;
use crate::error::Result;
use crate::stream::{checked_end, overlap};
use std::io::{self, Write};
use tracing::trace;

const ZERO_CHUNK: usize = 4096;

/// Merge and sizing policy for a block list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockListOptions {
    /// Bridge small gaps with zero-fill instead of allocating a new block
    pub auto_merge_gaps: bool,
    /// Gaps strictly below this size are bridged
    pub merge_gap_threshold: u64,
    /// No block grows past this size
    pub max_block_size: u64,
}

impl Default for BlockListOptions {
    fn default() -> Self {
        BlockListOptions::from(&SparseConfig::default())
    }
}

impl From<&SparseConfig> for BlockListOptions {
    fn from(config: &SparseConfig) -> Self {
        BlockListOptions {
            auto_merge_gaps: config.auto_merge_gaps,
            merge_gap_threshold: config.merge_gap_threshold,
            max_block_size: config.max_block_size,
        }
    }
}

/// Sorted list of [`MemoryBlock`]s describing a sparse byte range
///
/// # Invariants
///
/// - Blocks are sorted by offset in ascending order
/// - Blocks do not overlap: `blocks[i].end() <= blocks[i + 1].offset()`
/// - No block is empty
/// - `memory_usage` equals the sum of block lengths
#[derive(Debug, Default)]
pub struct SparseBlockList {
    blocks: Vec<MemoryBlock>,
    memory_usage: u64,
    options: BlockListOptions,
}

impl SparseBlockList {
    pub fn new(options: BlockListOptions) -> Self {
        SparseBlockList {
            blocks: Vec::new(),
            memory_usage: 0,
            options,
        }
    }

    pub fn options(&self) -> BlockListOptions {
        self.options
    }

    /// Bytes currently held by all blocks
    pub fn memory_usage(&self) -> u64 {
        self.memory_usage
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    /// `(offset, len)` of every block in offset order
    pub fn ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks.iter().map(|b| (b.offset(), b.len()))
    }

    fn search(&self, offset: u64) -> std::result::Result<usize, usize> {
        self.blocks.binary_search_by(|block| block.offset().cmp(&offset))
    }

    /// Index of the block containing or preceding `position`
    fn preceding(&self, position: u64) -> Option<usize> {
        match self.search(position) {
            Ok(i) => Some(i),
            Err(0) => None,
            Err(i) => Some(i - 1),
        }
    }

    /// Offset of the first block starting after `position`
    pub fn next_block_offset_after(&self, position: u64) -> Option<u64> {
        let i = self.blocks.partition_point(|b| b.offset() <= position);
        self.blocks.get(i).map(|b| b.offset())
    }

    /// Copy buffered bytes overlapping `[position, position + buf.len())`
    ///
    /// The destination is zero-filled first so unbuffered gaps read as zero.
    /// Returns the length of the region covered by blocks without a gap,
    /// starting exactly at `position`; 0 when `position` lies in a gap.
    pub fn read(&self, position: u64, buf: &mut [u8]) -> usize {
        buf.fill(0);
        if buf.is_empty() {
            return 0;
        }

        let len = buf.len() as u64;
        let first = match self.preceding(position) {
            Some(i) if self.blocks[i].end() > position => i,
            Some(i) => i + 1,
            None => 0,
        };

        let mut covered = 0u64;
        let mut contiguous = true;
        for block in &self.blocks[first..] {
            let Some((start, size)) = overlap(block.offset(), block.len(), position, len) else {
                break;
            };
            let src = (start - block.offset()) as usize;
            let dst = (start - position) as usize;
            let size_usize = size as usize;
            buf[dst..dst + size_usize].copy_from_slice(&block.data()[src..src + size_usize]);

            if contiguous && start == position + covered {
                covered += size;
            } else {
                contiguous = false;
            }
        }

        covered as usize
    }

    /// Insert `data` at `position`, merging or truncating neighbours
    pub fn write(&mut self, position: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = checked_end(position, data.len() as u64)?;

        let host = match self.extend_predecessor(position, end, data) {
            Some(idx) => idx,
            None => self.insert_block(position, data),
        };
        self.reconcile_successors(host, end);

        trace!(
            position,
            len = data.len(),
            blocks = self.blocks.len(),
            memory = self.memory_usage,
            "sparse write"
        );

        #[cfg(debug_assertions)]
        self.validate();

        Ok(())
    }

    /// Grow the block at or before `position` in place when it can reach the write
    fn extend_predecessor(&mut self, position: u64, end: u64, data: &[u8]) -> Option<usize> {
        let idx = self.preceding(position)?;
        let options = self.options;
        let block = &mut self.blocks[idx];

        let reachable = position <= block.end()
            || (options.auto_merge_gaps && position - block.end() < options.merge_gap_threshold);
        let new_end = block.end().max(end);
        if !reachable || new_end - block.offset() > options.max_block_size {
            return None;
        }

        let before = block.len();
        block.write_at(position, data);
        self.memory_usage += block.len() - before;
        Some(idx)
    }

    /// Allocate a new block, splitting a predecessor that overlaps its start
    fn insert_block(&mut self, position: u64, data: &[u8]) -> usize {
        let idx = match self.preceding(position) {
            Some(i) if self.blocks[i].end() > position => {
                if self.blocks[i].offset() == position {
                    // The old block becomes a successor and is reconciled below
                    i
                } else {
                    if let Some(tail) = self.blocks[i].split_off_at(position) {
                        self.blocks.insert(i + 1, tail);
                    }
                    i + 1
                }
            }
            Some(i) => i + 1,
            None => 0,
        };

        self.blocks
            .insert(idx, MemoryBlock::new(position, data.to_vec()));
        self.memory_usage += data.len() as u64;
        idx
    }

    /// Remove, truncate or absorb blocks following the freshly written host
    fn reconcile_successors(&mut self, host: usize, end: u64) {
        let options = self.options;

        while host + 1 < self.blocks.len() {
            let next = host + 1;
            let host_offset = self.blocks[host].offset();
            let host_end = self.blocks[host].end();
            let next_offset = self.blocks[next].offset();
            let next_end = self.blocks[next].end();
            let fits = next_end.max(host_end) - host_offset <= options.max_block_size;

            if next_offset < end {
                if next_end <= end {
                    self.remove_block(next);
                    continue;
                }
                if !fits {
                    let before = self.blocks[next].len();
                    self.blocks[next].drop_front_until(end);
                    self.memory_usage -= before - self.blocks[next].len();
                    break;
                }
            } else {
                let gap = next_offset - host_end;
                let mergeable =
                    gap == 0 || (options.auto_merge_gaps && gap < options.merge_gap_threshold);
                if !mergeable || !fits {
                    break;
                }
            }

            let absorbed = self.remove_block(next);
            let before = self.blocks[host].len();
            self.blocks[host].absorb_tail_of(&absorbed);
            self.memory_usage += self.blocks[host].len() - before;
        }
    }

    fn remove_block(&mut self, idx: usize) -> MemoryBlock {
        let block = self.blocks.remove(idx);
        self.memory_usage -= block.len();
        block
    }

    /// Drop everything at or beyond `new_len`
    pub fn truncate(&mut self, new_len: u64) {
        let keep = self.blocks.partition_point(|b| b.offset() < new_len);
        let removed: u64 = self.blocks[keep..].iter().map(MemoryBlock::len).sum();
        self.blocks.truncate(keep);
        self.memory_usage -= removed;

        if let Some(last) = self.blocks.last_mut() {
            if last.end() > new_len {
                let before = last.len();
                last.truncate_at(new_len);
                self.memory_usage -= before - last.len();
            }
        }

        #[cfg(debug_assertions)]
        self.validate();
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.memory_usage = 0;
    }

    /// Serialize `[0, logical_length)` to `sink`, zero-filling gaps
    pub fn write_to<W: Write + ?Sized>(&self, sink: &mut W, logical_length: u64) -> io::Result<u64> {
        let mut cursor = 0u64;
        for block in &self.blocks {
            if block.offset() >= logical_length {
                break;
            }
            write_zeros(sink, block.offset() - cursor)?;
            let take = (block.end().min(logical_length) - block.offset()) as usize;
            sink.write_all(&block.data()[..take])?;
            cursor = block.offset() + take as u64;
        }
        write_zeros(sink, logical_length.saturating_sub(cursor))?;
        Ok(logical_length)
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        let mut total = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            debug_assert!(!block.is_empty(), "block {} is empty", i);
            if i > 0 {
                let prev = &self.blocks[i - 1];
                debug_assert!(
                    prev.end() <= block.offset(),
                    "blocks must not overlap: block {} ends at {}, block {} starts at {}",
                    i - 1,
                    prev.end(),
                    i,
                    block.offset()
                );
            }
            total += block.len();
        }
        debug_assert_eq!(total, self.memory_usage, "memory usage out of sync");
    }
}

pub(crate) fn write_zeros<W: Write + ?Sized>(sink: &mut W, mut count: u64) -> io::Result<()> {
    let zeros = [0u8; ZERO_CHUNK];
    while count > 0 {
        let n = count.min(ZERO_CHUNK as u64) as usize;
        sink.write_all(&zeros[..n])?;
        count -= n as u64;
    }
    Ok(())
}
