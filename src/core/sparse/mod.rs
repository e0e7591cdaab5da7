//! Sparse in-memory buffering with overflow to secondary storage
//!
//! - [`MemoryBlock`]: one contiguous run of bytes at an offset
//! - [`SparseBlockList`]: sorted, non-overlapping blocks with gap merging
//! - [`SparseMemoryStream`]: the seekable stream built on the block list,
//!   spilling into a temp file past the high water mark

mod block;
mod block_list;
mod stream;

pub use block::MemoryBlock;
pub use block_list::{BlockListOptions, SparseBlockList};
pub use stream::SparseMemoryStream;

pub(crate) use block_list::write_zeros;
