//! Virtual random-access stream over a sparse block list
//!
//! Buffered bytes live in a [`SparseBlockList`] until their total exceeds the
//! high water mark; then the whole content moves into an anonymous temp
//! file and stays there until the stream shrinks below the low water mark.
//! Exactly one representation is authoritative at any time.

use super::block_list::{BlockListOptions, SparseBlockList};
use crate::config::{SparseConfig, StreamContext};
use crate::error::{PackageError, Result};
use crate::stream::{checked_end, resolve_seek, PartStream, SecondaryStorageLock};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

enum Backing {
    /// Blocks are authoritative; a previously used spill file is kept truncated
    InMemory {
        blocks: SparseBlockList,
        spare: Option<File>,
    },
    /// The spill file is authoritative and holds `length` bytes
    Overflowed { file: File },
    Closed,
}

/// Sparse, arbitrarily large random-access byte stream
pub struct SparseMemoryStream {
    backing: Backing,
    length: u64,
    position: u64,
    low_water_mark: u64,
    high_water_mark: u64,
    options: BlockListOptions,
    spill_dir: Option<PathBuf>,
    lock: SecondaryStorageLock,
}

impl std::fmt::Debug for SparseMemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseMemoryStream")
            .field("length", &self.length)
            .field("position", &self.position)
            .field("overflowed", &self.is_overflowed())
            .field("memory", &self.memory_consumption())
            .finish()
    }
}

impl SparseMemoryStream {
    pub fn new(config: &SparseConfig, lock: SecondaryStorageLock) -> Self {
        SparseMemoryStream {
            backing: Backing::InMemory {
                blocks: SparseBlockList::new(BlockListOptions::from(config)),
                spare: None,
            },
            length: 0,
            position: 0,
            low_water_mark: config.low_water_mark,
            high_water_mark: config.high_water_mark,
            options: BlockListOptions::from(config),
            spill_dir: config.spill_dir.clone(),
            lock,
        }
    }

    /// Buffer configured from a stream context
    pub fn from_context(ctx: &StreamContext) -> Self {
        Self::new(&ctx.config.sparse, ctx.lock.clone())
    }

    /// Buffer that never spills
    pub fn in_memory() -> Self {
        Self::new(&SparseConfig::in_memory(), SecondaryStorageLock::new())
    }

    /// Buffer that never spills and never zero-fills between writes
    pub fn in_memory_exact() -> Self {
        Self::new(&SparseConfig::in_memory_exact(), SecondaryStorageLock::new())
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_overflowed(&self) -> bool {
        matches!(self.backing, Backing::Overflowed { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.backing, Backing::Closed)
    }

    /// Bytes currently held in memory by this stream
    pub fn memory_consumption(&self) -> u64 {
        match &self.backing {
            Backing::InMemory { blocks, .. } => blocks.memory_usage(),
            _ => 0,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(PackageError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Read into `buf` from `position`, zero-filling unbuffered gaps
    ///
    /// Returns the full clipped count; 0 only at or past the end.
    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let count = self.clip(position, buf.len());
        if count == 0 {
            return Ok(0);
        }
        let buf = &mut buf[..count];

        match &mut self.backing {
            Backing::InMemory { blocks, .. } => {
                blocks.read(position, buf);
            }
            Backing::Overflowed { file } => {
                let _guard = self.lock.acquire();
                file.seek(SeekFrom::Start(position))?;
                file.read_exact(buf)?;
            }
            Backing::Closed => return Err(PackageError::Disposed),
        }
        Ok(count)
    }

    /// Read only bytes that are actually buffered, starting at `position`
    ///
    /// Returns the contiguous buffered count from `position` (0 when
    /// `position` sits in a gap). An overflowed stream counts as fully
    /// buffered.
    pub fn read_covered(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let count = self.clip(position, buf.len());
        if count == 0 {
            return Ok(0);
        }
        if self.is_overflowed() {
            return self.read_at(position, &mut buf[..count]);
        }
        match &self.backing {
            Backing::InMemory { blocks, .. } => Ok(blocks.read(position, &mut buf[..count])),
            _ => Err(PackageError::Disposed),
        }
    }

    /// Offset of the first buffered block starting after `position`
    pub fn next_block_offset_after(&self, position: u64) -> Option<u64> {
        match &self.backing {
            Backing::InMemory { blocks, .. } => blocks.next_block_offset_after(position),
            _ => None,
        }
    }

    /// `(offset, len)` of buffered regions in offset order
    pub fn block_ranges(&self) -> Vec<(u64, u64)> {
        match &self.backing {
            Backing::InMemory { blocks, .. } => blocks.ranges().collect(),
            Backing::Overflowed { .. } if self.length > 0 => vec![(0, self.length)],
            _ => Vec::new(),
        }
    }

    fn clip(&self, position: u64, requested: usize) -> usize {
        if position >= self.length {
            0
        } else {
            (self.length - position).min(requested as u64) as usize
        }
    }

    /// Write `data` at `position`, extending the stream if needed
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        let end = checked_end(position, data.len() as u64)?;

        match &mut self.backing {
            Backing::InMemory { blocks, .. } => blocks.write(position, data)?,
            Backing::Overflowed { file } => {
                let _guard = self.lock.acquire();
                file.seek(SeekFrom::Start(position))?;
                file.write_all(data)?;
            }
            Backing::Closed => return Err(PackageError::Disposed),
        }

        self.length = self.length.max(end);
        self.switch_mode_if_necessary()
    }

    /// Truncate or extend; growth allocates nothing and reads as zero
    pub fn set_len(&mut self, new_len: u64) -> Result<()> {
        self.ensure_open()?;
        checked_end(new_len, 0)?;

        match &mut self.backing {
            Backing::InMemory { blocks, .. } => {
                if new_len < self.length {
                    blocks.truncate(new_len);
                }
            }
            Backing::Overflowed { file } => {
                let _guard = self.lock.acquire();
                file.set_len(new_len)?;
            }
            Backing::Closed => return Err(PackageError::Disposed),
        }

        self.length = new_len;
        self.switch_mode_if_necessary()
    }

    fn switch_mode_if_necessary(&mut self) -> Result<()> {
        match &self.backing {
            Backing::InMemory { blocks, .. } if blocks.memory_usage() > self.high_water_mark => {
                self.spill_to_secondary()
            }
            Backing::Overflowed { .. } if self.length < self.low_water_mark => {
                self.load_into_memory()
            }
            _ => Ok(()),
        }
    }

    fn spill_to_secondary(&mut self) -> Result<()> {
        let Backing::InMemory { blocks, spare } = &mut self.backing else {
            return Err(PackageError::IllegalState(
                "spill requested while not in memory".to_string(),
            ));
        };

        // Blocks stay authoritative until the spill file is complete
        let _guard = self.lock.acquire();
        let mut file = match spare.take() {
            Some(file) => file,
            None => match &self.spill_dir {
                Some(dir) => tempfile::tempfile_in(dir)?,
                None => tempfile::tempfile()?,
            },
        };
        if let Err(e) = write_spill_file(&mut file, blocks, self.length) {
            *spare = Some(file);
            return Err(e.into());
        }

        debug!(
            length = self.length,
            memory = blocks.memory_usage(),
            high_water_mark = self.high_water_mark,
            "sparse stream spilled to secondary storage"
        );

        self.backing = Backing::Overflowed { file };
        Ok(())
    }

    fn load_into_memory(&mut self) -> Result<()> {
        let Backing::Overflowed { file } = &mut self.backing else {
            return Err(PackageError::IllegalState(
                "reload requested while not overflowed".to_string(),
            ));
        };

        let _guard = self.lock.acquire();
        let mut content = vec![0u8; self.length as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut content)?;

        // One write lands as a single block
        let mut blocks = SparseBlockList::new(self.options);
        blocks.write(0, &content)?;
        file.set_len(0)?;

        debug!(
            length = self.length,
            low_water_mark = self.low_water_mark,
            "sparse stream reloaded into memory"
        );

        let spare = match std::mem::replace(&mut self.backing, Backing::Closed) {
            Backing::Overflowed { file } => Some(file),
            _ => None,
        };
        self.backing = Backing::InMemory { blocks, spare };
        Ok(())
    }

    /// Serialize the whole logical content (gaps as zeros) to `sink`
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        self.ensure_open()?;
        match &mut self.backing {
            Backing::InMemory { blocks, .. } => Ok(blocks.write_to(sink, self.length)?),
            Backing::Overflowed { file } => {
                let _guard = self.lock.acquire();
                file.seek(SeekFrom::Start(0))?;
                let copied = io::copy(&mut (&*file).take(self.length), sink)?;
                Ok(copied)
            }
            Backing::Closed => Err(PackageError::Disposed),
        }
    }

    /// Release every block and the spill file
    pub fn close(&mut self) {
        if let Backing::Overflowed { file } | Backing::InMemory { spare: Some(file), .. } =
            std::mem::replace(&mut self.backing, Backing::Closed)
        {
            let _guard = self.lock.acquire();
            drop(file);
        }
        self.length = 0;
        self.position = 0;
    }
}

fn write_spill_file(file: &mut File, blocks: &SparseBlockList, length: u64) -> io::Result<()> {
    file.set_len(0)?;
    for block in blocks.blocks() {
        file.seek(SeekFrom::Start(block.offset()))?;
        file.write_all(block.data())?;
    }
    file.set_len(length)
}

impl Read for SparseMemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for SparseMemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ensure_open()?;
        Ok(())
    }
}

impl Seek for SparseMemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_open()?;
        self.position = resolve_seek(self.position, self.length, pos)?;
        Ok(self.position)
    }
}

impl PartStream for SparseMemoryStream {
    fn length(&mut self) -> io::Result<u64> {
        self.ensure_open()?;
        Ok(self.length)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.set_len(len)?)
    }

    fn close(&mut self) -> io::Result<()> {
        SparseMemoryStream::close(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(low: u64, high: u64) -> SparseMemoryStream {
        SparseMemoryStream::new(
            &SparseConfig::with_water_marks(low, high),
            SecondaryStorageLock::new(),
        )
    }

    #[test]
    fn test_write_then_read() {
        let mut s = stream(0, 1 << 20);
        s.write_all(b"hello world").unwrap();
        s.seek(SeekFrom::Start(6)).unwrap();

        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
        assert_eq!(s.len(), 11);
    }

    #[test]
    fn test_gap_reads_as_zero_with_full_count() {
        let mut s = stream(0, 1 << 20);
        s.write_at(0, b"ab").unwrap();
        s.write_at(1000, b"cd").unwrap();

        let mut buf = [0xffu8; 10];
        assert_eq!(s.read_at(500, &mut buf).unwrap(), 10);
        assert!(buf.iter().all(|&b| b == 0));

        assert_eq!(s.read_covered(500, &mut buf).unwrap(), 0);
        assert_eq!(s.read_covered(0, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_read_past_end() {
        let mut s = stream(0, 1 << 20);
        s.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(s.read_at(3, &mut buf).unwrap(), 0);
        assert_eq!(s.read_at(10, &mut buf).unwrap(), 0);
        assert_eq!(s.read_at(1, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_set_len_shrink_then_grow_zero_fills() {
        let mut s = stream(0, 1 << 20);
        s.write_at(0, &[7u8; 100]).unwrap();
        s.set_len(40).unwrap();
        assert_eq!(s.memory_consumption(), 40);

        let mut buf = [0u8; 10];
        assert_eq!(s.read_at(40, &mut buf).unwrap(), 0);

        s.set_len(80).unwrap();
        assert_eq!(s.read_at(40, &mut buf).unwrap(), 10);
        assert_eq!(buf, [0u8; 10]);
        assert_eq!(s.memory_consumption(), 40);
    }

    #[test]
    fn test_overflow_scenario() {
        let mut s = stream(0, 100);
        s.write_at(0, &[1u8; 50]).unwrap();
        assert!(!s.is_overflowed());

        s.write_at(1000, &[2u8; 100]).unwrap();
        assert!(s.is_overflowed());
        assert_eq!(s.len(), 1100);
        assert_eq!(s.memory_consumption(), 0);

        let mut gap = vec![0xffu8; 950];
        assert_eq!(s.read_at(50, &mut gap).unwrap(), 950);
        assert!(gap.iter().all(|&b| b == 0));

        let mut tail = [0u8; 100];
        s.read_at(1000, &mut tail).unwrap();
        assert_eq!(tail, [2u8; 100]);
    }

    #[test]
    fn test_overflow_and_reload_round_trip() {
        let mut s = stream(64, 128);
        let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        s.write_at(0, &data).unwrap();
        assert!(s.is_overflowed());

        s.set_len(32).unwrap();
        assert!(!s.is_overflowed());
        assert_eq!(s.memory_consumption(), 32);

        let mut buf = [0u8; 32];
        assert_eq!(s.read_at(0, &mut buf).unwrap(), 32);
        assert_eq!(&buf[..], &data[..32]);
    }

    #[test]
    fn test_negative_seek_is_invalid_argument() {
        let mut s = stream(0, 1 << 20);
        let err = s.seek(SeekFrom::Current(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_closed_stream_rejects_operations() {
        let mut s = stream(0, 1 << 20);
        s.write_at(0, b"x").unwrap();
        s.close();

        assert!(matches!(s.write_at(0, b"y"), Err(PackageError::Disposed)));
        let mut buf = [0u8; 1];
        assert!(matches!(s.read_at(0, &mut buf), Err(PackageError::Disposed)));
        assert!(matches!(s.set_len(0), Err(PackageError::Disposed)));
    }

    #[test]
    fn test_write_to_includes_trailing_zeros() {
        let mut s = stream(0, 1 << 20);
        s.write_at(1, b"z").unwrap();
        s.set_len(4).unwrap();

        let mut out = Vec::new();
        assert_eq!(s.write_to(&mut out).unwrap(), 4);
        assert_eq!(out, b"\0z\0\0");
    }

    #[test]
    fn test_write_to_from_overflow() {
        let mut s = stream(0, 4);
        s.write_at(2, b"abcdef").unwrap();
        assert!(s.is_overflowed());

        let mut out = Vec::new();
        s.write_to(&mut out).unwrap();
        assert_eq!(out, b"\0\0abcdef");
    }
}
