use super::BlockCipher;
use crate::config::StreamContext;
use crate::error::{PackageError, Result};
use crate::sparse::SparseMemoryStream;
use crate::stream::{
    align_down, align_up, checked_end, read_fully, resolve_seek, PartStream, MAX_STREAM_LENGTH,
};
use rand::RngCore;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Size of the little-endian plaintext length stored ahead of the ciphertext
pub const LENGTH_PREFIX_SIZE: u64 = 8;

/// Byte-granular stream over block-encrypted storage
///
/// Reads decrypt whole blocks into a read cache; writes only land in a write
/// cache. [`flush`](Self::flush_cache) re-encrypts every block touched by the
/// write cache and persists the length prefix. Bytes beyond the persisted
/// content (padding, regions grown by `set_len` or by writing past the end)
/// read as random filler.
pub struct RightsManagementEncryptedStream<S: PartStream> {
    base: S,
    cipher: Arc<dyn BlockCipher>,
    block_size: u64,
    read_cache: SparseMemoryStream,
    write_cache: SparseMemoryStream,
    logical_length: u64,
    /// Value of the persisted prefix, `None` while the base is still empty
    on_disk_length: Option<u64>,
    /// Persisted plaintext still meaningful after logical truncation
    valid_disk_length: u64,
    position: u64,
    flush_threshold: u64,
    closed: bool,
}

impl<S: PartStream> fmt::Debug for RightsManagementEncryptedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RightsManagementEncryptedStream")
            .field("cipher", &self.cipher)
            .field("logical_length", &self.logical_length)
            .field("on_disk_length", &self.on_disk_length)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S: PartStream> RightsManagementEncryptedStream<S> {
    /// Open an encrypted part; an empty base is a new part
    pub fn open(mut base: S, cipher: Arc<dyn BlockCipher>, ctx: &StreamContext) -> Result<Self> {
        if cipher.block_size() == 0 {
            return Err(PackageError::UnsupportedCipher(
                "cipher block size is zero".to_string(),
            ));
        }
        if !cipher.can_decrypt() {
            return Err(PackageError::UnsupportedCipher(
                "cipher cannot decrypt".to_string(),
            ));
        }

        let physical = base.length()?;
        let on_disk_length = match physical {
            0 => None,
            n if n < LENGTH_PREFIX_SIZE => {
                return Err(PackageError::corrupt(format!(
                    "encrypted part is {} bytes, shorter than its length prefix",
                    n
                )))
            }
            _ => {
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
                base.seek(SeekFrom::Start(0))?;
                base.read_exact(&mut prefix)?;
                let length = u64::from_le_bytes(prefix);
                if length > MAX_STREAM_LENGTH {
                    return Err(PackageError::corrupt(format!(
                        "encrypted length prefix {} exceeds the stream limit",
                        length
                    )));
                }
                Some(length)
            }
        };
        let logical_length = on_disk_length.unwrap_or(0);

        debug!(
            physical,
            logical_length,
            block_size = cipher.block_size(),
            merge = cipher.can_merge_blocks(),
            "opened encrypted stream"
        );

        Ok(RightsManagementEncryptedStream {
            base,
            block_size: cipher.block_size() as u64,
            cipher,
            read_cache: SparseMemoryStream::in_memory_exact(),
            write_cache: SparseMemoryStream::in_memory_exact(),
            logical_length,
            on_disk_length,
            valid_disk_length: logical_length,
            position: 0,
            flush_threshold: ctx.config.encryption.cache_flush_threshold,
            closed: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.logical_length
    }

    pub fn is_empty(&self) -> bool {
        self.logical_length == 0
    }

    /// Length currently recorded in the persisted prefix
    pub fn on_disk_length(&self) -> Option<u64> {
        self.on_disk_length
    }

    pub fn get_ref(&self) -> &S {
        &self.base
    }

    /// Combined memory held by both caches
    pub fn cache_memory(&self) -> u64 {
        self.read_cache.memory_consumption() + self.write_cache.memory_consumption()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(PackageError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Read at most one contiguous run starting at `position`
    ///
    /// Returns at least one byte unless `position` is at or past the end.
    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if position >= self.logical_length || buf.is_empty() {
            return Ok(0);
        }
        let mut count = (self.logical_length - position).min(buf.len() as u64) as usize;

        let staged = self.write_cache.read_covered(position, &mut buf[..count])?;
        if staged > 0 {
            return Ok(staged);
        }

        // Never run into bytes a pending write will replace
        if let Some(next) = self.write_cache.next_block_offset_after(position) {
            count = count.min((next - position) as usize);
        }

        let cached = self.read_cache.read_covered(position, &mut buf[..count])?;
        if cached > 0 {
            return Ok(cached);
        }

        self.fetch_blocks(position, count as u64)?;
        let fetched = self.read_cache.read_covered(position, &mut buf[..count])?;
        if fetched == 0 {
            return Err(PackageError::IllegalState(format!(
                "read cache misses offset {} right after fetching it",
                position
            )));
        }
        Ok(fetched)
    }

    /// Decrypt the block-aligned span covering `[position, position + count)`
    /// into the read cache
    fn fetch_blocks(&mut self, position: u64, count: u64) -> Result<()> {
        let start = align_down(position, self.block_size);
        let end = align_up(checked_end(position, count)?, self.block_size)?;
        let disk_end = align_up(self.on_disk_length.unwrap_or(0), self.block_size)?;

        let mut plain = if start < disk_end {
            let read_end = end.min(disk_end);
            let mut ciphertext = vec![0u8; (read_end - start) as usize];
            self.base
                .seek(SeekFrom::Start(checked_end(LENGTH_PREFIX_SIZE, start)?))?;
            let got = read_fully(&mut self.base, &mut ciphertext)?;
            if got < ciphertext.len() {
                return Err(PackageError::corrupt(format!(
                    "encrypted part truncated mid-block at offset {}",
                    start + got as u64
                )));
            }
            self.decrypt_span(&ciphertext)?
        } else {
            Vec::new()
        };

        // Anything past the meaningful persisted content is filler
        let valid = self.valid_disk_length.saturating_sub(start).min(plain.len() as u64) as usize;
        plain.resize((end - start) as usize, 0);
        rand::thread_rng().fill_bytes(&mut plain[valid..]);

        trace!(start, end, valid, "fetched encrypted blocks");
        self.read_cache.write_at(start, &plain)
    }

    fn decrypt_span(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.cipher.can_merge_blocks() {
            return self.cipher.decrypt(ciphertext);
        }
        let mut plain = Vec::with_capacity(ciphertext.len());
        for block in ciphertext.chunks(self.block_size as usize) {
            plain.extend_from_slice(&self.cipher.decrypt(block)?);
        }
        Ok(plain)
    }

    fn encrypt_span(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.cipher.can_merge_blocks() {
            return self.cipher.encrypt(plaintext);
        }
        let mut ciphertext = Vec::with_capacity(plaintext.len());
        for block in plaintext.chunks(self.block_size as usize) {
            ciphertext.extend_from_slice(&self.cipher.encrypt(block)?);
        }
        Ok(ciphertext)
    }

    /// Stage `data` at `position`; nothing is encrypted until a flush
    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.cipher.can_encrypt() {
            return Err(PackageError::UnsupportedCipher(
                "cipher cannot encrypt".to_string(),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        let end = checked_end(position, data.len() as u64)?;

        self.write_cache.write_at(position, data)?;
        self.logical_length = self.logical_length.max(end);
        Ok(())
    }

    /// Change the logical length; the base is only resized by a flush
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_open()?;
        checked_end(len, 0)?;

        if len < self.logical_length {
            for cache in [&mut self.read_cache, &mut self.write_cache] {
                if cache.len() > len {
                    cache.set_len(len)?;
                }
            }
            self.valid_disk_length = self.valid_disk_length.min(len);
        }
        self.logical_length = len;
        Ok(())
    }

    /// Persist the length prefix and size the base to whole blocks
    pub fn flush_length(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.on_disk_length == Some(self.logical_length) {
            return Ok(());
        }

        let physical = checked_end(
            LENGTH_PREFIX_SIZE,
            align_up(self.logical_length, self.block_size)?,
        )?;
        self.base.seek(SeekFrom::Start(0))?;
        self.base.write_all(&self.logical_length.to_le_bytes())?;
        self.base.set_length(physical)?;
        self.on_disk_length = Some(self.logical_length);

        debug!(
            length = self.logical_length,
            physical, "persisted encrypted length prefix"
        );
        Ok(())
    }

    /// Encrypt every block touched by the write cache, then drop both caches
    pub fn flush_cache(&mut self) -> Result<()> {
        self.ensure_open()?;
        let stale = self.stale_disk_range()?;
        self.flush_length()?;

        let mut ranges = self.write_cache.block_ranges();
        if let Some(range) = stale {
            trace!(offset = range.0, len = range.1, "re-padding truncated plaintext");
            ranges.push(range);
            ranges.sort_unstable();
        }
        let mut high_water = 0u64;
        let mut blocks_written = 0u64;
        for (offset, len) in ranges {
            let start = align_down(offset, self.block_size).max(high_water);
            let end = align_up(checked_end(offset, len)?, self.block_size)?;
            if end <= start {
                continue;
            }

            let mut plain = vec![0u8; (end - start) as usize];
            let readable = (end.min(self.logical_length) - start) as usize;
            let mut filled = 0;
            while filled < readable {
                let n = self.read_at(start + filled as u64, &mut plain[filled..readable])?;
                if n == 0 {
                    return Err(PackageError::IllegalState(format!(
                        "no plaintext available at offset {} while flushing",
                        start + filled as u64
                    )));
                }
                filled += n;
            }
            rand::thread_rng().fill_bytes(&mut plain[readable..]);

            let ciphertext = self.encrypt_span(&plain)?;
            self.base
                .seek(SeekFrom::Start(checked_end(LENGTH_PREFIX_SIZE, start)?))?;
            self.base.write_all(&ciphertext)?;

            blocks_written += (end - start) / self.block_size;
            high_water = end;
        }

        self.read_cache.set_len(0)?;
        self.write_cache.set_len(0)?;
        self.valid_disk_length = self.logical_length;
        self.base.flush()?;

        if blocks_written > 0 {
            debug!(
                blocks = blocks_written,
                length = self.logical_length,
                "flushed encrypted write cache"
            );
        }
        Ok(())
    }

    /// Persisted blocks holding plaintext cut off by `set_len` since the
    /// last flush, as `(offset, len)`
    fn stale_disk_range(&self) -> Result<Option<(u64, u64)>> {
        let previous = self.on_disk_length.unwrap_or(0);
        if self.valid_disk_length >= previous {
            return Ok(None);
        }
        let start = align_down(self.valid_disk_length, self.block_size);
        let end = align_up(previous, self.block_size)?
            .min(align_up(self.logical_length, self.block_size)?);
        Ok((start < end).then(|| (start, end - start)))
    }

    fn flush_if_over_threshold(&mut self) -> Result<()> {
        if self.cache_memory() > self.flush_threshold {
            trace!(memory = self.cache_memory(), "encrypted cache over threshold");
            self.flush_cache()?;
        }
        Ok(())
    }

    /// Flush everything, close the base and release both caches
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = self.flush_cache();
        self.closed = true;
        self.read_cache.close();
        self.write_cache.close();
        flushed?;
        self.base.close()?;
        Ok(())
    }
}

impl<S: PartStream> Read for RightsManagementEncryptedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        self.flush_if_over_threshold()?;
        Ok(n)
    }
}

impl<S: PartStream> Write for RightsManagementEncryptedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        self.flush_if_over_threshold()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_cache()?)
    }
}

impl<S: PartStream> Seek for RightsManagementEncryptedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ensure_open()?;
        self.position = resolve_seek(self.position, self.logical_length, pos)?;
        Ok(self.position)
    }
}

impl<S: PartStream> PartStream for RightsManagementEncryptedStream<S> {
    fn length(&mut self) -> io::Result<u64> {
        self.ensure_open()?;
        Ok(self.logical_length)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.set_len(len)?)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(RightsManagementEncryptedStream::close(self)?)
    }
}

impl<S: PartStream> Drop for RightsManagementEncryptedStream<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!("encrypted stream dropped without close");
        if let Err(e) = RightsManagementEncryptedStream::close(self) {
            warn!(error = %e, "failed to close encrypted stream on drop");
        }
    }
}
