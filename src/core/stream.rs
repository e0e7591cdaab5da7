//! Uniform random-access stream seam
//!
//! Every layer of the stack (sparse buffer, compression, encryption,
//! versioning) implements [`PartStream`], and so do the raw stores a
//! container hands out (`File`, `Cursor<Vec<u8>>`). Layers compose by
//! wrapping one `PartStream` in another.

use crate::error::{PackageError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Largest offset or length a stream may expose (signed 63-bit contract)
pub const MAX_STREAM_LENGTH: u64 = i64::MAX as u64;

/// Readable, writable, seekable byte stream with an adjustable length
pub trait PartStream: Read + Write + Seek + Send {
    /// Current logical length in bytes
    fn length(&mut self) -> io::Result<u64>;

    /// Truncate or extend the stream
    fn set_length(&mut self, len: u64) -> io::Result<()>;

    /// Persist buffered state and release owned resources
    ///
    /// Idempotent for the stream types of this crate; raw stores only flush.
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl PartStream for File {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl PartStream for Cursor<Vec<u8>> {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

impl<T: PartStream + ?Sized> PartStream for Box<T> {
    fn length(&mut self) -> io::Result<u64> {
        (**self).length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        (**self).set_length(len)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Cloneable handle to a stream owned jointly by several parties
///
/// A one-directional codec reading from a base stream needs to own its
/// source, while the stream that created the codec keeps using the same
/// base afterwards. Every call locks the inner stream for its duration.
#[derive(Debug)]
pub struct SharedStream<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStream<S> {
    fn clone(&self) -> Self {
        SharedStream {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> SharedStream<S> {
    pub fn new(stream: S) -> Self {
        SharedStream {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Lock the inner stream
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }

    /// Recover the inner stream once every other handle is gone
    pub fn try_into_inner(self) -> Result<S> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|_| PackageError::IllegalState("stream is still shared".to_string()))
    }
}

impl SharedStream<Cursor<Vec<u8>>> {
    /// In-memory stream, convenient for tests and the in-memory container
    pub fn memory(bytes: Vec<u8>) -> Self {
        SharedStream::new(Cursor::new(bytes))
    }

    /// Copy of the current bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().get_ref().clone()
    }
}

impl<S: Read> Read for SharedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().read(buf)
    }
}

impl<S: Write> Write for SharedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

impl<S: Seek> Seek for SharedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.lock().seek(pos)
    }
}

impl<S: PartStream> PartStream for SharedStream<S> {
    fn length(&mut self) -> io::Result<u64> {
        self.inner.lock().length()
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        self.inner.lock().set_length(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.lock().close()
    }
}

/// Process-wide mutual exclusion for secondary (disk-backed) storage
///
/// Injected into every sparse buffer instead of living in a global, so that
/// independent buffers sharing one spill namespace can be serialized by
/// whoever creates them.
#[derive(Debug, Clone, Default)]
pub struct SecondaryStorageLock {
    inner: Arc<Mutex<()>>,
}

impl SecondaryStorageLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the lock for the duration of one secondary-storage operation
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }

    /// Whether two handles guard the same namespace
    pub fn same_as(&self, other: &SecondaryStorageLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// `offset + len`, failing on overflow or on exceeding the stream limit
pub fn checked_end(offset: u64, len: u64) -> Result<u64> {
    match offset.checked_add(len) {
        Some(end) if end <= MAX_STREAM_LENGTH => Ok(end),
        _ => Err(PackageError::Overflow),
    }
}

/// Resolve a seek request against the current position and length
pub fn resolve_seek(position: u64, length: u64, pos: SeekFrom) -> Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(offset) => {
            if offset > MAX_STREAM_LENGTH {
                return Err(PackageError::invalid(format!(
                    "seek offset {} exceeds the stream limit",
                    offset
                )));
            }
            return Ok(offset);
        }
        SeekFrom::Current(delta) => (position, delta),
        SeekFrom::End(delta) => (length, delta),
    };

    let target = i128::from(base) + i128::from(delta);
    if target < 0 {
        return Err(PackageError::invalid(format!(
            "seek to negative offset {}",
            target
        )));
    }
    if target > i128::from(MAX_STREAM_LENGTH) {
        return Err(PackageError::invalid(format!(
            "seek offset {} exceeds the stream limit",
            target
        )));
    }
    Ok(target as u64)
}

/// Intersection of `[a_offset, a_offset + a_len)` and `[b_offset, b_offset + b_len)`
///
/// Returns `(offset, len)` of the overlap, or `None` when the ranges are disjoint.
pub fn overlap(a_offset: u64, a_len: u64, b_offset: u64, b_len: u64) -> Option<(u64, u64)> {
    let start = a_offset.max(b_offset);
    let end = a_offset.saturating_add(a_len).min(b_offset.saturating_add(b_len));
    if end > start {
        Some((start, end - start))
    } else {
        None
    }
}

/// Round `value` down to a multiple of `block`
pub(crate) fn align_down(value: u64, block: u64) -> u64 {
    value - value % block
}

/// Round `value` up to a multiple of `block`
pub(crate) fn align_up(value: u64, block: u64) -> Result<u64> {
    match value % block {
        0 => Ok(value),
        rem => checked_end(value, block - rem),
    }
}

/// Keep reading until `buf` is full or the source is exhausted
pub(crate) fn read_fully<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_seek() {
        assert_eq!(resolve_seek(10, 100, SeekFrom::Start(5)).unwrap(), 5);
        assert_eq!(resolve_seek(10, 100, SeekFrom::Current(-4)).unwrap(), 6);
        assert_eq!(resolve_seek(10, 100, SeekFrom::End(-1)).unwrap(), 99);
        assert_eq!(resolve_seek(10, 100, SeekFrom::End(50)).unwrap(), 150);
    }

    #[test]
    fn test_negative_seek_rejected() {
        let err = resolve_seek(10, 100, SeekFrom::Current(-11)).unwrap_err();
        assert!(matches!(err, PackageError::InvalidArgument(_)));

        let err = resolve_seek(0, 0, SeekFrom::End(-1)).unwrap_err();
        assert!(matches!(err, PackageError::InvalidArgument(_)));
    }

    #[test]
    fn test_checked_end() {
        assert_eq!(checked_end(10, 5).unwrap(), 15);
        assert!(matches!(
            checked_end(u64::MAX, 1),
            Err(PackageError::Overflow)
        ));
        assert!(matches!(
            checked_end(MAX_STREAM_LENGTH, 1),
            Err(PackageError::Overflow)
        ));
    }

    #[test]
    fn test_overlap() {
        assert_eq!(overlap(0, 10, 5, 10), Some((5, 5)));
        assert_eq!(overlap(5, 10, 0, 10), Some((5, 5)));
        assert_eq!(overlap(0, 10, 2, 3), Some((2, 3)));
        assert_eq!(overlap(0, 10, 10, 3), None);
        assert_eq!(overlap(0, 0, 0, 3), None);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_down(17, 16), 16);
        assert_eq!(align_up(17, 16).unwrap(), 32);
        assert_eq!(align_up(32, 16).unwrap(), 32);
        assert_eq!(align_up(0, 16).unwrap(), 0);
    }

    #[test]
    fn test_shared_stream_sees_writes() {
        let shared = SharedStream::memory(Vec::new());
        let mut writer = shared.clone();
        writer.write_all(b"hello").unwrap();

        assert_eq!(shared.to_vec(), b"hello");
        assert!(shared.clone().try_into_inner().is_err());
    }

    #[test]
    fn test_cursor_set_length() {
        let mut cursor = Cursor::new(b"abcdef".to_vec());
        cursor.set_length(3).unwrap();
        assert_eq!(cursor.length().unwrap(), 3);
        cursor.set_length(5).unwrap();
        assert_eq!(cursor.get_ref(), b"abc\0\0");
    }

    #[test]
    fn test_lock_identity() {
        let lock = SecondaryStorageLock::new();
        let clone = lock.clone();
        assert!(lock.same_as(&clone));
        assert!(!lock.same_as(&SecondaryStorageLock::new()));
        drop(clone.acquire());
    }
}
