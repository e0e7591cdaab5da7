use super::FormatVersion;
use crate::error::{PackageError, Result};
use crate::stream::{checked_end, resolve_seek, PartStream};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
enum HeaderState {
    Unparsed,
    /// `None` when the part was empty and no header has been written yet
    Parsed(Option<FormatVersion>),
}

/// Owns a versioned base stream and its header state
///
/// Positions taken by the methods here are relative to the end of the
/// header; callers never see the header bytes.
pub struct VersionedStreamOwner<S: PartStream> {
    base: S,
    code_version: FormatVersion,
    header: HeaderState,
    data_offset: u64,
    read_occurred: bool,
    write_occurred: bool,
    closed: bool,
}

impl<S: PartStream> fmt::Debug for VersionedStreamOwner<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStreamOwner")
            .field("code_version", &self.code_version)
            .field("header", &self.header)
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

impl<S: PartStream> VersionedStreamOwner<S> {
    pub fn new(base: S, code_version: FormatVersion) -> Self {
        VersionedStreamOwner {
            base,
            code_version,
            header: HeaderState::Unparsed,
            data_offset: 0,
            read_occurred: false,
            write_occurred: false,
            closed: false,
        }
    }

    pub fn code_version(&self) -> &FormatVersion {
        &self.code_version
    }

    /// Persisted version, parsing the header if needed
    pub fn file_version(&mut self) -> Result<Option<&FormatVersion>> {
        self.ensure_parsed()?;
        match &self.header {
            HeaderState::Parsed(version) => Ok(version.as_ref()),
            HeaderState::Unparsed => Ok(None),
        }
    }

    /// Byte length of the header (0 while none exists)
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(PackageError::Disposed)
        } else {
            Ok(())
        }
    }

    fn ensure_parsed(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let HeaderState::Parsed(_) = self.header {
            return Ok(());
        }

        if self.base.length()? == 0 {
            self.header = HeaderState::Parsed(None);
            self.data_offset = 0;
            return Ok(());
        }

        self.base.seek(SeekFrom::Start(0))?;
        let version = FormatVersion::read_from(&mut self.base)?;
        if !version.same_feature(&self.code_version) {
            return Err(PackageError::FeatureMismatch {
                expected: self.code_version.feature_id.clone(),
                found: version.feature_id,
            });
        }

        debug!(
            feature = %version.feature_id,
            reader = %version.reader,
            updater = %version.updater,
            writer = %version.writer,
            "parsed format version header"
        );
        self.data_offset = version.byte_len();
        self.header = HeaderState::Parsed(Some(version));
        Ok(())
    }

    /// Check the reader version before the first read
    pub fn read_attempt(&mut self) -> Result<()> {
        self.ensure_parsed()?;
        if self.read_occurred {
            return Ok(());
        }

        if let HeaderState::Parsed(Some(file)) = &self.header {
            if !file.is_readable_by(self.code_version.reader) {
                return Err(PackageError::VersionIncompatible {
                    action: "read",
                    required: file.reader.to_string(),
                    supported: self.code_version.reader.to_string(),
                });
            }
        }
        self.read_occurred = true;
        Ok(())
    }

    /// Check the updater version before the first write, writing or
    /// refreshing the header as needed
    pub fn write_attempt(&mut self) -> Result<()> {
        self.ensure_parsed()?;
        if self.write_occurred {
            return Ok(());
        }

        let header = match &self.header {
            HeaderState::Parsed(Some(file)) => {
                if !file.is_updatable_by(self.code_version.updater) {
                    return Err(PackageError::VersionIncompatible {
                        action: "update",
                        required: file.updater.to_string(),
                        supported: self.code_version.updater.to_string(),
                    });
                }
                if file.writer == self.code_version.writer {
                    None
                } else {
                    // The file's own feature id keeps the header length unchanged
                    let mut updated = file.clone();
                    updated.writer = self.code_version.writer;
                    Some(updated)
                }
            }
            _ => Some(self.code_version.clone()),
        };

        if let Some(header) = header {
            self.base.seek(SeekFrom::Start(0))?;
            self.base.write_all(&header.to_bytes())?;
            debug!(
                feature = %header.feature_id,
                writer = %header.writer,
                "wrote format version header"
            );
            self.data_offset = header.byte_len();
            self.header = HeaderState::Parsed(Some(header));
        }
        self.write_occurred = true;
        Ok(())
    }

    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.read_attempt()?;
        self.base
            .seek(SeekFrom::Start(checked_end(self.data_offset, position)?))?;
        Ok(self.base.read(buf)?)
    }

    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.write_attempt()?;
        self.base
            .seek(SeekFrom::Start(checked_end(self.data_offset, position)?))?;
        self.base.write_all(data)?;
        Ok(())
    }

    /// Payload length (header excluded)
    pub fn len(&mut self) -> Result<u64> {
        self.ensure_parsed()?;
        Ok(self.base.length()?.saturating_sub(self.data_offset))
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.write_attempt()?;
        self.base.set_length(checked_end(self.data_offset, len)?)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        Ok(self.base.flush()?)
    }

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        Ok(self.base.close()?)
    }
}

/// Positioned handle onto a shared [`VersionedStreamOwner`]
///
/// Clones share the owner (and so the header state) but keep independent
/// positions.
pub struct VersionedStream<S: PartStream> {
    owner: Arc<Mutex<VersionedStreamOwner<S>>>,
    position: u64,
}

impl<S: PartStream> Clone for VersionedStream<S> {
    fn clone(&self) -> Self {
        VersionedStream {
            owner: Arc::clone(&self.owner),
            position: self.position,
        }
    }
}

impl<S: PartStream> fmt::Debug for VersionedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedStream")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<S: PartStream> VersionedStream<S> {
    pub fn new(base: S, code_version: FormatVersion) -> Self {
        VersionedStream {
            owner: Arc::new(Mutex::new(VersionedStreamOwner::new(base, code_version))),
            position: 0,
        }
    }

    pub fn owner(&self) -> &Arc<Mutex<VersionedStreamOwner<S>>> {
        &self.owner
    }

    /// Persisted version of the part, if it has one
    pub fn file_version(&self) -> Result<Option<FormatVersion>> {
        Ok(self.owner.lock().file_version()?.cloned())
    }

    pub fn len(&self) -> Result<u64> {
        self.owner.lock().len()
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl<S: PartStream> Read for VersionedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.owner.lock().read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: PartStream> Write for VersionedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.owner.lock().write_at(self.position, buf)?;
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.owner.lock().flush()?)
    }
}

impl<S: PartStream> Seek for VersionedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let length = match pos {
            SeekFrom::End(_) => self.owner.lock().len()?,
            _ => 0,
        };
        self.position = resolve_seek(self.position, length, pos)?;
        Ok(self.position)
    }
}

impl<S: PartStream> PartStream for VersionedStream<S> {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.owner.lock().len()?)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.owner.lock().set_len(len)?)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(self.owner.lock().close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SharedStream;
    use crate::versioning::VersionPair;
    use std::io::Cursor;

    fn code(version: VersionPair) -> FormatVersion {
        FormatVersion::new("Test.Feature", version)
    }

    #[test]
    fn test_header_written_on_first_write() {
        let raw = SharedStream::memory(Vec::new());
        let mut stream = VersionedStream::new(raw.clone(), code(VersionPair::new(1, 0)));
        stream.write_all(b"payload").unwrap();

        let header_len = code(VersionPair::new(1, 0)).byte_len() as usize;
        let bytes = raw.to_vec();
        assert_eq!(bytes.len(), header_len + 7);
        assert_eq!(&bytes[header_len..], b"payload");
        assert_eq!(stream.len().unwrap(), 7);

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
    }

    #[test]
    fn test_newer_reader_required() {
        let mut bytes = code(VersionPair::new(2, 0)).to_bytes();
        bytes.extend_from_slice(b"data");

        let mut stream = VersionedStream::new(Cursor::new(bytes), code(VersionPair::new(1, 0)));
        let err = PackageError::from(stream.read(&mut [0u8; 4]).unwrap_err());
        assert!(matches!(
            err,
            PackageError::VersionIncompatible { action: "read", .. }
        ));
    }

    #[test]
    fn test_updater_gate() {
        let file = FormatVersion::with_versions(
            "Test.Feature",
            VersionPair::new(1, 0),
            VersionPair::new(3, 0),
            VersionPair::new(3, 0),
        );
        let stream = VersionedStream::new(Cursor::new(file.to_bytes()), code(VersionPair::new(2, 0)));

        let mut reader = stream.clone();
        assert_eq!(reader.read(&mut [0u8; 4]).unwrap(), 0);

        let mut writer = stream;
        let err = PackageError::from(writer.write(b"x").unwrap_err());
        assert!(matches!(
            err,
            PackageError::VersionIncompatible {
                action: "update",
                ..
            }
        ));
    }

    #[test]
    fn test_write_refreshes_writer_version() {
        let file = FormatVersion::with_versions(
            "test.feature",
            VersionPair::new(1, 0),
            VersionPair::new(1, 0),
            VersionPair::new(1, 0),
        );
        let raw = SharedStream::memory(file.to_bytes());
        let mut stream = VersionedStream::new(raw.clone(), code(VersionPair::new(1, 4)));
        stream.write_all(b"z").unwrap();

        let stored = FormatVersion::read_from(&mut raw.to_vec().as_slice()).unwrap();
        assert_eq!(stored.writer, VersionPair::new(1, 4));
        assert_eq!(stored.reader, VersionPair::new(1, 0));
        assert_eq!(stored.feature_id, "test.feature");
    }

    #[test]
    fn test_feature_mismatch() {
        let bytes = FormatVersion::new("Other", VersionPair::new(1, 0)).to_bytes();
        let stream = VersionedStream::new(Cursor::new(bytes), code(VersionPair::new(1, 0)));
        assert!(matches!(
            stream.file_version(),
            Err(PackageError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_views_share_header_but_not_position() {
        let raw = SharedStream::memory(Vec::new());
        let mut a = VersionedStream::new(raw, code(VersionPair::new(1, 0)));
        a.write_all(b"abcdef").unwrap();

        let mut b = a.clone();
        b.seek(SeekFrom::Start(2)).unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");
        assert_eq!(a.position(), 6);
        assert_eq!(b.position(), 4);
    }

    #[test]
    fn test_seek_before_header_is_invalid() {
        let mut stream = VersionedStream::new(
            SharedStream::memory(Vec::new()),
            code(VersionPair::new(1, 0)),
        );
        let err = stream.seek(SeekFrom::End(-1)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
