use super::Codec;
use crate::config::StreamContext;
use crate::error::Result;
use crate::sparse::SparseMemoryStream;
use crate::stream::{PartStream, SharedStream};
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

/// Random-access view over a compressed base stream
///
/// The whole payload is decompressed into a sparse buffer up front; `flush`
/// recompresses the buffer over the truncated base.
pub struct CompressEmulationStream<S> {
    base: SharedStream<S>,
    codec: Arc<dyn Codec>,
    buffer: SparseMemoryStream,
    dirty: bool,
}

impl<S: PartStream> CompressEmulationStream<S> {
    pub fn new(base: SharedStream<S>, codec: Arc<dyn Codec>, ctx: &StreamContext) -> Result<Self> {
        let mut buffer = SparseMemoryStream::from_context(ctx);
        {
            let mut raw = base.lock();
            if raw.length()? > 0 {
                raw.seek(SeekFrom::Start(0))?;
                let size = codec.decompress(&mut *raw, &mut buffer)?;
                debug!(
                    method = %codec.method(),
                    size,
                    overflowed = buffer.is_overflowed(),
                    "decompressed part into emulation buffer"
                );
            }
        }

        Ok(CompressEmulationStream {
            base,
            codec,
            buffer,
            dirty: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn read_at(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.buffer.read_at(position, buf)
    }

    pub fn write_at(&mut self, position: u64, data: &[u8]) -> Result<()> {
        self.buffer.write_at(position, data)?;
        self.dirty = true;
        Ok(())
    }

    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.buffer.set_len(len)?;
        self.dirty = true;
        Ok(())
    }

    /// Recompress the buffer into the base if anything changed
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut raw = self.base.lock();
        raw.set_length(0)?;
        raw.seek(SeekFrom::Start(0))?;
        if self.buffer.is_empty() {
            raw.write_all(&self.codec.empty_payload()?)?;
        } else {
            self.buffer.seek(SeekFrom::Start(0))?;
            self.codec.compress(&mut self.buffer, &mut *raw)?;
        }
        raw.flush()?;

        debug!(
            method = %self.codec.method(),
            size = self.buffer.len(),
            "recompressed emulation buffer"
        );
        self.dirty = false;
        Ok(())
    }

    /// Release the buffer without flushing
    pub fn close(&mut self) {
        self.buffer.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{codec_for, CompressionMethod};
    use std::io::Cursor;

    fn compressed(method: CompressionMethod, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        codec_for(method, 6)
            .compress(&mut &data[..], &mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_edits_are_recompressed() {
        let base = SharedStream::new(Cursor::new(compressed(
            CompressionMethod::Deflate,
            b"hello world",
        )));
        let codec = codec_for(CompressionMethod::Deflate, 6);
        let ctx = StreamContext::default();

        let mut emulation =
            CompressEmulationStream::new(base.clone(), codec.clone(), &ctx).unwrap();
        assert_eq!(emulation.len(), 11);
        emulation.write_at(0, b"HELLO").unwrap();
        emulation.flush().unwrap();
        assert!(!emulation.is_dirty());

        let raw = base.lock().get_ref().clone();
        let mut restored = Vec::new();
        codec.decompress(&mut raw.as_slice(), &mut restored).unwrap();
        assert_eq!(restored, b"HELLO world");
    }

    #[test]
    fn test_clean_flush_leaves_base_untouched() {
        let payload = compressed(CompressionMethod::Zstd, b"unchanged");
        let base = SharedStream::new(Cursor::new(payload.clone()));
        let codec = codec_for(CompressionMethod::Zstd, 3);

        let mut emulation =
            CompressEmulationStream::new(base.clone(), codec, &StreamContext::default()).unwrap();
        let mut buf = [0u8; 9];
        emulation.read_at(0, &mut buf).unwrap();
        emulation.flush().unwrap();

        assert_eq!(&buf, b"unchanged");
        assert_eq!(base.lock().get_ref(), &payload);
    }

    #[test]
    fn test_truncated_to_empty_writes_empty_payload() {
        let base = SharedStream::new(Cursor::new(compressed(CompressionMethod::Deflate, b"abc")));
        let codec = codec_for(CompressionMethod::Deflate, 6);

        let mut emulation =
            CompressEmulationStream::new(base.clone(), codec, &StreamContext::default()).unwrap();
        emulation.set_len(0).unwrap();
        emulation.flush().unwrap();

        assert_eq!(base.lock().get_ref(), &vec![0x03, 0x00]);
    }
}
