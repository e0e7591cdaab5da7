use super::{Codec, CodecWriter, CompressionMethod};
use crate::error::{PackageError, Result};
use std::io::{self, Read, Write};

/// A raw deflate stream holding zero bytes: one final, fixed-Huffman block
/// containing only the end-of-block code
pub const DEFLATE_EMPTY_PAYLOAD: [u8; 2] = [0x03, 0x00];

/// Raw deflate (no zlib or gzip framing) via `flate2`
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: flate2::Compression,
}

impl DeflateCodec {
    /// Levels are clamped to 0..=9
    pub fn new(level: i32) -> Self {
        DeflateCodec {
            level: flate2::Compression::new(level.clamp(0, 9) as u32),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        DeflateCodec {
            level: flate2::Compression::default(),
        }
    }
}

impl Codec for DeflateCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Deflate
    }

    fn decoder<'a>(&self, source: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>> {
        Ok(Box::new(flate2::read::DeflateDecoder::new(source)))
    }

    fn encoder<'a>(&self, sink: Box<dyn Write + Send + 'a>) -> Result<Box<dyn CodecWriter + 'a>> {
        Ok(Box::new(flate2::write::DeflateEncoder::new(sink, self.level)))
    }

    fn empty_payload(&self) -> Result<Vec<u8>> {
        Ok(DEFLATE_EMPTY_PAYLOAD.to_vec())
    }
}

impl<W: Write + Send> CodecWriter for flate2::write::DeflateEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = flate2::write::DeflateEncoder::finish(*self)?;
        sink.flush()
    }
}

/// Reports malformed input as `InvalidData`
///
/// `zstd` and `lz4_flex` raise decode failures as `ErrorKind::Other`, which
/// would otherwise be indistinguishable from a failing base stream.
struct DecodeErrors<R>(R);

impl<R: Read> Read for DecodeErrors<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(|e| {
            let from_base = e.get_ref().is_some_and(|inner| inner.is::<PackageError>());
            if e.kind() == io::ErrorKind::Other && !from_base {
                io::Error::new(io::ErrorKind::InvalidData, e)
            } else {
                e
            }
        })
    }
}

/// Zstd frames via `zstd`
#[derive(Debug, Clone, Copy)]
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Codec for ZstdCodec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zstd
    }

    fn decoder<'a>(&self, source: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>> {
        let decoder = zstd::stream::read::Decoder::new(source)?;
        Ok(Box::new(DecodeErrors(decoder)))
    }

    fn encoder<'a>(&self, sink: Box<dyn Write + Send + 'a>) -> Result<Box<dyn CodecWriter + 'a>> {
        let encoder = zstd::stream::write::Encoder::new(sink, self.level)?;
        Ok(Box::new(encoder))
    }
}

impl<W: Write + Send> CodecWriter for zstd::stream::write::Encoder<'static, W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = zstd::stream::write::Encoder::finish(*self)?;
        sink.flush()
    }
}

/// LZ4 frame format via `lz4_flex`
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Lz4Codec {
    pub fn new() -> Self {
        Lz4Codec
    }
}

impl Codec for Lz4Codec {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lz4
    }

    fn decoder<'a>(&self, source: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>> {
        Ok(Box::new(DecodeErrors(lz4_flex::frame::FrameDecoder::new(source))))
    }

    fn encoder<'a>(&self, sink: Box<dyn Write + Send + 'a>) -> Result<Box<dyn CodecWriter + 'a>> {
        Ok(Box::new(lz4_flex::frame::FrameEncoder::new(sink)))
    }
}

impl<W: Write + Send> CodecWriter for lz4_flex::frame::FrameEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut sink = lz4_flex::frame::FrameEncoder::finish(*self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        sink.flush()
    }
}
