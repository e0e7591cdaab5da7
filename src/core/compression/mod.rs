//! Transparent compression for part streams
//!
//! A part's compressed payload can only be produced or consumed start to end.
//! [`CompressStream`] hides that behind a seekable stream: it streams through
//! the codec while access stays sequential and falls back to a fully
//! decompressed [`CompressEmulationStream`] once it does not.
//!
//! **Design**:
//! - Codecs are one-directional: a decoder wraps a reader, an encoder wraps a writer
//! - An empty payload is still a valid codec stream (`0x03 0x00` for deflate)
//! - Codec selection: [`CompressionMethod`] + level via [`codec_for`]

mod codecs;
mod emulation;
mod stream;

pub use codecs::{DeflateCodec, Lz4Codec, ZstdCodec, DEFLATE_EMPTY_PAYLOAD};
pub use emulation::CompressEmulationStream;
pub use stream::{CompressMode, CompressStream};

use crate::error::{PackageError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// Compression method for part payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionMethod {
    /// Raw deflate (the package-standard method)
    Deflate = 0,
    /// Zstd compression (slower, better ratio)
    Zstd = 1,
    /// LZ4 frame compression (fast, moderate ratio)
    Lz4 = 2,
}

impl CompressionMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::Deflate),
            1 => Some(CompressionMethod::Zstd),
            2 => Some(CompressionMethod::Lz4),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionMethod::Deflate => "deflate",
            CompressionMethod::Zstd => "zstd",
            CompressionMethod::Lz4 => "lz4",
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CompressionMethod {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "deflate" => Ok(CompressionMethod::Deflate),
            "zstd" => Ok(CompressionMethod::Zstd),
            "lz4" => Ok(CompressionMethod::Lz4),
            other => Err(PackageError::invalid(format!(
                "unknown compression method '{}'",
                other
            ))),
        }
    }
}

/// Encoder that must be explicitly terminated
///
/// Dropping an encoder without `finish` may leave a truncated payload.
pub trait CodecWriter: Write + Send {
    /// Write the stream trailer and flush the sink
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// One-directional compression codec
pub trait Codec: Send + Sync + fmt::Debug {
    fn method(&self) -> CompressionMethod;

    /// Wrap `source` so that reading yields decompressed bytes
    fn decoder<'a>(&self, source: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>>;

    /// Wrap `sink` so that written bytes are compressed into it
    fn encoder<'a>(&self, sink: Box<dyn Write + Send + 'a>) -> Result<Box<dyn CodecWriter + 'a>>;

    /// Bytes of a valid payload holding zero bytes
    fn empty_payload(&self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.encoder(Box::new(&mut payload))?.finish()?;
        Ok(payload)
    }

    /// Decompress all of `source` into `sink`, returning the decompressed size
    fn decompress(&self, source: &mut (dyn Read + Send), sink: &mut dyn Write) -> Result<u64> {
        let mut decoder = self.decoder(Box::new(source))?;
        io::copy(&mut decoder, sink).map_err(codec_error)
    }

    /// Compress all of `source` into `sink`, returning the uncompressed size
    fn compress(&self, source: &mut (dyn Read + Send), sink: &mut (dyn Write + Send)) -> Result<u64> {
        let mut encoder = self.encoder(Box::new(sink))?;
        let copied = io::copy(source, &mut encoder)?;
        encoder.finish()?;
        Ok(copied)
    }
}

/// Build the codec for `method`
pub fn codec_for(method: CompressionMethod, level: i32) -> Arc<dyn Codec> {
    match method {
        CompressionMethod::Deflate => Arc::new(DeflateCodec::new(level)),
        CompressionMethod::Zstd => Arc::new(ZstdCodec::new(level)),
        CompressionMethod::Lz4 => Arc::new(Lz4Codec::new()),
    }
}

/// Classify an I/O error raised while decoding
///
/// Malformed compressed input surfaces as `InvalidData`/`InvalidInput` from
/// the codec crates; those become [`PackageError::Codec`]. Errors coming
/// from the base stream keep their own classification.
pub(crate) fn codec_error(err: io::Error) -> PackageError {
    match PackageError::from(err) {
        PackageError::Io(inner)
            if matches!(
                inner.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
            ) =>
        {
            PackageError::Codec(inner.to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_method_conversion() {
        assert_eq!(CompressionMethod::from_u8(0), Some(CompressionMethod::Deflate));
        assert_eq!(CompressionMethod::from_u8(1), Some(CompressionMethod::Zstd));
        assert_eq!(CompressionMethod::from_u8(2), Some(CompressionMethod::Lz4));
        assert_eq!(CompressionMethod::from_u8(99), None);

        assert_eq!("ZSTD".parse::<CompressionMethod>().unwrap(), CompressionMethod::Zstd);
        assert!("brotli".parse::<CompressionMethod>().is_err());
        assert_eq!(CompressionMethod::Lz4.to_string(), "lz4");
    }

    #[test]
    fn test_every_codec_round_trips() {
        let data = b"Hello, World! ".repeat(100);
        for method in [
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
            CompressionMethod::Lz4,
        ] {
            let codec = codec_for(method, 6);
            let mut compressed = Vec::new();
            let written = codec
                .compress(&mut data.as_slice(), &mut compressed)
                .unwrap();
            assert_eq!(written, data.len() as u64);
            assert!(compressed.len() < data.len(), "{} did not compress", method);

            let mut restored = Vec::new();
            let read = codec
                .decompress(&mut compressed.as_slice(), &mut restored)
                .unwrap();
            assert_eq!(read, data.len() as u64);
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn test_empty_payloads_decode_to_nothing() {
        for method in [
            CompressionMethod::Deflate,
            CompressionMethod::Zstd,
            CompressionMethod::Lz4,
        ] {
            let codec = codec_for(method, 3);
            let payload = codec.empty_payload().unwrap();
            assert!(!payload.is_empty());

            let mut restored = Vec::new();
            codec
                .decompress(&mut payload.as_slice(), &mut restored)
                .unwrap();
            assert!(restored.is_empty());
        }
    }

    #[test]
    fn test_garbage_input_is_codec_error() {
        let codec = codec_for(CompressionMethod::Lz4, 0);
        let garbage = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let err = codec
            .decompress(&mut garbage.as_slice(), &mut io::sink())
            .unwrap_err();
        assert!(matches!(err, PackageError::Codec(_)));
    }
}
