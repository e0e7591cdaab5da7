//! # opcstream - Stream Stack for Package Parts
//!
//! `opcstream-rs` provides the streams that sit between a package container
//! (a ZIP-based OPC archive, a directory, memory) and the code reading or
//! writing a part. Every layer exposes the same random-access
//! [`PartStream`] contract:
//!
//! - **Sparse buffering** with automatic spill to a temp file past a
//!   high-water mark and reload below a low-water mark
//! - **Compression** that streams straight through a one-directional codec
//!   and falls back to an in-memory editable copy when access turns random
//! - **Block-cipher encryption** with a plaintext length prefix, block
//!   caches and random padding
//! - **Format versioning** with a feature header checked before reads and
//!   writes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opcstream_rs::{
//!     generate_key, Aes256BlockCipher, CompressionMethod, FormatVersion, MemoryContainer,
//!     PartContainer, PartStreamBuilder, Result, StreamContext, VersionPair,
//! };
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let ctx = StreamContext::default();
//! let mut container = MemoryContainer::new();
//!
//! let builder = PartStreamBuilder::new(&ctx)
//!     .encrypted(Arc::new(Aes256BlockCipher::new(&generate_key())))
//!     .compressed_with(CompressionMethod::Deflate)
//!     .versioned(FormatVersion::new("Example.Feature", VersionPair::new(1, 0)));
//!
//! let raw = container.create_part("/word/document.xml", "application/xml")?;
//! let mut part = builder.create(raw)?;
//! part.write_all(b"<w:document/>")?;
//! part.close()?;
//!
//! let mut part = builder.open(container.open_part("/word/document.xml")?)?;
//! let mut text = String::new();
//! part.read_to_string(&mut text)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! Water marks, codec level and cache thresholds come from [`StreamConfig`],
//! loadable from TOML:
//!
//! ```rust,no_run
//! use opcstream_rs::{StreamConfig, StreamContext};
//!
//! # fn main() -> opcstream_rs::Result<()> {
//! let config = StreamConfig::from_toml_str(
//!     r#"
//!     [sparse]
//!     high_water_mark = 1048576
//!
//!     [compression]
//!     method = "zstd"
//!     "#,
//! )?;
//! let ctx = StreamContext::new(config);
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    compression, config, container, encryption, error, sparse, stream, versioning,
};

pub use crate::core::{
    compression::{
        codec_for, Codec, CodecWriter, CompressMode, CompressStream, CompressionMethod,
        DEFLATE_EMPTY_PAYLOAD,
    },
    config::{CompressionConfig, EncryptionConfig, SparseConfig, StreamConfig, StreamContext},
    container::{MemoryContainer, PartContainer, PartStreamBuilder},
    encryption::{
        generate_key, key_from_hex, Aes256BlockCipher, BlockCipher, EncryptionKey,
        RightsManagementEncryptedStream, LENGTH_PREFIX_SIZE,
    },
    error::{ErrorClass, PackageError, Result},
    sparse::{BlockListOptions, MemoryBlock, SparseBlockList, SparseMemoryStream},
    stream::{PartStream, SecondaryStorageLock, SharedStream, MAX_STREAM_LENGTH},
    versioning::{FormatVersion, VersionPair, VersionedStream},
};
