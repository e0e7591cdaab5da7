//! Container seam and stream stack assembly
//!
//! The archive format itself lives elsewhere; this module only needs a
//! factory of raw part streams plus their content types. [`PartStreamBuilder`]
//! layers the transforms over such a raw stream in a fixed order:
//!
//! ```text
//! caller -> versioned -> compressed -> encrypted -> raw part
//! ```

use crate::compression::{codec_for, Codec, CompressStream, CompressionMethod};
use crate::config::StreamContext;
use crate::encryption::{BlockCipher, RightsManagementEncryptedStream};
use crate::error::{PackageError, Result};
use crate::stream::{PartStream, SharedStream};
use crate::versioning::{FormatVersion, VersionedStream};
use std::collections::BTreeMap;
use std::io::{Cursor, Seek, SeekFrom};
use std::sync::Arc;
use tracing::debug;

/// Factory of raw part streams
pub trait PartContainer {
    type Part: PartStream + 'static;

    /// Create (or replace) a part
    fn create_part(&mut self, name: &str, content_type: &str) -> Result<Self::Part>;

    fn open_part(&mut self, name: &str) -> Result<Self::Part>;

    fn content_type(&self, name: &str) -> Option<&str>;

    fn part_names(&self) -> Vec<String>;

    fn delete_part(&mut self, name: &str) -> Result<()>;
}

#[derive(Debug)]
struct MemoryPart {
    data: SharedStream<Cursor<Vec<u8>>>,
    content_type: String,
}

/// Container keeping every part in memory
///
/// Handles returned for the same part share one cursor; the stream layers
/// always seek before touching their base.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    parts: BTreeMap<String, MemoryPart>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Copy of a part's raw (transformed) bytes
    pub fn raw_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.parts.get(name).map(|part| part.data.to_vec())
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PackageError::invalid("part name is empty"));
    }
    Ok(())
}

impl PartContainer for MemoryContainer {
    type Part = SharedStream<Cursor<Vec<u8>>>;

    fn create_part(&mut self, name: &str, content_type: &str) -> Result<Self::Part> {
        check_name(name)?;
        let data = SharedStream::memory(Vec::new());
        self.parts.insert(
            name.to_string(),
            MemoryPart {
                data: data.clone(),
                content_type: content_type.to_string(),
            },
        );
        debug!(part = name, content_type, "created part");
        Ok(data)
    }

    fn open_part(&mut self, name: &str) -> Result<Self::Part> {
        check_name(name)?;
        self.parts
            .get(name)
            .map(|part| part.data.clone())
            .ok_or_else(|| PackageError::invalid(format!("no part named '{}'", name)))
    }

    fn content_type(&self, name: &str) -> Option<&str> {
        self.parts.get(name).map(|part| part.content_type.as_str())
    }

    fn part_names(&self) -> Vec<String> {
        self.parts.keys().cloned().collect()
    }

    fn delete_part(&mut self, name: &str) -> Result<()> {
        self.parts
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| PackageError::invalid(format!("no part named '{}'", name)))
    }
}

/// Assembles the transform stack over a raw part stream
#[derive(Debug, Clone)]
pub struct PartStreamBuilder {
    ctx: StreamContext,
    cipher: Option<Arc<dyn BlockCipher>>,
    codec: Option<Arc<dyn Codec>>,
    version: Option<FormatVersion>,
    expected_length: Option<u64>,
}

impl PartStreamBuilder {
    pub fn new(ctx: &StreamContext) -> Self {
        PartStreamBuilder {
            ctx: ctx.clone(),
            cipher: None,
            codec: None,
            version: None,
            expected_length: None,
        }
    }

    pub fn encrypted(mut self, cipher: Arc<dyn BlockCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn compressed(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Compress with `method` at the configured level
    pub fn compressed_with(self, method: CompressionMethod) -> Self {
        let level = self.ctx.config.compression.level;
        self.compressed(codec_for(method, level))
    }

    pub fn versioned(mut self, version: FormatVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Decompressed length recorded by the container, verified on open
    pub fn expected_length(mut self, length: u64) -> Self {
        self.expected_length = Some(length);
        self
    }

    /// Stack for a new part; the raw stream is truncated first
    pub fn create<S: PartStream + 'static>(&self, mut raw: S) -> Result<Box<dyn PartStream>> {
        raw.set_length(0)?;
        raw.seek(SeekFrom::Start(0))?;
        self.assemble(Box::new(raw), true)
    }

    /// Stack for an existing part
    pub fn open<S: PartStream + 'static>(&self, mut raw: S) -> Result<Box<dyn PartStream>> {
        raw.seek(SeekFrom::Start(0))?;
        self.assemble(Box::new(raw), false)
    }

    fn assemble(&self, raw: Box<dyn PartStream>, create: bool) -> Result<Box<dyn PartStream>> {
        let mut stream = raw;

        if let Some(cipher) = &self.cipher {
            stream = Box::new(RightsManagementEncryptedStream::open(
                stream,
                Arc::clone(cipher),
                &self.ctx,
            )?);
        }

        if let Some(codec) = &self.codec {
            stream = if create {
                Box::new(CompressStream::create(stream, Arc::clone(codec), &self.ctx)?)
            } else {
                Box::new(CompressStream::open(
                    stream,
                    Arc::clone(codec),
                    self.expected_length,
                    &self.ctx,
                )?)
            };
        }

        if let Some(version) = &self.version {
            stream = Box::new(VersionedStream::new(stream, version.clone()));
        }

        debug!(
            create,
            encrypted = self.cipher.is_some(),
            compression = self.codec.as_ref().map(|c| c.method().name()),
            versioned = self.version.is_some(),
            "assembled part stream"
        );
        Ok(stream)
    }
}
