use super::{codec_error, Codec, CodecWriter, CompressEmulationStream};
use crate::config::StreamContext;
use crate::error::{PackageError, Result};
use crate::stream::{checked_end, resolve_seek, PartStream, SharedStream};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, warn};

/// Observable mode of a [`CompressStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressMode {
    Start,
    ReadPassThrough,
    WritePassThrough,
    Emulation,
    Disposed,
}

enum Mode<S> {
    /// No codec engaged
    Start,
    /// Decoder positioned at `offset` of the decompressed data
    ReadPassThrough {
        decoder: Box<dyn Read + Send>,
        offset: u64,
    },
    /// Encoder has consumed `offset` bytes starting at 0 over an empty base
    WritePassThrough {
        encoder: Box<dyn CodecWriter>,
        offset: u64,
    },
    Emulation(CompressEmulationStream<S>),
    Disposed,
}

impl<S> Mode<S> {
    fn kind(&self) -> CompressMode {
        match self {
            Mode::Start => CompressMode::Start,
            Mode::ReadPassThrough { .. } => CompressMode::ReadPassThrough,
            Mode::WritePassThrough { .. } => CompressMode::WritePassThrough,
            Mode::Emulation(_) => CompressMode::Emulation,
            Mode::Disposed => CompressMode::Disposed,
        }
    }
}

/// Seekable stream over a compressed base
///
/// Pure sequential reads from offset 0 and pure sequential writes into an
/// empty base go straight through the codec. Anything else materializes the
/// decompressed content in a [`CompressEmulationStream`].
pub struct CompressStream<S: PartStream + 'static> {
    base: SharedStream<S>,
    codec: Arc<dyn Codec>,
    mode: Mode<S>,
    position: u64,
    /// Decompressed length; authoritative outside emulation once known
    cached_length: Option<u64>,
    length_verified: bool,
    dirty_for_flushing: bool,
    /// An empty payload must be materialized on close
    dirty_for_closing: bool,
    read_skip_threshold: u64,
    ctx: StreamContext,
}

impl<S: PartStream + 'static> fmt::Debug for CompressStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressStream")
            .field("codec", &self.codec)
            .field("mode", &self.mode.kind())
            .field("position", &self.position)
            .field("cached_length", &self.cached_length)
            .field("length_verified", &self.length_verified)
            .finish()
    }
}

impl<S: PartStream + 'static> CompressStream<S> {
    fn with_base(base: S, codec: Arc<dyn Codec>, ctx: &StreamContext) -> Self {
        CompressStream {
            base: SharedStream::new(base),
            codec,
            mode: Mode::Start,
            position: 0,
            cached_length: None,
            length_verified: false,
            dirty_for_flushing: false,
            dirty_for_closing: false,
            read_skip_threshold: ctx.config.compression.read_skip_threshold,
            ctx: ctx.clone(),
        }
    }

    /// New, empty part; any existing bytes in `base` are discarded
    pub fn create(mut base: S, codec: Arc<dyn Codec>, ctx: &StreamContext) -> Result<Self> {
        base.set_length(0)?;
        base.seek(SeekFrom::Start(0))?;

        let mut stream = Self::with_base(base, codec, ctx);
        stream.cached_length = Some(0);
        stream.length_verified = true;
        stream.dirty_for_closing = true;
        Ok(stream)
    }

    /// Existing part; `expected_length` is checked against the payload once
    /// the real length is observed
    pub fn open(
        base: S,
        codec: Arc<dyn Codec>,
        expected_length: Option<u64>,
        ctx: &StreamContext,
    ) -> Result<Self> {
        let mut stream = Self::with_base(base, codec, ctx);
        stream.cached_length = expected_length;
        Ok(stream)
    }

    pub fn mode(&self) -> CompressMode {
        self.mode.kind()
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Handle to the compressed base
    pub fn base(&self) -> SharedStream<S> {
        self.base.clone()
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn ensure_open(&self) -> Result<()> {
        match self.mode {
            Mode::Disposed => Err(PackageError::Disposed),
            _ => Ok(()),
        }
    }

    fn base_is_empty(&self) -> Result<bool> {
        Ok(self.base.lock().length()? == 0)
    }

    /// Record the decompressed length actually observed
    fn observe_length(&mut self, observed: u64) -> Result<()> {
        match self.cached_length {
            Some(expected) if expected != observed => Err(PackageError::corrupt(format!(
                "compressed part holds {} bytes, {} expected",
                observed, expected
            ))),
            _ => {
                self.cached_length = Some(observed);
                self.length_verified = true;
                Ok(())
            }
        }
    }

    /// Close whatever codec object is engaged, returning to `Start`
    fn leave_mode(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.mode, Mode::Start) {
            Mode::Start | Mode::ReadPassThrough { .. } => {}
            Mode::Disposed => self.mode = Mode::Disposed,
            Mode::WritePassThrough { encoder, offset } => {
                encoder.finish()?;
                self.base.lock().flush()?;
                self.cached_length = Some(offset);
                self.length_verified = true;
                self.dirty_for_flushing = false;
                self.dirty_for_closing = false;
            }
            Mode::Emulation(mut emulation) => {
                let result = emulation.flush();
                let length = emulation.len();
                emulation.close();
                result?;
                self.cached_length = Some(length);
                self.length_verified = true;
                self.dirty_for_flushing = false;
            }
        }
        Ok(())
    }

    fn enter_read_pass_through(&mut self) -> Result<()> {
        self.leave_mode()?;

        let decoder: Box<dyn Read + Send> = if self.base_is_empty()? {
            Box::new(io::empty())
        } else {
            self.base.lock().seek(SeekFrom::Start(0))?;
            self.codec.decoder(Box::new(self.base.clone()))?
        };
        self.mode = Mode::ReadPassThrough { decoder, offset: 0 };
        debug!(method = %self.codec.method(), "compressed stream entered read pass-through");
        Ok(())
    }

    fn enter_write_pass_through(&mut self) -> Result<()> {
        self.leave_mode()?;

        {
            let mut raw = self.base.lock();
            raw.set_length(0)?;
            raw.seek(SeekFrom::Start(0))?;
        }
        let encoder = self.codec.encoder(Box::new(self.base.clone()))?;
        self.mode = Mode::WritePassThrough { encoder, offset: 0 };
        debug!(method = %self.codec.method(), "compressed stream entered write pass-through");
        Ok(())
    }

    fn enter_emulation(&mut self) -> Result<()> {
        if matches!(self.mode, Mode::Emulation(_)) {
            return Ok(());
        }
        self.leave_mode()?;

        let emulation =
            CompressEmulationStream::new(self.base.clone(), Arc::clone(&self.codec), &self.ctx)?;
        self.observe_length(emulation.len())?;
        self.mode = Mode::Emulation(emulation);
        debug!(
            method = %self.codec.method(),
            length = self.cached_length,
            position = self.position,
            "compressed stream entered emulation"
        );
        Ok(())
    }

    /// Decompressed length, measured without changing mode when unknown
    pub fn len(&mut self) -> Result<u64> {
        self.ensure_open()?;
        match &self.mode {
            Mode::Emulation(emulation) => return Ok(emulation.len()),
            Mode::WritePassThrough { offset, .. } => return Ok(*offset),
            _ => {}
        }
        if let (Some(length), true) = (self.cached_length, self.length_verified) {
            return Ok(length);
        }

        let measured = self.measure_length()?;
        self.observe_length(measured)?;
        Ok(measured)
    }

    fn measure_length(&self) -> Result<u64> {
        let mut raw = self.base.lock();
        if raw.length()? == 0 {
            return Ok(0);
        }
        let saved = raw.stream_position()?;
        raw.seek(SeekFrom::Start(0))?;
        let measured = self.codec.decompress(&mut *raw, &mut io::sink());
        raw.seek(SeekFrom::Start(saved))?;
        measured
    }

    fn read_internal(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let position = self.position;
        match &self.mode {
            Mode::Start | Mode::WritePassThrough { .. } => {
                if position == 0 {
                    self.enter_read_pass_through()?;
                } else {
                    self.enter_emulation()?;
                }
            }
            Mode::ReadPassThrough { offset, .. } if *offset != position => {
                if position == 0 {
                    self.enter_read_pass_through()?;
                } else {
                    self.enter_emulation()?;
                }
            }
            _ => {}
        }

        let (read, end_reached) = match &mut self.mode {
            Mode::ReadPassThrough { decoder, offset } => {
                let n = decoder.read(buf).map_err(codec_error)?;
                *offset += n as u64;
                (n, (n == 0).then_some(*offset))
            }
            Mode::Emulation(emulation) => (emulation.read_at(position, buf)?, None),
            _ => {
                return Err(PackageError::IllegalState(
                    "no readable mode after transition".to_string(),
                ))
            }
        };

        if let Some(end) = end_reached {
            self.observe_length(end)?;
        }
        self.position += read as u64;
        Ok(read)
    }

    fn write_internal(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        let end = checked_end(self.position, data.len() as u64)?;

        let position = self.position;
        match &self.mode {
            Mode::Start => {
                if position == 0 && self.base_is_empty()? {
                    self.enter_write_pass_through()?;
                } else {
                    self.enter_emulation()?;
                }
            }
            Mode::ReadPassThrough { .. } => self.enter_emulation()?,
            Mode::WritePassThrough { offset, .. } if *offset != position => {
                self.enter_emulation()?
            }
            _ => {}
        }

        match &mut self.mode {
            Mode::WritePassThrough { encoder, offset } => {
                encoder.write_all(data)?;
                *offset = end;
            }
            Mode::Emulation(emulation) => emulation.write_at(position, data)?,
            _ => {
                return Err(PackageError::IllegalState(
                    "no writable mode after transition".to_string(),
                ))
            }
        }

        self.position = end;
        self.dirty_for_flushing = true;
        Ok(())
    }

    fn seek_internal(&mut self, pos: SeekFrom) -> Result<u64> {
        self.ensure_open()?;

        let target = match pos {
            SeekFrom::End(_) => {
                self.enter_emulation()?;
                let length = self.len()?;
                resolve_seek(self.position, length, pos)?
            }
            other => resolve_seek(self.position, self.cached_length.unwrap_or(0), other)?,
        };

        // Short forward hops are cheaper to decode and discard
        let mut exhausted_at = None;
        if let Mode::ReadPassThrough { decoder, offset } = &mut self.mode {
            if target > *offset && target - *offset < self.read_skip_threshold {
                let wanted = target - *offset;
                let skipped = io::copy(&mut decoder.by_ref().take(wanted), &mut io::sink())
                    .map_err(codec_error)?;
                *offset += skipped;
                if skipped < wanted {
                    exhausted_at = Some(*offset);
                }
            }
        }
        if let Some(end) = exhausted_at {
            self.observe_length(end)?;
            self.mode = Mode::Start;
        }

        self.position = target;
        Ok(target)
    }

    /// Truncate or extend the decompressed content
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.ensure_open()?;
        checked_end(len, 0)?;

        if len == 0 && !matches!(self.mode, Mode::Emulation(_)) {
            // Discard any engaged codec without finishing it
            self.mode = Mode::Start;
            {
                let mut raw = self.base.lock();
                raw.set_length(0)?;
                raw.seek(SeekFrom::Start(0))?;
            }
            self.cached_length = Some(0);
            self.length_verified = true;
            self.dirty_for_flushing = false;
            self.dirty_for_closing = true;
            return Ok(());
        }

        self.enter_emulation()?;
        if let Mode::Emulation(emulation) = &mut self.mode {
            emulation.set_len(len)?;
        }
        self.dirty_for_flushing = true;
        Ok(())
    }

    fn flush_internal(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.dirty_for_flushing {
            return Ok(());
        }
        match &mut self.mode {
            Mode::Emulation(emulation) => emulation.flush()?,
            Mode::WritePassThrough { encoder, .. } => encoder.flush()?,
            _ => {}
        }
        self.base.lock().flush()?;
        self.dirty_for_flushing = false;
        Ok(())
    }

    /// Whether a flush would push anything into the base
    pub fn is_dirty(&self) -> bool {
        self.dirty_for_flushing
    }

    /// Finish the payload and release every codec object
    ///
    /// A part that was created (or cleared) and never received a payload gets
    /// the codec's empty payload here.
    pub fn close(&mut self) -> Result<()> {
        if matches!(self.mode, Mode::Disposed) {
            return Ok(());
        }
        let left = self.leave_mode();
        self.mode = Mode::Disposed;
        left?;

        let mut raw = self.base.lock();
        if self.dirty_for_closing && raw.length()? == 0 {
            raw.seek(SeekFrom::Start(0))?;
            raw.write_all(&self.codec.empty_payload()?)?;
        }
        raw.close()?;
        self.dirty_for_closing = false;

        debug!(
            method = %self.codec.method(),
            length = self.cached_length,
            "compressed stream closed"
        );
        Ok(())
    }
}

impl<S: PartStream + 'static> Read for CompressStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_internal(buf)?)
    }
}

impl<S: PartStream + 'static> Write for CompressStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_internal(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(self.flush_internal()?)
    }
}

impl<S: PartStream + 'static> Seek for CompressStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_internal(pos)?)
    }
}

impl<S: PartStream + 'static> PartStream for CompressStream<S> {
    fn length(&mut self) -> io::Result<u64> {
        Ok(self.len()?)
    }

    fn set_length(&mut self, len: u64) -> io::Result<()> {
        Ok(self.set_len(len)?)
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(CompressStream::close(self)?)
    }
}

impl<S: PartStream + 'static> Drop for CompressStream<S> {
    fn drop(&mut self) {
        if matches!(self.mode, Mode::Disposed) {
            return;
        }
        warn!("compressed stream dropped without close");
        if let Err(e) = CompressStream::close(self) {
            warn!(error = %e, "failed to close compressed stream on drop");
        }
    }
}
