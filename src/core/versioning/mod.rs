//! Format version header for versioned parts
//!
//! A versioned part starts with a header naming the feature and three
//! versions: the oldest reader that can read the part, the oldest updater
//! that can modify it, and the writer that last wrote it.
//!
//! ```text
//! [u32 LE: byte length of feature id]
//! [feature id, UTF-16LE, zero padded to a multiple of 4]
//! [reader major u16][reader minor u16]
//! [updater major u16][updater minor u16]
//! [writer major u16][writer minor u16]
//! ```

mod stream;

pub use stream::{VersionedStream, VersionedStreamOwner};

use crate::error::{PackageError, Result};
use crate::stream::read_fully;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;

/// Upper bound on the encoded feature id, guarding against garbage headers
pub const MAX_FEATURE_ID_BYTES: u32 = 4096;

/// `major.minor`, ordered lexicographically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionPair {
    pub major: u16,
    pub minor: u16,
}

impl VersionPair {
    pub const fn new(major: u16, minor: u16) -> Self {
        VersionPair { major, minor }
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for VersionPair {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        let parse = |part: &str| {
            part.trim()
                .parse::<u16>()
                .map_err(|_| PackageError::invalid(format!("invalid version '{}'", s)))
        };
        Ok(VersionPair::new(parse(major)?, parse(minor)?))
    }
}

/// Persisted format version of a part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub feature_id: String,
    pub reader: VersionPair,
    pub updater: VersionPair,
    pub writer: VersionPair,
}

impl FormatVersion {
    /// Same version for reader, updater and writer
    pub fn new(feature_id: impl Into<String>, version: VersionPair) -> Self {
        FormatVersion {
            feature_id: feature_id.into(),
            reader: version,
            updater: version,
            writer: version,
        }
    }

    pub fn with_versions(
        feature_id: impl Into<String>,
        reader: VersionPair,
        updater: VersionPair,
        writer: VersionPair,
    ) -> Self {
        FormatVersion {
            feature_id: feature_id.into(),
            reader,
            updater,
            writer,
        }
    }

    /// Size of the encoded header
    pub fn byte_len(&self) -> u64 {
        let id_len = self.feature_id.encode_utf16().count() as u64 * 2;
        4 + id_len.next_multiple_of(4) + 12
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len() as usize);
        let id: Vec<u8> = self
            .feature_id
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();

        out.extend_from_slice(&(id.len() as u32).to_le_bytes());
        out.extend_from_slice(&id);
        out.resize(4 + id.len().next_multiple_of(4), 0);
        for pair in [self.reader, self.updater, self.writer] {
            out.extend_from_slice(&pair.major.to_le_bytes());
            out.extend_from_slice(&pair.minor.to_le_bytes());
        }
        out
    }

    /// Parse a header from the current position of `source`
    pub fn read_from<R: Read + ?Sized>(source: &mut R) -> Result<Self> {
        let mut len_bytes = [0u8; 4];
        read_header_bytes(source, &mut len_bytes)?;
        let id_len = u32::from_le_bytes(len_bytes);
        if id_len % 2 != 0 || id_len > MAX_FEATURE_ID_BYTES {
            return Err(PackageError::corrupt(format!(
                "format version feature id length {} is invalid",
                id_len
            )));
        }

        let mut id = vec![0u8; (id_len as usize).next_multiple_of(4)];
        read_header_bytes(source, &mut id)?;
        let units: Vec<u16> = id[..id_len as usize]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let feature_id = String::from_utf16(&units)
            .map_err(|_| PackageError::corrupt("format version feature id is not UTF-16"))?;

        let mut versions = [0u8; 12];
        read_header_bytes(source, &mut versions)?;
        let pair = |i: usize| {
            VersionPair::new(
                u16::from_le_bytes([versions[i], versions[i + 1]]),
                u16::from_le_bytes([versions[i + 2], versions[i + 3]]),
            )
        };

        Ok(FormatVersion {
            feature_id,
            reader: pair(0),
            updater: pair(4),
            writer: pair(8),
        })
    }

    /// Feature ids compare case-insensitively
    pub fn same_feature(&self, other: &FormatVersion) -> bool {
        self.feature_id.to_lowercase() == other.feature_id.to_lowercase()
    }

    /// Whether code supporting `code_reader` may read this version
    pub fn is_readable_by(&self, code_reader: VersionPair) -> bool {
        self.reader <= code_reader
    }

    /// Whether code supporting `code_updater` may modify this version
    pub fn is_updatable_by(&self, code_updater: VersionPair) -> bool {
        self.updater <= code_updater
    }
}

fn read_header_bytes<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> Result<()> {
    if read_fully(source, buf)? < buf.len() {
        return Err(PackageError::corrupt("format version header is truncated"));
    }
    Ok(())
}
