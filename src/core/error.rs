use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Stream has been closed")]
    Disposed,

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Offset arithmetic overflowed")]
    Overflow,

    #[error("Format version {required} is required to {action} this stream, code supports {supported}")]
    VersionIncompatible {
        action: &'static str,
        required: String,
        supported: String,
    },

    #[error("Format feature mismatch: expected '{expected}', found '{found}'")]
    FeatureMismatch { expected: String, found: String },

    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

/// Coarse classification of a [`PackageError`]
///
/// Lets callers tell a damaged container apart from one that simply needs a
/// newer tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller supplied a bad offset, length or origin
    InvalidArgument,
    /// Persisted bytes are untrustworthy
    CorruptData,
    /// Stream closed or internal invariant broken
    IllegalState,
    /// File needs a capability this code or cipher does not have
    CapabilityMismatch,
    /// Underlying storage failed
    Io,
}

impl PackageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PackageError::InvalidArgument(_) | PackageError::Config(_) => {
                ErrorClass::InvalidArgument
            }
            PackageError::CorruptData(_)
            | PackageError::FeatureMismatch { .. }
            | PackageError::Codec(_) => ErrorClass::CorruptData,
            PackageError::Disposed | PackageError::IllegalState(_) | PackageError::Overflow => {
                ErrorClass::IllegalState
            }
            PackageError::VersionIncompatible { .. } | PackageError::UnsupportedCipher(_) => {
                ErrorClass::CapabilityMismatch
            }
            PackageError::Io(_) => ErrorClass::Io,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        PackageError::CorruptData(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PackageError::InvalidArgument(msg.into())
    }
}

// An io::Error that merely carries a PackageError is unwrapped so the
// classification survives a trip through std::io trait methods.
impl From<io::Error> for PackageError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<PackageError>()) {
            match err.into_inner().map(|inner| inner.downcast::<PackageError>()) {
                Some(Ok(package_err)) => *package_err,
                Some(Err(other)) => PackageError::Io(io::Error::new(io::ErrorKind::Other, other)),
                None => PackageError::Io(io::Error::new(io::ErrorKind::Other, "unknown I/O error")),
            }
        } else {
            PackageError::Io(err)
        }
    }
}

impl From<PackageError> for io::Error {
    fn from(err: PackageError) -> Self {
        let kind = match &err {
            PackageError::Io(inner) => return io::Error::new(inner.kind(), err),
            PackageError::InvalidArgument(_) | PackageError::Config(_) => {
                io::ErrorKind::InvalidInput
            }
            PackageError::CorruptData(_)
            | PackageError::FeatureMismatch { .. }
            | PackageError::Codec(_) => io::ErrorKind::InvalidData,
            PackageError::UnsupportedCipher(_) | PackageError::VersionIncompatible { .. } => {
                io::ErrorKind::Unsupported
            }
            PackageError::Disposed | PackageError::IllegalState(_) | PackageError::Overflow => {
                io::ErrorKind::Other
            }
        };
        io::Error::new(kind, err)
    }
}

impl From<toml::de::Error> for PackageError {
    fn from(err: toml::de::Error) -> Self {
        PackageError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PackageError>;
