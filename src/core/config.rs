//! Tuning parameters for the stream stack
//!
//! Every threshold here trades memory for fewer allocations or fewer codec
//! restarts; none of them affects the bytes a caller reads back. Values can be
//! loaded from TOML, and missing keys fall back to the defaults below.
//!
//! ```toml
//! [sparse]
//! low_water_mark = 102400
//! high_water_mark = 10485760
//!
//! [compression]
//! method = "zstd"
//! level = 3
//!
//! [encryption]
//! cache_flush_threshold = 16384
//! ```

use crate::compression::CompressionMethod;
use crate::error::{PackageError, Result};
use crate::stream::SecondaryStorageLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sparse buffer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparseConfig {
    /// Switch back to memory once overflowed content shrinks below this
    pub low_water_mark: u64,

    /// Spill to secondary storage once buffered bytes exceed this
    pub high_water_mark: u64,

    /// Let an adjacent block absorb a write separated by a small gap
    pub auto_merge_gaps: bool,

    /// Largest gap (bytes) bridged by zero-fill when `auto_merge_gaps` is set
    pub merge_gap_threshold: u64,

    /// Upper bound on a single in-memory block
    pub max_block_size: u64,

    /// Directory for overflow files (system temp dir when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spill_dir: Option<PathBuf>,
}

impl Default for SparseConfig {
    fn default() -> Self {
        SparseConfig {
            low_water_mark: 100 * 1024,
            high_water_mark: 10 * 1024 * 1024,
            auto_merge_gaps: true,
            merge_gap_threshold: 100,
            max_block_size: i32::MAX as u64,
            spill_dir: None,
        }
    }
}

impl SparseConfig {
    /// Config for a buffer that never leaves memory
    pub fn in_memory() -> Self {
        SparseConfig {
            low_water_mark: u64::MAX,
            high_water_mark: u64::MAX,
            ..Default::default()
        }
    }

    /// In-memory config that never bridges gaps, so coverage is exactly
    /// what was written (used for caches)
    pub fn in_memory_exact() -> Self {
        SparseConfig {
            auto_merge_gaps: false,
            ..Self::in_memory()
        }
    }

    /// Config with explicit water marks
    pub fn with_water_marks(low_water_mark: u64, high_water_mark: u64) -> Self {
        SparseConfig {
            low_water_mark,
            high_water_mark,
            ..Default::default()
        }
    }
}

/// Compression configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Codec used for newly created parts
    pub method: CompressionMethod,

    /// Codec level (ignored by codecs without levels)
    pub level: i32,

    /// Forward seeks shorter than this are served by read-and-discard
    /// instead of materializing the whole stream
    pub read_skip_threshold: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            method: CompressionMethod::Deflate,
            level: 6,
            read_skip_threshold: 64,
        }
    }
}

/// Encrypted stream cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Combined read+write cache size that forces a flush
    pub cache_flush_threshold: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            cache_flush_threshold: 16 * 1024,
        }
    }
}

/// Complete stream stack configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sparse: SparseConfig,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
}

impl StreamConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StreamConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PackageError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sparse.low_water_mark > self.sparse.high_water_mark {
            return Err(PackageError::Config(format!(
                "low_water_mark ({}) exceeds high_water_mark ({})",
                self.sparse.low_water_mark, self.sparse.high_water_mark
            )));
        }

        if self.sparse.max_block_size == 0 {
            return Err(PackageError::Config(
                "max_block_size must be nonzero".to_string(),
            ));
        }

        if self.sparse.max_block_size > i64::MAX as u64 {
            return Err(PackageError::Config(format!(
                "max_block_size ({}) exceeds the signed 64-bit stream limit",
                self.sparse.max_block_size
            )));
        }

        Ok(())
    }
}

/// Configuration plus the process-wide secondary-storage lock
///
/// Passed by reference to every constructor that may allocate a sparse
/// buffer, so that all buffers spilling into the same namespace serialize on
/// one lock without an ambient global.
#[derive(Debug, Clone, Default)]
pub struct StreamContext {
    pub config: StreamConfig,
    pub lock: SecondaryStorageLock,
}

impl StreamContext {
    pub fn new(config: StreamConfig) -> Self {
        StreamContext {
            config,
            lock: SecondaryStorageLock::new(),
        }
    }

    /// Share an existing lock (e.g. between several packages)
    pub fn with_lock(config: StreamConfig, lock: SecondaryStorageLock) -> Self {
        StreamContext { config, lock }
    }
}
