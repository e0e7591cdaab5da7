//! Block-cipher encryption for part streams
//!
//! Parts are stored as `[u64 LE plaintext length][ciphertext blocks]`. The
//! cipher itself is injected through [`BlockCipher`]; [`Aes256BlockCipher`]
//! is the bundled implementation.
//!
//! **Design**:
//! - Blocks are transformed independently and deterministically
//! - Ciphers that allow it may transform several contiguous blocks in one call
//! - Master key must be 32 bytes (256 bits)
//! - Padding and grown regions are random, never zero

mod stream;

pub use stream::{RightsManagementEncryptedStream, LENGTH_PREFIX_SIZE};

use crate::error::{PackageError, Result};
use aes_gcm::aead::OsRng;
use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::Aes256;
use rand::RngCore;
use std::fmt;

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// Generate a random encryption key
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Parse a key from 64 hex digits (surrounding whitespace ignored)
pub fn key_from_hex(text: &str) -> Result<EncryptionKey> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| PackageError::invalid(format!("key is not valid hex: {}", e)))?;
    <EncryptionKey>::try_from(bytes.as_slice()).map_err(|_| {
        PackageError::invalid(format!("key must be 32 bytes, got {}", bytes.len()))
    })
}

/// Deterministic, fixed-size block transform
///
/// Inputs are always a whole number of blocks: exactly one block, or several
/// contiguous blocks when [`can_merge_blocks`](BlockCipher::can_merge_blocks)
/// is true.
pub trait BlockCipher: Send + Sync + fmt::Debug {
    fn block_size(&self) -> usize;

    /// Whether several contiguous blocks may be passed in one call
    fn can_merge_blocks(&self) -> bool;

    fn can_encrypt(&self) -> bool;

    fn can_decrypt(&self) -> bool;

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256 applied independently to every 16-byte block
pub struct Aes256BlockCipher {
    cipher: Aes256,
    merge_blocks: bool,
    can_encrypt: bool,
}

impl Aes256BlockCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        Aes256BlockCipher {
            cipher: Aes256::new(GenericArray::from_slice(key)),
            merge_blocks: true,
            can_encrypt: true,
        }
    }

    /// Restrict the stream to one block per call
    pub fn with_block_merging(mut self, enabled: bool) -> Self {
        self.merge_blocks = enabled;
        self
    }

    /// Cipher usable for reading only (e.g. a view-only license)
    pub fn decrypt_only(mut self) -> Self {
        self.can_encrypt = false;
        self
    }

    fn check_shape(&self, data: &[u8]) -> Result<()> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(PackageError::invalid(format!(
                "cipher input of {} bytes is not block aligned",
                data.len()
            )));
        }
        if !self.merge_blocks && data.len() != AES_BLOCK_SIZE {
            return Err(PackageError::invalid(format!(
                "cipher input of {} bytes spans several blocks",
                data.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Aes256BlockCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256BlockCipher")
            .field("merge_blocks", &self.merge_blocks)
            .field("can_encrypt", &self.can_encrypt)
            .finish_non_exhaustive()
    }
}

impl BlockCipher for Aes256BlockCipher {
    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn can_merge_blocks(&self) -> bool {
        self.merge_blocks
    }

    fn can_encrypt(&self) -> bool {
        self.can_encrypt
    }

    fn can_decrypt(&self) -> bool {
        true
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.can_encrypt {
            return Err(PackageError::UnsupportedCipher(
                "cipher was opened for decryption only".to_string(),
            ));
        }
        self.check_shape(data)?;

        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.check_shape(data)?;

        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(AES_BLOCK_SIZE) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(chunk));
        }
        Ok(out)
    }
}
