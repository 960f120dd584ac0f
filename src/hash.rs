use core::fmt;

use crypto_common::typenum::Unsigned;
use crypto_common::OutputSizeUser;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

pub const HASH_SIZE: usize = <<Sha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;

/// Addressable entities (identities, destinations, links, interfaces) are
/// referred to by the first ten bytes of their SHA-256 hash.
pub const TRUNCATED_HASH_SIZE: usize = 10;

/// Full 32-byte SHA-256 digest.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Sha256Hash([u8; HASH_SIZE]);

/// Ten-byte truncated digest used for wire addressing.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct TruncatedHash([u8; TRUNCATED_HASH_SIZE]);

impl Sha256Hash {
    pub const fn new(digest: [u8; HASH_SIZE]) -> Self {
        Self(digest)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::new().chain_update(data).finalize().into())
    }

    /// Digest a sequence of fields as if they were one contiguous message.
    pub fn of_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < HASH_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut digest = [0u8; HASH_SIZE];
        digest.copy_from_slice(&data[..HASH_SIZE]);
        Ok(Self(digest))
    }

    pub fn truncated(&self) -> TruncatedHash {
        TruncatedHash::from_full(self)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl TruncatedHash {
    pub const fn new(bytes: [u8; TRUNCATED_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn new_empty() -> Self {
        Self([0u8; TRUNCATED_HASH_SIZE])
    }

    /// Truncated hash of arbitrary data.
    pub fn of(data: &[u8]) -> Self {
        Self::from_full(&Sha256Hash::of(data))
    }

    pub fn from_full(hash: &Sha256Hash) -> Self {
        let mut bytes = [0u8; TRUNCATED_HASH_SIZE];
        bytes.copy_from_slice(&hash.0[..TRUNCATED_HASH_SIZE]);
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < TRUNCATED_HASH_SIZE {
            return Err(CoreError::InvalidLength);
        }
        let mut bytes = [0u8; TRUNCATED_HASH_SIZE];
        bytes.copy_from_slice(&data[..TRUNCATED_HASH_SIZE]);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex_string: &str) -> Result<Self, CoreError> {
        let decoded = hex::decode(hex_string).map_err(|_| CoreError::InvalidLength)?;
        Self::from_slice(&decoded)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; TRUNCATED_HASH_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

impl From<Sha256Hash> for TruncatedHash {
    fn from(hash: Sha256Hash) -> Self {
        Self::from_full(&hash)
    }
}

impl Default for TruncatedHash {
    fn default() -> Self {
        Self::new_empty()
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:0>2x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for TruncatedHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for byte in self.0.iter() {
            write!(f, "{:0>2x}", byte)?;
        }
        write!(f, ">")?;
        Ok(())
    }
}
