//! Data encryption keys and their secure handling.
//!
//! A [`DataKey`] lives only in memory and is zeroed when dropped, so every
//! exit path out of an operation (return, `?`, panic, a cancelled future)
//! erases the plaintext key.

use std::fmt;

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use zeroize::Zeroizing;

use crate::error::KmsError;

/// Standard DEK size in bytes (256 bits).
pub const DEK_SIZE: usize = 32;

/// A 256-bit symmetric key held in a zeroize-on-drop buffer.
#[derive(Clone)]
pub struct DataKey(Zeroizing<[u8; DEK_SIZE]>);

impl DataKey {
    /// Generates a fresh key from the operating system CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; DEK_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        Self(key)
    }

    /// Takes ownership of raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; DEK_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Copies a key out of a slice, which must be exactly [`DEK_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed` on a length mismatch.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, KmsError> {
        if bytes.len() != DEK_SIZE {
            return Err(KmsError::UnwrapFailed(format!(
                "unexpected key length: {} (expected {DEK_SIZE})",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; DEK_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Returns the raw key bytes.
    ///
    /// Avoid copying the result into buffers that are not zeroized.
    #[must_use]
    pub fn expose(&self) -> &[u8; DEK_SIZE] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        // Constant time over the full key.
        self.expose().iter().zip(other.expose()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

impl Eq for DataKey {}
