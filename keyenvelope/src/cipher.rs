//! AES-256-GCM sealing with a detached authentication tag.
//!
//! Every call draws a fresh 96-bit nonce. Opening verifies the tag before
//! any plaintext is released; all failures collapse into
//! [`Error::DecryptionFailed`].

use aes_gcm::{
    aead::{generic_array::GenericArray, rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm,
};
use zeroize::Zeroize;

use crate::error::Error;
use crate::key::DataKey;

/// Nonce size for AES-GCM (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM (128 bits).
pub const TAG_SIZE: usize = 16;

/// Output of [`seal`]: nonce, tag and ciphertext kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Random nonce used for this message
    pub nonce: Vec<u8>,
    /// Authentication tag
    pub tag: Vec<u8>,
    /// Encrypted payload, same length as the plaintext
    pub ciphertext: Vec<u8>,
}

/// Encrypts `plaintext` under `key`, binding `aad`.
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if the cipher rejects the input.
pub fn seal(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, Error> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| Error::EncryptionFailed(format!("Invalid key: {e}")))?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut buffer)
        .map_err(|e| {
            buffer.zeroize();
            Error::EncryptionFailed(format!("AES-256-GCM encryption failed: {e}"))
        })?;

    Ok(Sealed { nonce: nonce.to_vec(), tag: tag.to_vec(), ciphertext: buffer })
}

/// Decrypts and verifies a detached-tag ciphertext.
///
/// # Errors
///
/// Returns `Error::DecryptionFailed` if the nonce or tag has the wrong
/// length or if authentication fails. No partial plaintext is returned.
pub fn open(
    key: &DataKey,
    nonce: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, Error> {
    if nonce.len() != NONCE_SIZE || tag.len() != TAG_SIZE {
        return Err(Error::DecryptionFailed);
    }

    let cipher =
        Aes256Gcm::new_from_slice(key.expose()).map_err(|_| Error::DecryptionFailed)?;

    let mut buffer = ciphertext.to_vec();
    if cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            &mut buffer,
            GenericArray::from_slice(tag),
        )
        .is_err()
    {
        buffer.zeroize();
        return Err(Error::DecryptionFailed);
    }

    Ok(buffer)
}

/// Seals into a single buffer laid out as `nonce ‖ ciphertext ‖ tag`.
///
/// # Errors
///
/// Returns `Error::EncryptionFailed` if sealing fails.
pub fn seal_packed(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let sealed = seal(key, plaintext, aad)?;
    let mut packed = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len() + TAG_SIZE);
    packed.extend_from_slice(&sealed.nonce);
    packed.extend_from_slice(&sealed.ciphertext);
    packed.extend_from_slice(&sealed.tag);
    Ok(packed)
}

/// Opens a buffer produced by [`seal_packed`].
///
/// # Errors
///
/// Returns `Error::DecryptionFailed` if the buffer is too short or fails
/// authentication.
pub fn open_packed(key: &DataKey, packed: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    if packed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::DecryptionFailed);
    }
    let (nonce, rest) = packed.split_at(NONCE_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);
    open(key, nonce, tag, ciphertext, aad)
}
