//! Master key derivation: Argon2id over the passphrase, then HKDF-SHA256 to
//! split the result into independent subkeys.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use keyenvelope::error::KmsError;
use keyenvelope::key::{DataKey, DEK_SIZE};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Salt length for new KEK versions.
pub const SALT_SIZE: usize = 16;

const WRAP_INFO: &[u8] = b"keyenvelope-local/wrap/v1";
const PER_USER_INFO: &[u8] = b"keyenvelope-local/per-user/v1";

/// Argon2id cost parameters, persisted in `kek.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 iterations, 1 lane.
    fn default() -> Self {
        Self { memory_kib: 64 * 1024, iterations: 3, parallelism: 1 }
    }
}

impl KdfParams {
    /// Minimal parameters for tests. Never use these for real key material.
    #[must_use]
    pub const fn insecure_fast() -> Self {
        Self { memory_kib: 64, iterations: 1, parallelism: 1 }
    }
}

/// Subkeys derived from one KEK version.
pub struct MasterKey {
    /// Wraps DEKs and the passphrase check token
    pub wrap: DataKey,
    /// Keys the deterministic per-user DEK derivation
    pub per_user: DataKey,
}

/// Derives the master key for one KEK version.
///
/// # Errors
///
/// Returns `KmsError::Configuration` for an empty passphrase or invalid
/// parameters.
pub fn derive_master_key(
    passphrase: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<MasterKey, KmsError> {
    if passphrase.is_empty() {
        return Err(KmsError::Configuration("passphrase cannot be empty".to_string()));
    }

    let argon_params =
        Params::new(params.memory_kib, params.iterations, params.parallelism, Some(DEK_SIZE))
            .map_err(|e| KmsError::Configuration(format!("invalid Argon2 parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut ikm = Zeroizing::new([0u8; DEK_SIZE]);
    argon2
        .hash_password_into(passphrase, salt, &mut ikm[..])
        .map_err(|e| KmsError::Configuration(format!("key derivation failed: {e}")))?;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &ikm[..]);
    Ok(MasterKey { wrap: expand(&hkdf, WRAP_INFO)?, per_user: expand(&hkdf, PER_USER_INFO)? })
}

fn expand(hkdf: &Hkdf<Sha256>, info: &[u8]) -> Result<DataKey, KmsError> {
    let mut okm = Zeroizing::new([0u8; DEK_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|_| KmsError::Configuration("HKDF output length invalid".to_string()))?;
    Ok(DataKey::from_bytes(*okm))
}
