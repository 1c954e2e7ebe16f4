//! Key management service abstraction.
//!
//! A [`KmsProvider`] owns a root Key Encryption Key (KEK) and wraps/unwraps
//! Data Encryption Keys (DEKs) under it. Providers that can also issue keys
//! bound to a single principal expose that through
//! [`KmsProvider::per_user_deks`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::KmsError;
use crate::key::DataKey;

/// A freshly generated DEK together with its provider-wrapped form.
///
/// The caller uses `plaintext` once and drops it; `encrypted` is
/// text-safe and can be stored next to the data it protects.
#[derive(Debug)]
pub struct GeneratedDek {
    /// The plaintext key, zeroed on drop
    pub plaintext: DataKey,
    /// The key wrapped under the provider's KEK
    pub encrypted: String,
    /// Version of the KEK that wrapped it
    pub kek_version: String,
}

/// Identifier and version of a provider's active KEK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekMetadata {
    /// KEK identifier (key ARN, resource name, recipient, ...)
    pub id: String,
    /// Version of the KEK currently used for wrapping
    pub version: String,
}

/// Provides key management operations for envelope encryption.
///
/// Implementations must be thread-safe (`Send + Sync`) to support
/// concurrent encryption operations. Remote providers suspend only at
/// network calls; local providers must serialize writes to their key
/// material.
///
/// # Example
///
/// ```rust,ignore
/// use keyenvelope::kms::KmsProvider;
///
/// provider.initialize().await?;
/// let dek = provider.generate_dek().await?;
/// let again = provider.decrypt_dek(&dek.encrypted).await?;
/// assert_eq!(dek.plaintext, again);
/// ```
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Short label for logs and audit context.
    fn name(&self) -> &'static str;

    /// Loads or creates the KEK and verifies credentials.
    ///
    /// Failure is fatal: callers must not use the provider afterwards.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` for missing or invalid credentials.
    async fn initialize(&self) -> Result<(), KmsError>;

    /// Reports whether the provider can currently serve requests.
    ///
    /// Never fails: returns `false` before `initialize()` and whenever the
    /// backend is unreachable or rejects the credentials.
    async fn health_check(&self) -> bool;

    /// Generates a random 32-byte DEK and wraps it under the active KEK.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::NotInitialized` before `initialize()`, or a
    /// provider-specific failure.
    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError>;

    /// Unwraps a DEK previously produced by [`generate_dek`](Self::generate_dek).
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed` if the wrapped key was not produced
    /// by this provider or has been altered.
    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError>;

    /// Returns the identifier and version of the active KEK.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::NotInitialized` before `initialize()`.
    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError>;

    /// Rotates the KEK. Previously wrapped DEKs stay decryptable.
    ///
    /// Returns `false` on failure, in which case the existing KEK is left
    /// untouched.
    async fn rotate_key(&self) -> bool;

    /// Returns the per-user DEK capability if this provider offers it.
    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        None
    }
}

/// How a provider produces per-user DEKs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerUserDekSemantics {
    /// The same user always receives the same DEK (derived from the KEK).
    Deterministic,
    /// Every call yields a fresh random DEK.
    Randomized,
}

/// Optional capability: DEKs bound to a single principal.
///
/// A DEK issued for one user never unwraps under another user's id.
#[async_trait]
pub trait PerUserDekProvider: Send + Sync {
    /// Declares whether repeated calls for a user yield the same key.
    fn semantics(&self) -> PerUserDekSemantics;

    /// Issues a DEK bound to `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::NotInitialized` before `initialize()`, or a
    /// provider-specific failure.
    async fn generate_per_user_dek(&self, user_id: &str) -> Result<GeneratedDek, KmsError>;

    /// Unwraps a DEK issued for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::UnwrapFailed` if the key was issued for another
    /// user or has been altered.
    async fn decrypt_per_user_dek(
        &self,
        user_id: &str,
        encrypted: &str,
    ) -> Result<DataKey, KmsError>;
}

/// Provider backends selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Passphrase-derived master key on local disk
    Local,
    /// age X25519 identities protected by a passphrase
    Age,
    /// AWS Key Management Service
    Aws,
    /// Google Cloud KMS
    Gcp,
    /// Azure Key Vault
    Azure,
    /// HashiCorp Vault Transit engine
    Vault,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Age => "age",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Vault => "vault",
        };
        f.write_str(name)
    }
}

#[async_trait]
impl<P: KmsProvider + ?Sized> KmsProvider for Arc<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        (**self).initialize().await
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        (**self).generate_dek().await
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        (**self).decrypt_dek(encrypted).await
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        (**self).kek_metadata().await
    }

    async fn rotate_key(&self) -> bool {
        (**self).rotate_key().await
    }

    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        (**self).per_user_deks()
    }
}

#[async_trait]
impl<P: KmsProvider + ?Sized> KmsProvider for Box<P> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        (**self).initialize().await
    }

    async fn health_check(&self) -> bool {
        (**self).health_check().await
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        (**self).generate_dek().await
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        (**self).decrypt_dek(encrypted).await
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        (**self).kek_metadata().await
    }

    async fn rotate_key(&self) -> bool {
        (**self).rotate_key().await
    }

    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        (**self).per_user_deks()
    }
}
