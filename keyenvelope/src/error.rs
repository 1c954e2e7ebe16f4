//! Error types for `keyenvelope` operations.

use std::fmt;

/// Main error type for envelope and per-user key operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration (credentials, passphrase, master secret)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation invoked before `initialize()` completed
    #[error("not initialized: call initialize() first")]
    NotInitialized,

    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(#[source] KmsError),

    /// Decryption failed (wrapped key, nonce or authentication tag).
    ///
    /// Deliberately generic: callers must not learn which layer rejected
    /// the payload.
    #[error("cannot decrypt")]
    DecryptionFailed,

    /// Encryption operation failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Serialized envelope or ciphertext record is malformed
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Unsupported envelope version
    #[error("unsupported version: {version} (supported: {supported})")]
    UnsupportedVersion {
        /// The version found in the serialized envelope
        version: u64,
        /// Supported versions
        supported: String,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,
}

impl Error {
    /// Returns `true` if retrying the operation later may succeed.
    ///
    /// Only provider unavailability and timeouts are retryable; integrity and
    /// format failures are final for the payload in question.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyProvider(err) if err.is_retryable())
    }

    /// Short, non-secret classification used in audit context.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::NotInitialized => "not_initialized",
            Self::KeyProvider(err) if err.is_retryable() => "provider_unavailable",
            Self::KeyProvider(_) => "provider",
            Self::DecryptionFailed => "integrity",
            Self::EncryptionFailed(_) => "encryption",
            Self::InvalidFormat(_) | Self::UnsupportedVersion { .. } => "format",
            Self::KeyDerivation => "derivation",
        }
    }
}

impl From<KmsError> for Error {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::NotInitialized => Self::NotInitialized,
            KmsError::Configuration(msg) => Self::Configuration(msg),
            other => Self::KeyProvider(other),
        }
    }
}

/// Errors raised by [`KmsProvider`](crate::kms::KmsProvider) implementations.
#[derive(Debug)]
pub enum KmsError {
    /// Provider used before `initialize()` succeeded
    NotInitialized,

    /// Missing or invalid credentials, passphrase or key location
    Configuration(String),

    /// Remote service unreachable or returned a transient failure
    Unavailable(String),

    /// Remote call exceeded its deadline
    Timeout(String),

    /// Credentials rejected or permission denied
    Unauthorized(String),

    /// KEK not found
    KekNotFound(String),

    /// DEK generation or wrapping failed
    WrapFailed(String),

    /// DEK unwrapping failed
    UnwrapFailed(String),

    /// Remote service returned an unexpected response
    Remote(String),

    /// Capability not offered by this provider
    Unsupported(&'static str),

    /// I/O operation failed
    Io(std::io::Error),
}

impl KmsError {
    /// Returns `true` for transient failures (unavailability, timeouts).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl fmt::Display for KmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "provider not initialized"),
            Self::Configuration(msg) => write!(f, "provider configuration invalid: {msg}"),
            Self::Unavailable(msg) => write!(f, "provider unavailable: {msg}"),
            Self::Timeout(msg) => write!(f, "provider call timed out: {msg}"),
            Self::Unauthorized(msg) => write!(f, "provider rejected credentials: {msg}"),
            Self::KekNotFound(id) => write!(f, "KEK not found: {id}"),
            Self::WrapFailed(msg) => write!(f, "DEK wrap failed: {msg}"),
            Self::UnwrapFailed(msg) => write!(f, "DEK unwrap failed: {msg}"),
            Self::Remote(msg) => write!(f, "unexpected provider response: {msg}"),
            Self::Unsupported(what) => write!(f, "not supported by this provider: {what}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(KmsError::Timeout("encrypt".into()).is_retryable());
        assert!(KmsError::Unavailable("connect".into()).is_retryable());
        assert!(!KmsError::Unauthorized("403".into()).is_retryable());
        assert!(!KmsError::UnwrapFailed("tag".into()).is_retryable());
    }

    #[test]
    fn test_kms_error_conversion() {
        assert!(matches!(Error::from(KmsError::NotInitialized), Error::NotInitialized));
        assert!(matches!(
            Error::from(KmsError::Configuration("no passphrase".into())),
            Error::Configuration(_)
        ));

        let err = Error::from(KmsError::Timeout("decrypt".into()));
        assert!(err.is_retryable());
        assert!(!Error::DecryptionFailed.is_retryable());
    }

    #[test]
    fn test_decryption_failure_message_is_generic() {
        assert_eq!(Error::DecryptionFailed.to_string(), "cannot decrypt");
    }
}
