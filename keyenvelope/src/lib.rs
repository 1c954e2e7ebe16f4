//! # `keyenvelope`
//!
//! Envelope encryption over pluggable key management services, with
//! per-user key derivation and an audit trail.
//!
//! ## Features
//!
//! - Provider abstraction over local, age, AWS, GCP, Azure and Vault KMS
//! - Envelope encryption with AES-256-GCM and KEK/DEK separation
//! - Per-user key derivation (HMAC-SHA256) for tenant isolation
//! - KEK rotation with rotation detection on decrypt
//! - Append-only audit log of every key operation
//!
//! ## Example
//!
//! ```rust,ignore
//! use keyenvelope::prelude::*;
//!
//! let config = LocalProviderConfig::new("./keys", passphrase);
//! let provider = LocalKmsProvider::new(config);
//! provider.initialize().await?;
//!
//! let engine = EnvelopeEncryption::new(provider, Arc::new(MemoryAuditLog::new()));
//! let envelope = engine.encrypt(b"alice@example.com").await?;
//! let decrypted = engine.decrypt(&envelope).await?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod audit;
pub mod cipher;
pub mod context;
pub mod derivation;
pub mod envelope;
pub mod error;
pub mod key;
pub mod kms;

#[cfg(test)]
mod testing;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::audit::{AuditLogEntry, AuditOperation, AuditSink, MemoryAuditLog};
    pub use crate::context::DerivationContext;
    pub use crate::derivation::{PerUserKeyDerivation, UserDek};
    pub use crate::envelope::{Decrypted, Envelope, EnvelopeEncryption};
    pub use crate::error::{Error, KmsError};
    pub use crate::key::DataKey;
    pub use crate::kms::{
        GeneratedDek, KekMetadata, KmsProvider, PerUserDekProvider, PerUserDekSemantics,
        ProviderKind,
    };
}
