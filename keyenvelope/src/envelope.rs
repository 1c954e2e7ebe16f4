//! Envelope encryption over a [`KmsProvider`].
//!
//! Each call to [`EnvelopeEncryption::encrypt`]:
//! 1. Requests a fresh DEK from the provider
//! 2. Encrypts the payload once with AES-256-GCM under that DEK
//! 3. Drops (and thereby zeroes) the plaintext DEK
//! 4. Returns an [`Envelope`] carrying the wrapped DEK, nonce, tag,
//!    ciphertext and the KEK version that wrapped the DEK
//!
//! Decryption needs nothing beyond the envelope and the same logical
//! provider.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::audit::{self, AuditLogEntry, AuditOperation, AuditSink};
use crate::cipher;
use crate::error::{Error, KmsError};
use crate::kms::KmsProvider;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Self-describing encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Format version
    pub version: u32,
    /// DEK wrapped by the provider (provider-specific text encoding)
    pub encrypted_dek: String,
    /// AES-GCM nonce
    pub nonce: Vec<u8>,
    /// AES-GCM authentication tag
    pub auth_tag: Vec<u8>,
    /// Encrypted payload
    pub ciphertext: Vec<u8>,
    /// KEK version that wrapped the DEK
    pub kek_version: String,
}

/// Wire form: JSON with base64 binary fields.
///
/// ```text
/// {"v":1,"edek":"...","nonce":"<b64>","tag":"<b64>","ct":"<b64>","kek":"..."}
/// ```
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    v: u64,
    edek: String,
    nonce: String,
    tag: String,
    ct: String,
    kek: String,
}

#[derive(Deserialize)]
struct VersionHeader {
    v: u64,
}

impl Envelope {
    /// Serializes to the version-tagged, text-safe wire format.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFormat` if JSON encoding fails.
    pub fn serialize(&self) -> Result<String, Error> {
        let wire = WireEnvelope {
            v: u64::from(self.version),
            edek: self.encrypted_dek.clone(),
            nonce: STANDARD.encode(&self.nonce),
            tag: STANDARD.encode(&self.auth_tag),
            ct: STANDARD.encode(&self.ciphertext),
            kek: self.kek_version.clone(),
        };
        serde_json::to_string(&wire).map_err(|e| Error::InvalidFormat(e.to_string()))
    }

    /// Parses the wire format produced by [`serialize`](Self::serialize).
    ///
    /// The version is checked before any other field is interpreted.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedVersion` for an unknown version and
    /// `Error::InvalidFormat` for malformed input.
    pub fn parse(data: &str) -> Result<Self, Error> {
        let header: VersionHeader = serde_json::from_str(data)
            .map_err(|e| Error::InvalidFormat(format!("envelope: {e}")))?;

        if header.v != u64::from(ENVELOPE_VERSION) {
            return Err(Error::UnsupportedVersion {
                version: header.v,
                supported: ENVELOPE_VERSION.to_string(),
            });
        }

        let wire: WireEnvelope = serde_json::from_str(data)
            .map_err(|e| Error::InvalidFormat(format!("envelope: {e}")))?;

        if wire.edek.is_empty() {
            return Err(Error::InvalidFormat("envelope: empty encrypted DEK".to_string()));
        }

        Ok(Self {
            version: ENVELOPE_VERSION,
            encrypted_dek: wire.edek,
            nonce: decode_field("nonce", &wire.nonce)?,
            auth_tag: decode_field("tag", &wire.tag)?,
            ciphertext: decode_field("ct", &wire.ct)?,
            kek_version: wire.kek,
        })
    }

    /// Associated data binding the header fields to the ciphertext.
    fn aad(version: u32, kek_version: &str) -> Vec<u8> {
        format!("keyenvelope|v{version}|{kek_version}").into_bytes()
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, Error> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::InvalidFormat(format!("envelope field {name}: {e}")))
}

/// Result of [`EnvelopeEncryption::decrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// The recovered plaintext
    pub data: Vec<u8>,
    /// `true` if the envelope was wrapped under an older KEK version.
    ///
    /// The engine never re-encrypts on its own; the caller decides.
    pub needs_rotation: bool,
}

/// Envelope encryption engine.
///
/// Stateless apart from the injected audit sink; safe to share across tasks
/// as long as the provider is.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use keyenvelope::audit::MemoryAuditLog;
/// use keyenvelope::envelope::EnvelopeEncryption;
///
/// let engine = EnvelopeEncryption::new(provider, Arc::new(MemoryAuditLog::new()));
/// let envelope = engine.encrypt(b"Hello, World!").await?;
/// let decrypted = engine.decrypt(&envelope).await?;
/// assert_eq!(decrypted.data, b"Hello, World!");
/// ```
pub struct EnvelopeEncryption<P: KmsProvider> {
    provider: Arc<P>,
    audit: Arc<dyn AuditSink>,
}

impl<P: KmsProvider> EnvelopeEncryption<P> {
    /// Creates an engine owning `provider`.
    pub fn new(provider: P, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_shared_provider(Arc::new(provider), audit)
    }

    /// Creates an engine over a provider shared with other components.
    pub fn with_shared_provider(provider: Arc<P>, audit: Arc<dyn AuditSink>) -> Self {
        Self { provider, audit }
    }

    /// Returns the underlying provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Encrypts `plaintext` into a new envelope.
    ///
    /// Appends exactly one audit entry, whether or not encryption succeeds.
    ///
    /// # Errors
    ///
    /// Returns provider errors (`Error::KeyProvider`, `Error::NotInitialized`)
    /// or `Error::EncryptionFailed`.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope, Error> {
        let result = self.seal(plaintext).await;

        let entry = AuditLogEntry::new(AuditOperation::Encrypt, result.is_ok())
            .with("provider", self.provider.name());
        let entry = match &result {
            Ok(envelope) => entry.with("kek_version", envelope.kek_version.clone()),
            Err(err) => entry.with("error", err.kind()),
        };
        audit::record(self.audit.as_ref(), entry);

        result
    }

    async fn seal(&self, plaintext: &[u8]) -> Result<Envelope, Error> {
        let dek = self.provider.generate_dek().await?;

        let aad = Envelope::aad(ENVELOPE_VERSION, &dek.kek_version);
        let sealed = cipher::seal(&dek.plaintext, plaintext, &aad)?;

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            encrypted_dek: dek.encrypted,
            nonce: sealed.nonce,
            auth_tag: sealed.tag,
            ciphertext: sealed.ciphertext,
            kek_version: dek.kek_version,
        })
    }

    /// Decrypts an envelope and reports whether its KEK is out of date.
    ///
    /// Appends exactly one audit entry, whether or not decryption succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the wrapped DEK, nonce or tag is
    /// rejected (without saying which), `Error::UnsupportedVersion` for an
    /// unknown envelope version, and provider errors for unavailability.
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Decrypted, Error> {
        let result = self.open(envelope).await;

        let entry = AuditLogEntry::new(AuditOperation::Decrypt, result.is_ok())
            .with("provider", self.provider.name())
            .with("kek_version", envelope.kek_version.clone());
        let entry = match &result {
            Ok(decrypted) => entry.with("needs_rotation", decrypted.needs_rotation.to_string()),
            Err(err) => entry.with("error", err.kind()),
        };
        audit::record(self.audit.as_ref(), entry);

        result
    }

    async fn open(&self, envelope: &Envelope) -> Result<Decrypted, Error> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::UnsupportedVersion {
                version: u64::from(envelope.version),
                supported: ENVELOPE_VERSION.to_string(),
            });
        }

        let dek = self.provider.decrypt_dek(&envelope.encrypted_dek).await.map_err(conceal)?;

        let aad = Envelope::aad(envelope.version, &envelope.kek_version);
        let data = cipher::open(
            &dek,
            &envelope.nonce,
            &envelope.auth_tag,
            &envelope.ciphertext,
            &aad,
        )
        .map_err(|err| {
            tracing::debug!(provider = self.provider.name(), "envelope tag verification failed");
            err
        })?;
        drop(dek);

        let needs_rotation = match self.provider.kek_metadata().await {
            Ok(current) => current.version != envelope.kek_version,
            Err(err) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    error = %err,
                    "current KEK version unavailable, rotation status unknown"
                );
                false
            }
        };

        Ok(Decrypted { data, needs_rotation })
    }

    /// Encrypts and serializes in one step.
    ///
    /// # Errors
    ///
    /// See [`encrypt`](Self::encrypt) and [`Envelope::serialize`].
    pub async fn encrypt_to_string(&self, plaintext: &[u8]) -> Result<String, Error> {
        self.encrypt(plaintext).await?.serialize()
    }

    /// Parses and decrypts in one step.
    ///
    /// A malformed record is rejected before any provider call; the attempt
    /// is still audited as a failed decryption.
    ///
    /// # Errors
    ///
    /// See [`Envelope::parse`] and [`decrypt`](Self::decrypt).
    pub async fn decrypt_from_str(&self, data: &str) -> Result<Decrypted, Error> {
        let envelope = match Envelope::parse(data) {
            Ok(envelope) => envelope,
            Err(err) => {
                let entry = AuditLogEntry::new(AuditOperation::Decrypt, false)
                    .with("provider", self.provider.name())
                    .with("error", err.kind());
                audit::record(self.audit.as_ref(), entry);
                return Err(err);
            }
        };
        self.decrypt(&envelope).await
    }

    /// Serializes an envelope. Same as [`Envelope::serialize`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFormat` if JSON encoding fails.
    pub fn serialize(envelope: &Envelope) -> Result<String, Error> {
        envelope.serialize()
    }

    /// Parses an envelope. Same as [`Envelope::parse`].
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedVersion` or `Error::InvalidFormat`.
    pub fn parse(data: &str) -> Result<Envelope, Error> {
        Envelope::parse(data)
    }

    /// Returns a snapshot of the audit trail in chronological order.
    pub fn audit_logs(&self) -> Vec<AuditLogEntry> {
        self.audit.entries()
    }
}

impl<P: KmsProvider> Clone for EnvelopeEncryption<P> {
    fn clone(&self) -> Self {
        Self { provider: Arc::clone(&self.provider), audit: Arc::clone(&self.audit) }
    }
}

/// Collapses unwrap failures into the generic decryption error.
///
/// Transient and credential failures keep their identity so callers can
/// retry or fix configuration.
fn conceal(err: KmsError) -> Error {
    match err {
        KmsError::Unavailable(_)
        | KmsError::Timeout(_)
        | KmsError::Unauthorized(_)
        | KmsError::NotInitialized
        | KmsError::Configuration(_) => Error::from(err),
        other => {
            tracing::debug!(error = %other, "DEK unwrap rejected");
            Error::DecryptionFailed
        }
    }
}
