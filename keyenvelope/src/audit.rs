//! Append-only audit trail for key operations.
//!
//! Entries record what happened, when, and whether it succeeded. They never
//! carry key material or plaintext. Appending is synchronous and a failed
//! append never aborts the operation being audited; see [`record`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// Envelope encryption
    Encrypt,
    /// Envelope decryption
    Decrypt,
    /// Master secret unwrap for per-user derivation
    InitializeDerivation,
    /// Per-user key derivation
    DeriveKey,
    /// Per-user DEK issuance
    GenerateUserDek,
    /// Per-user DEK unwrap
    DecryptUserDek,
    /// Per-user DEK revocation and reissue
    RotateUserDek,
    /// Per-user payload encryption
    EncryptForUser,
    /// Per-user payload decryption
    DecryptForUser,
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::InitializeDerivation => "initialize_derivation",
            Self::DeriveKey => "derive_key",
            Self::GenerateUserDek => "generate_user_dek",
            Self::DecryptUserDek => "decrypt_user_dek",
            Self::RotateUserDek => "rotate_user_dek",
            Self::EncryptForUser => "encrypt_for_user",
            Self::DecryptForUser => "decrypt_for_user",
        };
        f.write_str(name)
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// What was attempted
    pub operation: AuditOperation,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// Whether it succeeded
    pub success: bool,
    /// Non-secret details (provider, KEK version, user id, error class)
    pub context: BTreeMap<String, String>,
}

impl AuditLogEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(operation: AuditOperation, success: bool) -> Self {
        Self { operation, timestamp: Utc::now(), success, context: BTreeMap::new() }
    }

    /// Adds a context field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised by an [`AuditSink`].
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The sink refused the entry (e.g. capacity reached)
    #[error("audit sink rejected entry: {0}")]
    Rejected(String),

    /// The sink's internal state is unusable
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for audit entries.
///
/// Injected into the engines explicitly so each instance (and each test)
/// can own an isolated log.
pub trait AuditSink: Send + Sync {
    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be stored. Callers treat this
    /// as a warning, never as a failure of the audited operation.
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError>;

    /// Returns a snapshot of all entries in append order.
    fn entries(&self) -> Vec<AuditLogEntry>;
}

/// In-memory audit log.
///
/// Each accepted entry is also emitted as a structured `tracing` event
/// under the `keyenvelope::audit` target.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditLogEntry>>,
    capacity: Option<usize>,
}

impl MemoryAuditLog {
    /// Creates an unbounded log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log that rejects entries once `capacity` is reached.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Mutex::new(Vec::new()), capacity: Some(capacity) }
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Returns `true` if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditError> {
        let mut entries =
            self.entries.lock().map_err(|e| AuditError::Unavailable(e.to_string()))?;

        if let Some(capacity) = self.capacity {
            if entries.len() >= capacity {
                return Err(AuditError::Rejected(format!("capacity of {capacity} entries reached")));
            }
        }

        tracing::info!(
            target: "keyenvelope::audit",
            operation = %entry.operation,
            success = entry.success,
            context = ?entry.context,
            "audit"
        );
        entries.push(entry);
        drop(entries);
        Ok(())
    }

    fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.lock().map(|entries| entries.clone()).unwrap_or_default()
    }
}

/// Appends `entry` to `sink`, degrading any failure to a warning.
pub fn record(sink: &dyn AuditSink, entry: AuditLogEntry) {
    let operation = entry.operation;
    if let Err(err) = sink.append(entry) {
        tracing::warn!(%operation, error = %err, "audit append failed; continuing");
    }
}
