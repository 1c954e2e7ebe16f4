//! Per-user key derivation for cryptographic tenant isolation.
//!
//! A master secret, unwrapped once from the provider at `initialize()`,
//! keys an HMAC-SHA256 over `user_id ‖ context ‖ pepper`:
//!
//! ```text
//! PerUserKey = HMAC-SHA256(master, tag ‖ len(user) ‖ user ‖ n
//!              ‖ (len(k) ‖ k ‖ len(v) ‖ v)* ‖ len(pepper) ‖ pepper)
//! ```
//!
//! Every field is length-prefixed so distinct `(user_id, context)` pairs
//! never share a MAC input. Derived keys are recomputed per call and never
//! stored; all key material sits in zeroize-on-drop buffers.

use std::sync::{Arc, PoisonError, RwLock};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::audit::{self, AuditLogEntry, AuditOperation, AuditSink};
use crate::cipher;
use crate::context::DerivationContext;
use crate::error::{Error, KmsError};
use crate::key::DataKey;
use crate::kms::KmsProvider;

type HmacSha256 = Hmac<Sha256>;

/// Domain tag for keys returned by `derive_key`.
const DERIVATION_TAG: &[u8] = b"keyenvelope/per-user-key/v1";

/// Domain tag for the internal key that wraps per-user DEKs. Never reachable
/// through `derive_key`.
const DEK_WRAPPING_TAG: &[u8] = b"keyenvelope/per-user-dek-wrapping/v1";

/// Number of `:`-separated fields in a per-user ciphertext record.
const RECORD_FIELDS: usize = 4;

/// A per-user DEK: the plaintext key and its wrapped form.
///
/// The plaintext is zeroed when this value is dropped.
#[derive(Debug)]
pub struct UserDek {
    /// The plaintext DEK
    pub plaintext: DataKey,
    /// The DEK wrapped under the user's derived key (base64)
    pub encrypted: String,
}

/// Derives per-principal keys from a provider-held master secret.
///
/// # Example
///
/// ```ignore
/// let wrapped = PerUserKeyDerivation::provision_master_secret(&provider).await?;
/// // persist `wrapped` with the rest of the deployment configuration
///
/// let derivation = PerUserKeyDerivation::new(provider, wrapped, pepper, audit);
/// derivation.initialize().await?;
///
/// let record = derivation.encrypt_for_user("user_1", b"secret")?;
/// assert_eq!(derivation.decrypt_for_user("user_1", &record)?, b"secret");
/// ```
pub struct PerUserKeyDerivation<P: KmsProvider> {
    provider: Arc<P>,
    wrapped_master_secret: String,
    pepper: SecretVec<u8>,
    master: RwLock<Option<DataKey>>,
    audit: Arc<dyn AuditSink>,
}

impl<P: KmsProvider> PerUserKeyDerivation<P> {
    /// Creates a derivation layer owning `provider`.
    ///
    /// `wrapped_master_secret` is a DEK wrapped by the same provider, usually
    /// obtained once from [`provision_master_secret`](Self::provision_master_secret).
    pub fn new(
        provider: P,
        wrapped_master_secret: impl Into<String>,
        pepper: SecretVec<u8>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::with_shared_provider(Arc::new(provider), wrapped_master_secret, pepper, audit)
    }

    /// Creates a derivation layer over a provider shared with other components.
    pub fn with_shared_provider(
        provider: Arc<P>,
        wrapped_master_secret: impl Into<String>,
        pepper: SecretVec<u8>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            provider,
            wrapped_master_secret: wrapped_master_secret.into(),
            pepper,
            master: RwLock::new(None),
            audit,
        }
    }

    /// Generates a new master secret and returns its wrapped form for storage.
    ///
    /// # Errors
    ///
    /// Returns provider errors if DEK generation fails.
    pub async fn provision_master_secret(provider: &P) -> Result<String, Error> {
        let generated = provider.generate_dek().await?;
        Ok(generated.encrypted)
    }

    /// Unwraps the master secret. Subsequent calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the master secret cannot be
    /// unwrapped by this provider, or a retryable provider error.
    pub async fn initialize(&self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }

        let result = match self.provider.decrypt_dek(&self.wrapped_master_secret).await {
            Ok(master) => {
                *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master);
                tracing::info!(provider = self.provider.name(), "per-user derivation initialized");
                Ok(())
            }
            Err(err) if err.is_retryable() => Err(Error::from(err)),
            Err(KmsError::NotInitialized) => Err(Error::NotInitialized),
            Err(err) => {
                tracing::debug!(error = %err, "master secret unwrap rejected");
                Err(Error::Configuration("master secret cannot be unwrapped".to_string()))
            }
        };

        let entry = AuditLogEntry::new(AuditOperation::InitializeDerivation, result.is_ok())
            .with("provider", self.provider.name());
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    /// Returns `true` once the master secret has been unwrapped.
    pub fn is_initialized(&self) -> bool {
        self.master.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Derives the key for `user_id` under `context`.
    ///
    /// Deterministic: the same inputs always give the same key.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` before `initialize()` and
    /// `Error::InvalidFormat` for an empty user id.
    pub fn derive_key(&self, user_id: &str, context: &DerivationContext) -> Result<DataKey, Error> {
        let result = self.compute_key(DERIVATION_TAG, user_id, context);

        let entry = AuditLogEntry::new(AuditOperation::DeriveKey, result.is_ok())
            .with("user_id", user_id)
            .with("context", context.to_string());
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    fn compute_key(
        &self,
        domain: &[u8],
        user_id: &str,
        context: &DerivationContext,
    ) -> Result<DataKey, Error> {
        if user_id.is_empty() {
            return Err(Error::InvalidFormat("user id must not be empty".to_string()));
        }

        let guard = self.master.read().unwrap_or_else(PoisonError::into_inner);
        let master = guard.as_ref().ok_or(Error::NotInitialized)?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(master.expose())
            .map_err(|_| Error::KeyDerivation)?;
        drop(guard);

        update_field(&mut mac, domain);
        update_field(&mut mac, user_id.as_bytes());
        let label_count = u32::try_from(context.iter().count()).map_err(|_| Error::KeyDerivation)?;
        mac.update(&label_count.to_be_bytes());
        for (name, value) in context.iter() {
            update_field(&mut mac, name.as_bytes());
            update_field(&mut mac, value.as_bytes());
        }
        update_field(&mut mac, self.pepper.expose_secret());

        let mut output = mac.finalize().into_bytes();
        let key = DataKey::try_from_slice(&output).map_err(|_| Error::KeyDerivation);
        output.as_mut_slice().zeroize();
        key
    }

    fn wrapping_key(&self, user_id: &str) -> Result<DataKey, Error> {
        self.compute_key(DEK_WRAPPING_TAG, user_id, &DerivationContext::new())
    }

    fn issue_user_dek(&self, user_id: &str) -> Result<UserDek, Error> {
        let wrapping_key = self.wrapping_key(user_id)?;
        let dek = DataKey::generate();
        let wrapped = cipher::seal_packed(&wrapping_key, dek.expose(), user_id.as_bytes())?;
        Ok(UserDek { plaintext: dek, encrypted: STANDARD.encode(wrapped) })
    }

    fn unwrap_user_dek(&self, user_id: &str, encrypted: &str) -> Result<DataKey, Error> {
        let wrapped = STANDARD
            .decode(encrypted)
            .map_err(|e| Error::InvalidFormat(format!("encrypted DEK: {e}")))?;
        let wrapping_key = self.wrapping_key(user_id)?;
        let mut dek = cipher::open_packed(&wrapping_key, &wrapped, user_id.as_bytes())?;
        let key = DataKey::try_from_slice(&dek).map_err(|_| Error::DecryptionFailed);
        dek.zeroize();
        key
    }

    /// Issues a fresh random DEK wrapped under the user's derived key.
    ///
    /// The caller must drop the plaintext as soon as it is no longer needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` before `initialize()`.
    pub fn generate_user_dek(&self, user_id: &str) -> Result<UserDek, Error> {
        let result = self.issue_user_dek(user_id);

        let entry = AuditLogEntry::new(AuditOperation::GenerateUserDek, result.is_ok())
            .with("user_id", user_id);
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    /// Unwraps a DEK issued by [`generate_user_dek`](Self::generate_user_dek)
    /// for the same user.
    ///
    /// # Errors
    ///
    /// Returns `Error::DecryptionFailed` if the DEK was issued for another
    /// user or was altered, `Error::InvalidFormat` if it is not base64.
    pub fn decrypt_user_dek(&self, user_id: &str, encrypted: &str) -> Result<DataKey, Error> {
        let result = self.unwrap_user_dek(user_id, encrypted);

        let entry = AuditLogEntry::new(AuditOperation::DecryptUserDek, result.is_ok())
            .with("user_id", user_id);
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    /// Revokes the user's DEK by issuing a new, unrelated one.
    ///
    /// Destructive: data encrypted under the previous DEK cannot be
    /// decrypted with the new one. Callers that need the old data must
    /// decrypt it before discarding the old wrapped DEK.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` before `initialize()`.
    pub fn rotate_user_dek(&self, user_id: &str) -> Result<UserDek, Error> {
        let result = self.issue_user_dek(user_id);

        let entry = AuditLogEntry::new(AuditOperation::RotateUserDek, result.is_ok())
            .with("user_id", user_id);
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    /// Encrypts `plaintext` for `user_id` with a fresh per-call DEK.
    ///
    /// Output: `encryptedDek:nonce:authTag:ciphertext`, each field base64.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` before `initialize()`.
    pub fn encrypt_for_user(&self, user_id: &str, plaintext: &[u8]) -> Result<String, Error> {
        let result = self.seal_for_user(user_id, plaintext);

        let entry = AuditLogEntry::new(AuditOperation::EncryptForUser, result.is_ok())
            .with("user_id", user_id);
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    fn seal_for_user(&self, user_id: &str, plaintext: &[u8]) -> Result<String, Error> {
        let user_dek = self.issue_user_dek(user_id)?;
        let sealed = cipher::seal(&user_dek.plaintext, plaintext, user_id.as_bytes())?;

        Ok(format!(
            "{}:{}:{}:{}",
            user_dek.encrypted,
            STANDARD.encode(&sealed.nonce),
            STANDARD.encode(&sealed.tag),
            STANDARD.encode(&sealed.ciphertext)
        ))
    }

    /// Decrypts a record produced by [`encrypt_for_user`](Self::encrypt_for_user).
    ///
    /// The record is fully validated before any key is derived.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidFormat` for a malformed record and
    /// `Error::DecryptionFailed` for the wrong user or tampered data.
    pub fn decrypt_for_user(&self, user_id: &str, record: &str) -> Result<Vec<u8>, Error> {
        let result = self.open_for_user(user_id, record);

        let entry = AuditLogEntry::new(AuditOperation::DecryptForUser, result.is_ok())
            .with("user_id", user_id);
        audit::record(self.audit.as_ref(), with_error(entry, &result));

        result
    }

    fn open_for_user(&self, user_id: &str, record: &str) -> Result<Vec<u8>, Error> {
        let parsed = UserRecord::parse(record)?;
        let dek = self.unwrap_user_dek(user_id, parsed.encrypted_dek)?;
        cipher::open(&dek, &parsed.nonce, &parsed.tag, &parsed.ciphertext, user_id.as_bytes())
    }

    /// Returns a snapshot of the audit trail in chronological order.
    pub fn audit_logs(&self) -> Vec<AuditLogEntry> {
        self.audit.entries()
    }
}

/// A validated `encryptedDek:nonce:authTag:ciphertext` record.
struct UserRecord<'a> {
    encrypted_dek: &'a str,
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl<'a> UserRecord<'a> {
    fn parse(record: &'a str) -> Result<Self, Error> {
        let fields: Vec<&str> = record.split(':').collect();
        if fields.len() != RECORD_FIELDS {
            return Err(Error::InvalidFormat(format!(
                "expected {RECORD_FIELDS} fields, found {}",
                fields.len()
            )));
        }
        // The ciphertext field is legitimately empty for an empty payload.
        if fields[..3].iter().any(|field| field.is_empty()) {
            return Err(Error::InvalidFormat("empty record field".to_string()));
        }

        let decode = |name: &str, value: &str| {
            STANDARD.decode(value).map_err(|e| Error::InvalidFormat(format!("{name}: {e}")))
        };

        // Validate the wrapped DEK's encoding too, before any key is touched.
        decode("encrypted DEK", fields[0])?;
        let nonce = decode("nonce", fields[1])?;
        let tag = decode("auth tag", fields[2])?;
        let ciphertext = decode("ciphertext", fields[3])?;

        if nonce.len() != cipher::NONCE_SIZE {
            return Err(Error::InvalidFormat(format!(
                "nonce must be {} bytes",
                cipher::NONCE_SIZE
            )));
        }
        if tag.len() != cipher::TAG_SIZE {
            return Err(Error::InvalidFormat(format!(
                "auth tag must be {} bytes",
                cipher::TAG_SIZE
            )));
        }

        Ok(Self { encrypted_dek: fields[0], nonce, tag, ciphertext })
    }
}

fn update_field(mac: &mut HmacSha256, bytes: &[u8]) {
    mac.update(&(bytes.len() as u64).to_be_bytes());
    mac.update(bytes);
}

fn with_error<T>(entry: AuditLogEntry, result: &Result<T, Error>) -> AuditLogEntry {
    match result {
        Ok(_) => entry,
        Err(err) => entry.with("error", err.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::testing::MockKmsProvider;
    use proptest::prelude::*;

    async fn initialized() -> PerUserKeyDerivation<MockKmsProvider> {
        let provider = MockKmsProvider::new();
        let wrapped = PerUserKeyDerivation::provision_master_secret(&provider).await.unwrap();
        let derivation = PerUserKeyDerivation::new(
            provider,
            wrapped,
            SecretVec::new(b"pepper".to_vec()),
            Arc::new(MemoryAuditLog::new()),
        );
        derivation.initialize().await.expect("initialize failed");
        derivation
    }

    #[tokio::test]
    async fn test_derive_key_deterministic() {
        let derivation = initialized().await;
        let ctx = DerivationContext::purpose("encryption");

        let key1 = derivation.derive_key("user_a", &ctx).unwrap();
        let key2 = derivation.derive_key("user_a", &ctx).unwrap();
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn test_derive_key_separates_users_and_contexts() {
        let derivation = initialized().await;
        let empty = DerivationContext::new();

        assert_ne!(
            derivation.derive_key("user_a", &empty).unwrap(),
            derivation.derive_key("user_b", &empty).unwrap()
        );
        assert_ne!(
            derivation.derive_key("u", &DerivationContext::purpose("encryption")).unwrap(),
            derivation.derive_key("u", &DerivationContext::purpose("signing")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_length_prefixing_prevents_field_shifting() {
        let derivation = initialized().await;

        let a = derivation
            .derive_key("ab", &DerivationContext::new().with("c", "d"))
            .unwrap();
        let b = derivation
            .derive_key("a", &DerivationContext::new().with("bc", "d"))
            .unwrap();
        let c = derivation
            .derive_key("u", &DerivationContext::new().with("k", "v;x=y"))
            .unwrap();
        let d = derivation
            .derive_key("u", &DerivationContext::new().with("k", "v").with("x", "y"))
            .unwrap();

        assert_ne!(a, b);
        assert_ne!(c, d);
    }

    #[tokio::test]
    async fn test_pepper_changes_keys() {
        let provider = Arc::new(MockKmsProvider::new());
        let wrapped =
            PerUserKeyDerivation::provision_master_secret(&provider).await.unwrap();
        let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditLog::new());

        let first = PerUserKeyDerivation::with_shared_provider(
            Arc::clone(&provider),
            wrapped.clone(),
            SecretVec::new(b"pepper-1".to_vec()),
            Arc::clone(&audit),
        );
        let second = PerUserKeyDerivation::with_shared_provider(
            provider,
            wrapped,
            SecretVec::new(b"pepper-2".to_vec()),
            audit,
        );
        first.initialize().await.unwrap();
        second.initialize().await.unwrap();

        let ctx = DerivationContext::new();
        assert_ne!(first.derive_key("u", &ctx).unwrap(), second.derive_key("u", &ctx).unwrap());
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let provider = MockKmsProvider::new();
        let wrapped = PerUserKeyDerivation::provision_master_secret(&provider).await.unwrap();
        let derivation = PerUserKeyDerivation::new(
            provider,
            wrapped,
            SecretVec::new(Vec::new()),
            Arc::new(MemoryAuditLog::new()),
        );

        assert!(!derivation.is_initialized());
        assert!(matches!(
            derivation.derive_key("u", &DerivationContext::new()),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(derivation.encrypt_for_user("u", b"x"), Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_invalid_master_secret_is_configuration_error() {
        let derivation = PerUserKeyDerivation::new(
            MockKmsProvider::new(),
            "v1:AAAA",
            SecretVec::new(Vec::new()),
            Arc::new(MemoryAuditLog::new()),
        );

        assert!(matches!(derivation.initialize().await, Err(Error::Configuration(_))));
        assert!(!derivation.is_initialized());
    }

    #[tokio::test]
    async fn test_empty_user_id_rejected() {
        let derivation = initialized().await;
        assert!(matches!(
            derivation.derive_key("", &DerivationContext::new()),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_user_dek_round_trip_and_isolation() {
        let derivation = initialized().await;

        let user_dek = derivation.generate_user_dek("user_1").unwrap();
        let unwrapped = derivation.decrypt_user_dek("user_1", &user_dek.encrypted).unwrap();
        assert_eq!(unwrapped, user_dek.plaintext);

        assert!(matches!(
            derivation.decrypt_user_dek("user_2", &user_dek.encrypted),
            Err(Error::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_generate_user_dek_is_random() {
        let derivation = initialized().await;
        let a = derivation.generate_user_dek("user_1").unwrap();
        let b = derivation.generate_user_dek("user_1").unwrap();

        assert_ne!(a.plaintext, b.plaintext);
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[tokio::test]
    async fn test_derived_keys_cannot_unwrap_user_deks() {
        let derivation = initialized().await;
        let user_dek = derivation.generate_user_dek("user_1").unwrap();
        let wrapped = STANDARD.decode(&user_dek.encrypted).unwrap();

        for ctx in [
            DerivationContext::new(),
            DerivationContext::purpose("user-dek-wrapping"),
            DerivationContext::purpose("encryption"),
        ] {
            let derived = derivation.derive_key("user_1", &ctx).unwrap();
            assert!(
                cipher::open_packed(&derived, &wrapped, b"user_1").is_err(),
                "derive_key output under {ctx} opened a wrapped user DEK"
            );
        }
    }

    #[tokio::test]
    async fn test_rotate_user_dek_revokes_previous_key() {
        let derivation = initialized().await;

        let old = derivation.generate_user_dek("user_1").unwrap();
        let sealed = cipher::seal(&old.plaintext, b"old data", b"").unwrap();

        let new = derivation.rotate_user_dek("user_1").unwrap();
        assert_ne!(new.plaintext, old.plaintext);

        let new_plain = derivation.decrypt_user_dek("user_1", &new.encrypted).unwrap();
        let result = cipher::open(&new_plain, &sealed.nonce, &sealed.tag, &sealed.ciphertext, b"");
        assert!(matches!(result, Err(Error::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_encrypt_for_user_round_trip() {
        let derivation = initialized().await;

        let record = derivation.encrypt_for_user("user_1", b"secret").unwrap();
        assert_eq!(record.split(':').count(), 4);
        assert_eq!(derivation.decrypt_for_user("user_1", &record).unwrap(), b"secret");

        assert!(derivation.decrypt_for_user("user_2", &record).is_err());
    }

    #[tokio::test]
    async fn test_encrypt_for_user_empty_payload() {
        let derivation = initialized().await;

        let record = derivation.encrypt_for_user("user_1", b"").unwrap();
        assert!(record.ends_with(':'));
        assert_eq!(derivation.decrypt_for_user("user_1", &record).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_malformed_records_rejected_as_format_errors() {
        let derivation = initialized().await;
        let record = derivation.encrypt_for_user("user_1", b"secret").unwrap();
        let fields: Vec<&str> = record.split(':').collect();

        let cases = vec![
            String::new(),
            "a:b:c".to_string(),
            format!("{record}:extra"),
            format!(":{}:{}:{}", fields[1], fields[2], fields[3]),
            format!("{}:!!!:{}:{}", fields[0], fields[2], fields[3]),
            format!("{}:{}:{}:{}", fields[0], STANDARD.encode([0u8; 8]), fields[2], fields[3]),
            format!("{}:{}:{}:{}", fields[0], fields[1], STANDARD.encode([0u8; 4]), fields[3]),
        ];

        for case in cases {
            let result = derivation.decrypt_for_user("user_1", &case);
            assert!(
                matches!(result, Err(Error::InvalidFormat(_))),
                "expected format error for {case:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_tampered_record_fails() {
        let derivation = initialized().await;
        let record = derivation.encrypt_for_user("user_1", b"secret payload").unwrap();
        let fields: Vec<&str> = record.split(':').collect();

        let mut ciphertext = STANDARD.decode(fields[3]).unwrap();
        ciphertext[0] ^= 0x01;
        let tampered =
            format!("{}:{}:{}:{}", fields[0], fields[1], fields[2], STANDARD.encode(ciphertext));

        assert!(matches!(
            derivation.decrypt_for_user("user_1", &tampered),
            Err(Error::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_audit_trail_records_outcomes() {
        let derivation = initialized().await;
        let record = derivation.encrypt_for_user("user_1", b"top secret").unwrap();
        let _ = derivation.decrypt_for_user("user_2", &record);

        let logs = derivation.audit_logs();
        let ops: Vec<_> = logs.iter().map(|e| (e.operation, e.success)).collect();
        assert_eq!(
            ops,
            vec![
                (AuditOperation::InitializeDerivation, true),
                (AuditOperation::EncryptForUser, true),
                (AuditOperation::DecryptForUser, false),
            ]
        );

        let dump = serde_json::to_string(&logs).unwrap();
        assert!(!dump.contains("top secret"));
        assert!(!dump.contains(&record));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn prop_distinct_users_distinct_keys(u1 in "[a-z0-9_]{1,16}", u2 in "[a-z0-9_]{1,16}") {
            prop_assume!(u1 != u2);
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let derivation = runtime.block_on(initialized());
            let ctx = DerivationContext::purpose("encryption");

            let k1 = derivation.derive_key(&u1, &ctx).unwrap();
            let k1_again = derivation.derive_key(&u1, &ctx).unwrap();
            let k2 = derivation.derive_key(&u2, &ctx).unwrap();
            prop_assert_eq!(&k1, &k1_again);
            prop_assert_ne!(&k1, &k2);
        }
    }
}
