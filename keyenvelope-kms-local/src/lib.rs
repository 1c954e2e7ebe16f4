//! Passphrase-protected local key provider for `keyenvelope`.
//!
//! The KEK is never stored: each version's master key is re-derived from the
//! passphrase with Argon2id and a per-version salt kept in `kek.json`. DEKs
//! are wrapped with ChaCha20-Poly1305 under the derived master key.
//!
//! Suitable for development, single-host deployments and tests.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod kdf;
pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{rand_core::RngCore, Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::Utc;
use hmac::{Hmac, Mac};
use keyenvelope::error::KmsError;
use keyenvelope::key::DataKey;
use keyenvelope::kms::{
    GeneratedDek, KekMetadata, KmsProvider, PerUserDekProvider, PerUserDekSemantics,
};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use zeroize::{Zeroize, Zeroizing};

pub use kdf::KdfParams;
use kdf::{derive_master_key, MasterKey, SALT_SIZE};
use store::{KekFile, KekStore, KekVersion};

const NONCE_SIZE: usize = 12;
const CHECK_LABEL: &[u8] = b"keyenvelope-local passphrase check";
const PER_USER_LABEL: &[u8] = b"per-user-dek";

/// Configuration for [`LocalKmsProvider`].
#[derive(Debug)]
pub struct LocalProviderConfig {
    /// Directory holding `kek.json`
    pub key_dir: PathBuf,
    /// Passphrase the master keys are derived from
    pub passphrase: SecretString,
    /// Argon2id cost for newly created key directories
    pub kdf: KdfParams,
}

impl LocalProviderConfig {
    /// Creates a configuration with default Argon2id parameters.
    pub fn new(key_dir: impl Into<PathBuf>, passphrase: SecretString) -> Self {
        Self { key_dir: key_dir.into(), passphrase, kdf: KdfParams::default() }
    }

    /// Overrides the Argon2id parameters.
    #[must_use]
    pub const fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }
}

struct State {
    file: KekFile,
    masters: HashMap<u32, Arc<MasterKey>>,
}

/// Local KEK provider backed by a passphrase and a key directory.
///
/// Writes to `kek.json` (initialization, rotation) are serialized by an
/// async mutex; reads proceed concurrently.
///
/// Offers deterministic per-user DEKs.
pub struct LocalKmsProvider {
    store: KekStore,
    passphrase: SecretString,
    kdf: KdfParams,
    state: RwLock<Option<State>>,
    write_lock: Mutex<()>,
}

impl LocalKmsProvider {
    /// Creates an uninitialized provider.
    #[must_use]
    pub fn new(config: LocalProviderConfig) -> Self {
        Self {
            store: KekStore::new(&config.key_dir),
            passphrase: config.passphrase,
            kdf: config.kdf,
            state: RwLock::new(None),
            write_lock: Mutex::new(()),
        }
    }

    fn derive(&self, entry: &KekVersion, params: KdfParams) -> Result<MasterKey, KmsError> {
        let salt = STANDARD
            .decode(&entry.salt)
            .map_err(|e| {
                KmsError::Configuration(format!("invalid salt for v{}: {e}", entry.version))
            })?;
        derive_master_key(self.passphrase.expose_secret().as_bytes(), &salt, params)
    }

    fn new_version(
        &self,
        id: &str,
        version: u32,
        params: KdfParams,
    ) -> Result<(KekVersion, MasterKey), KmsError> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);

        let master = derive_master_key(self.passphrase.expose_secret().as_bytes(), &salt, params)?;
        let check = seal(&master.wrap, CHECK_LABEL, check_aad(id, version).as_bytes())?;

        let entry = KekVersion {
            version,
            salt: STANDARD.encode(salt),
            check: STANDARD.encode(check),
            created_at: Utc::now(),
        };
        Ok((entry, master))
    }

    /// Returns the active KEK id, version and master key.
    async fn current(&self) -> Result<(String, u32, Arc<MasterKey>), KmsError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(KmsError::NotInitialized)?;
        let version = state.file.current_version;
        let master = state.masters.get(&version).cloned().ok_or(KmsError::NotInitialized)?;
        Ok((state.file.id.clone(), version, master))
    }

    /// Returns the master key for `version`, deriving and caching it on first use.
    async fn master_for(&self, version: u32) -> Result<(String, Arc<MasterKey>), KmsError> {
        let (id, entry, params) = {
            let guard = self.state.read().await;
            let state = guard.as_ref().ok_or(KmsError::NotInitialized)?;
            if let Some(master) = state.masters.get(&version) {
                return Ok((state.file.id.clone(), Arc::clone(master)));
            }
            let entry = state
                .file
                .version(version)
                .cloned()
                .ok_or_else(|| KmsError::UnwrapFailed(format!("unknown KEK version v{version}")))?;
            (state.file.id.clone(), entry, state.file.kdf)
        };

        tracing::debug!(version, "deriving master key for older KEK version");
        let master = Arc::new(self.derive(&entry, params)?);

        let mut guard = self.state.write().await;
        if let Some(state) = guard.as_mut() {
            state.masters.entry(version).or_insert_with(|| Arc::clone(&master));
        }
        Ok((id, master))
    }

    async fn wrap(&self, dek: DataKey, user_id: Option<&str>) -> Result<GeneratedDek, KmsError> {
        let (id, version, master) = self.current().await?;
        let wrapped = seal(&master.wrap, dek.expose(), dek_aad(&id, version, user_id).as_bytes())?;

        Ok(GeneratedDek {
            plaintext: dek,
            encrypted: format!("v{version}:{}", STANDARD.encode(wrapped)),
            kek_version: format!("v{version}"),
        })
    }

    async fn unwrap(&self, encrypted: &str, user_id: Option<&str>) -> Result<DataKey, KmsError> {
        let (version, wrapped) = parse_wrapped(encrypted)?;
        let (id, master) = self.master_for(version).await?;
        let dek = open(&master.wrap, &wrapped, dek_aad(&id, version, user_id).as_bytes())?;
        DataKey::try_from_slice(&dek)
    }

    async fn try_rotate(&self) -> Result<u32, KmsError> {
        let _write = self.write_lock.lock().await;

        let mut file = {
            let guard = self.state.read().await;
            guard.as_ref().ok_or(KmsError::NotInitialized)?.file.clone()
        };
        let next = file
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| KmsError::WrapFailed("KEK version overflow".to_string()))?;

        let (entry, master) = self.new_version(&file.id, next, file.kdf)?;
        file.versions.push(entry);
        file.current_version = next;

        self.store.save(&file).await?;

        let mut guard = self.state.write().await;
        let state = guard.as_mut().ok_or(KmsError::NotInitialized)?;
        state.file = file;
        state.masters.insert(next, Arc::new(master));
        Ok(next)
    }
}

#[async_trait]
impl KmsProvider for LocalKmsProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        let _write = self.write_lock.lock().await;
        if self.state.read().await.is_some() {
            return Ok(());
        }
        if self.passphrase.expose_secret().is_empty() {
            return Err(KmsError::Configuration("passphrase cannot be empty".to_string()));
        }

        let (file, master) = if let Some(file) = self.store.load().await? {
            let entry = file
                .version(file.current_version)
                .ok_or_else(|| KmsError::Configuration("current KEK version missing".to_string()))?;
            let master = self.derive(entry, file.kdf)?;

            let check = STANDARD
                .decode(&entry.check)
                .map_err(|e| KmsError::Configuration(format!("invalid check token: {e}")))?;
            let aad = check_aad(&file.id, entry.version);
            match open(&master.wrap, &check, aad.as_bytes()) {
                Ok(label) if label.as_slice() == CHECK_LABEL => {}
                _ => return Err(KmsError::Configuration("wrong passphrase".to_string())),
            }

            tracing::info!(
                path = %self.store.path().display(),
                version = file.current_version,
                "loaded local KEK"
            );
            (file, master)
        } else {
            let mut id_bytes = [0u8; 8];
            OsRng.fill_bytes(&mut id_bytes);
            let id = format!("local-{}", hex::encode(id_bytes));

            let (entry, master) = self.new_version(&id, 1, self.kdf)?;
            let file = KekFile { id, current_version: 1, kdf: self.kdf, versions: vec![entry] };
            self.store.save(&file).await?;

            tracing::info!(path = %self.store.path().display(), "created local KEK");
            (file, master)
        };

        let version = file.current_version;
        let mut masters = HashMap::new();
        masters.insert(version, Arc::new(master));
        *self.state.write().await = Some(State { file, masters });
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.state.read().await.is_some()
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.wrap(DataKey::generate(), None).await
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, None).await
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or(KmsError::NotInitialized)?;
        Ok(KekMetadata {
            id: state.file.id.clone(),
            version: format!("v{}", state.file.current_version),
        })
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(version) => {
                tracing::info!(version, "rotated local KEK");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "local KEK rotation failed");
                false
            }
        }
    }

    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        Some(self)
    }
}

#[async_trait]
impl PerUserDekProvider for LocalKmsProvider {
    fn semantics(&self) -> PerUserDekSemantics {
        PerUserDekSemantics::Deterministic
    }

    /// The DEK is `HMAC-SHA256(per-user key, "per-user-dek" ‖ user_id)` under
    /// the current KEK version, so it changes when the KEK rotates.
    async fn generate_per_user_dek(&self, user_id: &str) -> Result<GeneratedDek, KmsError> {
        if user_id.is_empty() {
            return Err(KmsError::WrapFailed("user id must not be empty".to_string()));
        }
        let (_, _, master) = self.current().await?;

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(master.per_user.expose())
            .map_err(|e| KmsError::WrapFailed(e.to_string()))?;
        mac.update(PER_USER_LABEL);
        mac.update(user_id.as_bytes());
        let mut output = mac.finalize().into_bytes();
        let dek = DataKey::try_from_slice(&output);
        output.as_mut_slice().zeroize();

        self.wrap(dek?, Some(user_id)).await
    }

    async fn decrypt_per_user_dek(
        &self,
        user_id: &str,
        encrypted: &str,
    ) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, Some(user_id)).await
    }
}

fn dek_aad(id: &str, version: u32, user_id: Option<&str>) -> String {
    match user_id {
        Some(user) => format!("{id}|v{version}|user:{user}"),
        None => format!("{id}|v{version}"),
    }
}

fn check_aad(id: &str, version: u32) -> String {
    format!("{id}|v{version}|check")
}

fn parse_wrapped(encrypted: &str) -> Result<(u32, Vec<u8>), KmsError> {
    let (version, body) = encrypted
        .strip_prefix('v')
        .and_then(|rest| rest.split_once(':'))
        .ok_or_else(|| KmsError::UnwrapFailed("expected v{n}:{base64}".to_string()))?;
    let version = version
        .parse()
        .map_err(|_| KmsError::UnwrapFailed(format!("invalid KEK version: {version}")))?;
    let wrapped = STANDARD
        .decode(body)
        .map_err(|e| KmsError::UnwrapFailed(format!("invalid base64: {e}")))?;
    Ok((version, wrapped))
}

/// ChaCha20-Poly1305 with a random nonce; output is `nonce ‖ ciphertext ‖ tag`.
fn seal(key: &DataKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, KmsError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.expose()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| KmsError::WrapFailed("AEAD encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &DataKey, packed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, KmsError> {
    if packed.len() < NONCE_SIZE {
        return Err(KmsError::UnwrapFailed("wrapped key too short".to_string()));
    }
    let (nonce, ciphertext) = packed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.expose()));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| KmsError::UnwrapFailed("authentication failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn provider(dir: &TempDir, passphrase: &str) -> LocalKmsProvider {
        LocalKmsProvider::new(
            LocalProviderConfig::new(dir.path(), SecretString::new(passphrase.to_string()))
                .with_kdf(KdfParams::insecure_fast()),
        )
    }

    #[tokio::test]
    async fn test_initialize_creates_kek_file() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");

        assert!(!provider.health_check().await);
        provider.initialize().await.unwrap();
        assert!(provider.health_check().await);
        assert!(dir.path().join(store::KEK_FILE).exists());

        let meta = provider.kek_metadata().await.unwrap();
        assert!(meta.id.starts_with("local-"));
        assert_eq!(meta.version, "v1");
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");

        assert!(matches!(provider.generate_dek().await, Err(KmsError::NotInitialized)));
        assert!(matches!(provider.kek_metadata().await, Err(KmsError::NotInitialized)));
        assert!(!provider.rotate_key().await);
    }

    #[tokio::test]
    async fn test_empty_passphrase_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "");

        assert!(matches!(provider.initialize().await, Err(KmsError::Configuration(_))));
        assert!(!dir.path().join(store::KEK_FILE).exists());
    }

    #[tokio::test]
    async fn test_dek_round_trip() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");
        provider.initialize().await.unwrap();

        let dek = provider.generate_dek().await.unwrap();
        assert!(dek.encrypted.starts_with("v1:"));
        assert_eq!(dek.kek_version, "v1");

        let unwrapped = provider.decrypt_dek(&dek.encrypted).await.unwrap();
        assert_eq!(unwrapped, dek.plaintext);
    }

    #[tokio::test]
    async fn test_restart_with_same_passphrase() {
        let dir = TempDir::new().unwrap();
        let first = provider(&dir, "correct horse");
        first.initialize().await.unwrap();
        let dek = first.generate_dek().await.unwrap();
        let id = first.kek_metadata().await.unwrap().id;
        drop(first);

        let second = provider(&dir, "correct horse");
        second.initialize().await.unwrap();
        assert_eq!(second.kek_metadata().await.unwrap().id, id);
        assert_eq!(second.decrypt_dek(&dek.encrypted).await.unwrap(), dek.plaintext);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_rejected() {
        let dir = TempDir::new().unwrap();
        provider(&dir, "correct horse").initialize().await.unwrap();

        let result = provider(&dir, "battery staple").initialize().await;
        assert!(matches!(result, Err(KmsError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_rotation_keeps_old_deks_readable() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");
        provider.initialize().await.unwrap();

        let old = provider.generate_dek().await.unwrap();
        assert!(provider.rotate_key().await);
        assert_eq!(provider.kek_metadata().await.unwrap().version, "v2");

        let new = provider.generate_dek().await.unwrap();
        assert!(new.encrypted.starts_with("v2:"));
        assert_eq!(provider.decrypt_dek(&old.encrypted).await.unwrap(), old.plaintext);
        assert_eq!(provider.decrypt_dek(&new.encrypted).await.unwrap(), new.plaintext);
    }

    #[tokio::test]
    async fn test_rotation_persists_and_old_versions_derive_lazily() {
        let dir = TempDir::new().unwrap();
        let first = provider(&dir, "correct horse");
        first.initialize().await.unwrap();
        let old = first.generate_dek().await.unwrap();
        assert!(first.rotate_key().await);
        drop(first);

        let second = provider(&dir, "correct horse");
        second.initialize().await.unwrap();
        assert_eq!(second.kek_metadata().await.unwrap().version, "v2");
        assert_eq!(second.decrypt_dek(&old.encrypted).await.unwrap(), old.plaintext);
    }

    #[tokio::test]
    async fn test_unwrap_rejects_foreign_or_altered_deks() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");
        provider.initialize().await.unwrap();

        let dek = provider.generate_dek().await.unwrap();
        let (_, body) = dek.encrypted.split_once(':').unwrap();
        let mut raw = STANDARD.decode(body).unwrap();
        raw[NONCE_SIZE] ^= 0x01;
        let altered = format!("v1:{}", STANDARD.encode(raw));

        for bad in [altered.as_str(), "v9:AAAA", "garbage", "v1:***"] {
            assert!(
                matches!(provider.decrypt_dek(bad).await, Err(KmsError::UnwrapFailed(_))),
                "expected unwrap failure for {bad}"
            );
        }
    }

    #[tokio::test]
    async fn test_per_user_deks_are_deterministic_and_bound() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");
        provider.initialize().await.unwrap();
        let per_user = provider.per_user_deks().expect("capability offered");

        assert_eq!(per_user.semantics(), PerUserDekSemantics::Deterministic);

        let a1 = per_user.generate_per_user_dek("user_a").await.unwrap();
        let a2 = per_user.generate_per_user_dek("user_a").await.unwrap();
        let b = per_user.generate_per_user_dek("user_b").await.unwrap();
        assert_eq!(a1.plaintext, a2.plaintext);
        assert_ne!(a1.plaintext, b.plaintext);

        let unwrapped = per_user.decrypt_per_user_dek("user_a", &a1.encrypted).await.unwrap();
        assert_eq!(unwrapped, a1.plaintext);
        assert!(per_user.decrypt_per_user_dek("user_b", &a1.encrypted).await.is_err());
        assert!(provider.decrypt_dek(&a1.encrypted).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_generate_and_rotate() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(provider(&dir, "correct horse"));
        provider.initialize().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    assert!(provider.rotate_key().await);
                }
                let dek = provider.generate_dek().await.unwrap();
                let unwrapped = provider.decrypt_dek(&dek.encrypted).await.unwrap();
                assert_eq!(unwrapped, dek.plaintext);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.kek_metadata().await.unwrap().version, "v3");
    }
}
