//! age key provider for `keyenvelope`.
//!
//! KEK versions are X25519 identities. The identity file holds one
//! `AGE-SECRET-KEY-1…` line per version, oldest first, and is itself
//! encrypted with age's scrypt passphrase mode.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::io::{Read, Write};
use std::iter;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use age::secrecy::ExposeSecret as _;
use age::x25519;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyenvelope::error::KmsError;
use keyenvelope::key::DataKey;
use keyenvelope::kms::{GeneratedDek, KekMetadata, KmsProvider};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, RwLock};
use zeroize::Zeroizing;

/// Configuration for [`AgeKmsProvider`].
#[derive(Debug)]
pub struct AgeProviderConfig {
    /// Passphrase-encrypted identity file
    pub identity_file: PathBuf,
    /// Passphrase protecting the identity file
    pub passphrase: SecretString,
    /// scrypt work factor (log2 N) used when writing the identity file.
    /// `None` lets age calibrate it.
    pub work_factor: Option<u8>,
}

impl AgeProviderConfig {
    /// Creates a configuration with age's calibrated scrypt work factor.
    pub fn new(identity_file: impl Into<PathBuf>, passphrase: SecretString) -> Self {
        Self { identity_file: identity_file.into(), passphrase, work_factor: None }
    }

    /// Pins the scrypt work factor.
    #[must_use]
    pub const fn with_work_factor(mut self, log_n: u8) -> Self {
        self.work_factor = Some(log_n);
        self
    }
}

/// KEK provider backed by age X25519 identities.
pub struct AgeKmsProvider {
    config: AgeProviderConfig,
    identities: RwLock<Option<Arc<Vec<x25519::Identity>>>>,
    write_lock: Mutex<()>,
}

impl AgeKmsProvider {
    /// Creates an uninitialized provider.
    #[must_use]
    pub fn new(config: AgeProviderConfig) -> Self {
        Self { config, identities: RwLock::new(None), write_lock: Mutex::new(()) }
    }

    async fn loaded(&self) -> Result<Arc<Vec<x25519::Identity>>, KmsError> {
        self.identities.read().await.clone().ok_or(KmsError::NotInitialized)
    }

    fn passphrase(&self) -> age::secrecy::SecretString {
        age::secrecy::SecretString::from(self.config.passphrase.expose_secret().clone())
    }

    fn seal_identities(&self, identities: &str) -> Result<Vec<u8>, KmsError> {
        let mut recipient = age::scrypt::Recipient::new(self.passphrase());
        if let Some(log_n) = self.config.work_factor {
            recipient.set_work_factor(log_n);
        }
        encrypt_to(&recipient, identities.as_bytes())
    }

    fn open_identities(&self, data: &[u8]) -> Result<Vec<x25519::Identity>, KmsError> {
        let decryptor = age::Decryptor::new(data)
            .map_err(|e| KmsError::Configuration(format!("identity file unreadable: {e}")))?;

        let identity = age::scrypt::Identity::new(self.passphrase());
        let mut reader = decryptor
            .decrypt(iter::once(&identity as &dyn age::Identity))
            .map_err(|e| match e {
                age::DecryptError::NoMatchingKeys
                | age::DecryptError::DecryptionFailed
                | age::DecryptError::KeyDecryptionFailed => {
                    KmsError::Configuration("wrong passphrase".to_string())
                }
                other => KmsError::Configuration(format!("identity file unreadable: {other}")),
            })?;

        let mut text = Zeroizing::new(String::new());
        reader
            .read_to_string(&mut text)
            .map_err(|e| KmsError::Configuration(format!("identity file unreadable: {e}")))?;
        parse_identities(&text)
    }

    async fn try_rotate(&self) -> Result<usize, KmsError> {
        let _write = self.write_lock.lock().await;
        let current = self.loaded().await?;

        let mut text = serialize_identities(&current);
        text.push_str(x25519::Identity::generate().to_string().expose_secret());
        text.push('\n');

        let next = parse_identities(&text)?;
        let sealed = self.seal_identities(&text)?;
        write_atomic(&self.config.identity_file, &sealed).await?;

        let count = next.len();
        *self.identities.write().await = Some(Arc::new(next));
        Ok(count)
    }
}

#[async_trait]
impl KmsProvider for AgeKmsProvider {
    fn name(&self) -> &'static str {
        "age"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        let _write = self.write_lock.lock().await;
        if self.identities.read().await.is_some() {
            return Ok(());
        }
        if self.config.passphrase.expose_secret().is_empty() {
            return Err(KmsError::Configuration("passphrase cannot be empty".to_string()));
        }

        let path = &self.config.identity_file;
        let identities = match tokio::fs::read(path).await {
            Ok(data) => {
                let identities = self.open_identities(&data)?;
                tracing::info!(
                    path = %path.display(),
                    versions = identities.len(),
                    "loaded age identities"
                );
                identities
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut text = Zeroizing::new(String::new());
                text.push_str(x25519::Identity::generate().to_string().expose_secret());
                text.push('\n');

                let identities = parse_identities(&text)?;
                write_atomic(path, &self.seal_identities(&text)?).await?;
                tracing::info!(path = %path.display(), "created age identity file");
                identities
            }
            Err(err) => return Err(KmsError::Io(err)),
        };

        *self.identities.write().await = Some(Arc::new(identities));
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.identities.read().await.is_some()
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        let identities = self.loaded().await?;
        let version = identities.len();
        let newest = identities.last().ok_or(KmsError::NotInitialized)?;

        let dek = DataKey::generate();
        let ciphertext = encrypt_to(&newest.to_public(), dek.expose())?;

        Ok(GeneratedDek {
            plaintext: dek,
            encrypted: format!("{version}:{}", STANDARD.encode(ciphertext)),
            kek_version: version.to_string(),
        })
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        let (version, body) = encrypted
            .split_once(':')
            .ok_or_else(|| KmsError::UnwrapFailed("expected {version}:{base64}".to_string()))?;
        version
            .parse::<usize>()
            .map_err(|_| KmsError::UnwrapFailed(format!("invalid KEK version: {version}")))?;
        let ciphertext = STANDARD
            .decode(body)
            .map_err(|e| KmsError::UnwrapFailed(format!("invalid base64: {e}")))?;

        let identities = self.loaded().await?;
        let decryptor = age::Decryptor::new(&ciphertext[..])
            .map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;
        let mut reader = decryptor
            .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;

        let mut dek = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut dek).map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;
        DataKey::try_from_slice(&dek)
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        let identities = self.loaded().await?;
        let newest = identities.last().ok_or(KmsError::NotInitialized)?;
        Ok(KekMetadata {
            id: newest.to_public().to_string(),
            version: identities.len().to_string(),
        })
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(version) => {
                tracing::info!(version, "rotated age identity");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "age identity rotation failed");
                false
            }
        }
    }
}

fn encrypt_to(recipient: &dyn age::Recipient, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
    let encryptor = age::Encryptor::with_recipients(iter::once(recipient))
        .map_err(|e| KmsError::WrapFailed(e.to_string()))?;

    let mut encrypted = Vec::new();
    let mut writer =
        encryptor.wrap_output(&mut encrypted).map_err(|e| KmsError::WrapFailed(e.to_string()))?;
    writer.write_all(plaintext).map_err(|e| KmsError::WrapFailed(e.to_string()))?;
    writer.finish().map_err(|e| KmsError::WrapFailed(e.to_string()))?;
    Ok(encrypted)
}

fn parse_identities(text: &str) -> Result<Vec<x25519::Identity>, KmsError> {
    let identities = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            x25519::Identity::from_str(line)
                .map_err(|e| KmsError::Configuration(format!("invalid identity: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if identities.is_empty() {
        return Err(KmsError::Configuration("identity file holds no identities".to_string()));
    }
    Ok(identities)
}

fn serialize_identities(identities: &[x25519::Identity]) -> Zeroizing<String> {
    let mut text = Zeroizing::new(String::new());
    for identity in identities {
        text.push_str(identity.to_string().expose_secret());
        text.push('\n');
    }
    text
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), KmsError> {
    use tokio::io::AsyncWriteExt;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("tmp");

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let written = async {
        let mut file = options.open(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(KmsError::Io(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Low scrypt cost keeps the passphrase layer fast in tests.
    const TEST_WORK_FACTOR: u8 = 10;

    fn provider(dir: &TempDir, passphrase: &str) -> AgeKmsProvider {
        AgeKmsProvider::new(
            AgeProviderConfig::new(
                dir.path().join("identities.age"),
                SecretString::new(passphrase.to_string()),
            )
            .with_work_factor(TEST_WORK_FACTOR),
        )
    }

    #[tokio::test]
    async fn test_round_trip_and_restart() {
        let dir = TempDir::new().unwrap();
        let first = provider(&dir, "correct horse");
        first.initialize().await.unwrap();
        assert!(first.health_check().await);

        let dek = first.generate_dek().await.unwrap();
        assert!(dek.encrypted.starts_with("1:"));
        assert_eq!(first.decrypt_dek(&dek.encrypted).await.unwrap(), dek.plaintext);

        let meta = first.kek_metadata().await.unwrap();
        assert!(meta.id.starts_with("age1"));
        assert_eq!(meta.version, "1");
        drop(first);

        let second = provider(&dir, "correct horse");
        second.initialize().await.unwrap();
        assert_eq!(second.kek_metadata().await.unwrap(), meta);
        assert_eq!(second.decrypt_dek(&dek.encrypted).await.unwrap(), dek.plaintext);
    }

    #[tokio::test]
    async fn test_identity_file_is_encrypted() {
        let dir = TempDir::new().unwrap();
        provider(&dir, "correct horse").initialize().await.unwrap();

        let raw = std::fs::read(dir.path().join("identities.age")).unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(!text.contains("AGE-SECRET-KEY"));
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
        let before = provider.kek_metadata().await.unwrap();
        let old = provider.generate_dek().await.unwrap();

        assert!(provider.rotate_key().await);
        let after = provider.kek_metadata().await.unwrap();
        assert_eq!(after.version, "2");
        assert_ne!(after.id, before.id);

        let new = provider.generate_dek().await.unwrap();
        assert!(new.encrypted.starts_with("2:"));
        assert_eq!(provider.decrypt_dek(&old.encrypted).await.unwrap(), old.plaintext);
        assert_eq!(provider.decrypt_dek(&new.encrypted).await.unwrap(), new.plaintext);
    }

    #[tokio::test]
    async fn test_not_initialized_and_garbage() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir, "correct horse");
        assert!(matches!(provider.generate_dek().await, Err(KmsError::NotInitialized)));
        assert!(!provider.rotate_key().await);
        assert!(provider.per_user_deks().is_none());

        provider.initialize().await.unwrap();
        assert!(matches!(provider.decrypt_dek("garbage").await, Err(KmsError::UnwrapFailed(_))));
        assert!(matches!(provider.decrypt_dek("1:AAAA").await, Err(KmsError::UnwrapFailed(_))));
    }
}
