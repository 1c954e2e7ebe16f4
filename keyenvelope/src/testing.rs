//! In-memory provider for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::cipher;
use crate::error::KmsError;
use crate::key::DataKey;
use crate::kms::{GeneratedDek, KekMetadata, KmsProvider};

/// Versioned in-memory KEKs with switchable availability.
pub struct MockKmsProvider {
    keks: RwLock<Vec<DataKey>>,
    initialized: AtomicBool,
    available: AtomicBool,
    metadata_available: AtomicBool,
}

impl MockKmsProvider {
    pub fn new() -> Self {
        let provider = Self::uninitialized();
        provider.initialized.store(true, Ordering::SeqCst);
        provider
    }

    pub fn uninitialized() -> Self {
        Self {
            keks: RwLock::new(vec![DataKey::generate()]),
            initialized: AtomicBool::new(false),
            available: AtomicBool::new(true),
            metadata_available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fails `kek_metadata` only, leaving wrap and unwrap working.
    pub fn set_metadata_available(&self, available: bool) {
        self.metadata_available.store(available, Ordering::SeqCst);
    }

    fn ready(&self) -> Result<(), KmsError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(KmsError::NotInitialized);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(KmsError::Unavailable("mock offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KmsProvider for MockKmsProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.ready().is_ok()
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.ready()?;
        let keks = self.keks.read().unwrap();
        let version = keks.len();
        let dek = DataKey::generate();
        let wrapped = cipher::seal_packed(&keks[version - 1], dek.expose(), b"mock")
            .map_err(|e| KmsError::WrapFailed(e.to_string()))?;

        Ok(GeneratedDek {
            plaintext: dek,
            encrypted: format!("v{version}:{}", STANDARD.encode(wrapped)),
            kek_version: format!("v{version}"),
        })
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.ready()?;
        let (version, body) = encrypted
            .strip_prefix('v')
            .and_then(|rest| rest.split_once(':'))
            .ok_or_else(|| KmsError::UnwrapFailed("missing version".to_string()))?;
        let version: usize =
            version.parse().map_err(|_| KmsError::UnwrapFailed("bad version".to_string()))?;
        let wrapped =
            STANDARD.decode(body).map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;

        let keks = self.keks.read().unwrap();
        let kek = version
            .checked_sub(1)
            .and_then(|i| keks.get(i))
            .ok_or_else(|| KmsError::KekNotFound(format!("v{version}")))?;
        let dek = cipher::open_packed(kek, &wrapped, b"mock")
            .map_err(|e| KmsError::UnwrapFailed(e.to_string()))?;
        DataKey::try_from_slice(&dek)
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        self.ready()?;
        if !self.metadata_available.load(Ordering::SeqCst) {
            return Err(KmsError::Timeout("mock metadata".to_string()));
        }
        let version = self.keks.read().unwrap().len();
        Ok(KekMetadata { id: "mock-kek".to_string(), version: format!("v{version}") })
    }

    async fn rotate_key(&self) -> bool {
        if self.ready().is_err() {
            return false;
        }
        self.keks.write().unwrap().push(DataKey::generate());
        true
    }
}
