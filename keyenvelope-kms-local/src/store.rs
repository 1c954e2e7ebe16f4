//! On-disk KEK metadata (`kek.json`).
//!
//! ```text
//! keys/
//! └── kek.json   (0600 on unix)
//! ```
//!
//! The file holds salts and passphrase check tokens only; master keys are
//! re-derived from the passphrase at startup and never written.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use keyenvelope::error::KmsError;
use serde::{Deserialize, Serialize};

use crate::kdf::KdfParams;

/// File name of the KEK metadata inside the key directory.
pub const KEK_FILE: &str = "kek.json";

/// Contents of `kek.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekFile {
    /// Stable KEK identifier
    pub id: String,
    /// Version used for new DEKs
    pub current_version: u32,
    /// Argon2id parameters shared by all versions
    pub kdf: KdfParams,
    /// Every version ever created, oldest first
    pub versions: Vec<KekVersion>,
}

/// One KEK version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekVersion {
    /// Version number, starting at 1
    pub version: u32,
    /// Argon2id salt (base64)
    pub salt: String,
    /// AEAD token proving the passphrase (base64)
    pub check: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl KekFile {
    /// Returns the entry for `version`.
    #[must_use]
    pub fn version(&self, version: u32) -> Option<&KekVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// Location of the key directory's files.
#[derive(Debug, Clone)]
pub struct KekStore {
    path: PathBuf,
}

impl KekStore {
    /// Creates a store rooted at `key_dir`.
    pub fn new(key_dir: &Path) -> Self {
        Self { path: key_dir.join(KEK_FILE) }
    }

    /// Returns the path of `kek.json`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads `kek.json`, or `None` if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the file is unreadable or corrupt.
    pub async fn load(&self) -> Result<Option<KekFile>, KmsError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(KmsError::Io(err)),
        };

        let file: KekFile = serde_json::from_slice(&data).map_err(|e| {
            KmsError::Configuration(format!("{} is corrupt: {e}", self.path.display()))
        })?;
        if file.version(file.current_version).is_none() {
            return Err(KmsError::Configuration(format!(
                "{} has no entry for current version {}",
                self.path.display(),
                file.current_version
            )));
        }
        Ok(Some(file))
    }

    /// Writes `kek.json` atomically: temp file, fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Io` on any filesystem failure; the previous file is
    /// left intact.
    pub async fn save(&self, file: &KekFile) -> Result<(), KmsError> {
        let data = serde_json::to_vec_pretty(file)
            .map_err(|e| KmsError::WrapFailed(format!("serialize KEK file: {e}")))?;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let result = write_synced(&tmp, &data).await;
        let result = match result {
            Ok(()) => tokio::fs::rename(&tmp, &self.path).await.map_err(KmsError::from),
            Err(err) => Err(err),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<(), KmsError> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> KekFile {
        KekFile {
            id: "local-0011".to_string(),
            current_version: 1,
            kdf: KdfParams::insecure_fast(),
            versions: vec![KekVersion {
                version: 1,
                salt: "c2FsdA==".to_string(),
                check: "Y2hlY2s=".to_string(),
                created_at: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = KekStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = KekStore::new(dir.path());
        let file = sample();

        store.save(&file).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(file));
        assert!(!dir.path().join("kek.json.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = KekStore::new(dir.path());
        store.save(&sample()).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(KEK_FILE), b"{ not json").unwrap();

        let result = KekStore::new(dir.path()).load().await;
        assert!(matches!(result, Err(KmsError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_missing_current_version_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KekStore::new(dir.path());
        let mut file = sample();
        file.current_version = 2;
        store.save(&file).await.unwrap();

        assert!(matches!(store.load().await, Err(KmsError::Configuration(_))));
    }
}
