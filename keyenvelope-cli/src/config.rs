//! TOML configuration for the `keyenvelope` binary.
//!
//! Secrets never live in the file. Each secret field names an environment
//! variable that is read when the provider is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use keyenvelope::kms::ProviderKind;
use keyenvelope_kms_local::KdfParams;
use secrecy::SecretString;
use serde::Deserialize;

pub const DEFAULT_PASSPHRASE_ENV: &str = "KEYENVELOPE_PASSPHRASE";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub provider: ProviderConfig,
    /// Wrapped master secret for per-user derivation, as printed by
    /// `provision-master`
    #[serde(default)]
    pub master_secret: Option<String>,
    /// Pepper mixed into every per-user key
    #[serde(default)]
    pub pepper_env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProviderConfig {
    Local {
        key_dir: PathBuf,
        #[serde(default = "default_passphrase_env")]
        passphrase_env: String,
        #[serde(default)]
        kdf: Option<KdfParams>,
    },
    Age {
        identity_file: PathBuf,
        #[serde(default = "default_passphrase_env")]
        passphrase_env: String,
        #[serde(default)]
        work_factor: Option<u8>,
    },
    Aws {
        key_id: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint_url: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Gcp {
        key_name: String,
        /// Service-account JSON key file
        #[serde(default)]
        credentials_file: Option<PathBuf>,
        /// Variable holding a pre-issued access token
        #[serde(default)]
        access_token_env: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Azure {
        vault_url: String,
        key_name: String,
        tenant_id: String,
        client_id: String,
        client_secret_env: String,
        #[serde(default)]
        authority: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Vault {
        address: String,
        key_name: String,
        #[serde(default)]
        mount_path: Option<String>,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        token_env: Option<String>,
        #[serde(default)]
        role_id: Option<String>,
        #[serde(default)]
        secret_id_env: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

fn default_passphrase_env() -> String {
    DEFAULT_PASSPHRASE_ENV.to_string()
}

impl ProviderConfig {
    pub const fn kind(&self) -> ProviderKind {
        match self {
            Self::Local { .. } => ProviderKind::Local,
            Self::Age { .. } => ProviderKind::Age,
            Self::Aws { .. } => ProviderKind::Aws,
            Self::Gcp { .. } => ProviderKind::Gcp,
            Self::Azure { .. } => ProviderKind::Azure,
            Self::Vault { .. } => ProviderKind::Vault,
        }
    }
}

pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = toml::from_str(contents)?;
    if let ProviderConfig::Vault { token_env, role_id, .. } = &config.provider {
        if token_env.is_none() && role_id.is_none() {
            bail!("vault provider needs either token_env or role_id");
        }
    }
    if let ProviderConfig::Gcp { credentials_file, access_token_env, .. } = &config.provider {
        if credentials_file.is_none() && access_token_env.is_none() {
            bail!("gcp provider needs either credentials_file or access_token_env");
        }
    }
    Ok(config)
}

pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("failed to parse config {}", path.display()))
}

/// Reads a secret from the environment variable `name`.
pub fn secret_from_env(name: &str) -> anyhow::Result<SecretString> {
    let value = std::env::var(name)
        .with_context(|| format!("environment variable {name} is not set"))?;
    if value.is_empty() {
        bail!("environment variable {name} is empty");
    }
    Ok(SecretString::new(value))
}

pub fn timeout(secs: Option<u64>, default: Duration) -> Duration {
    secs.map_or(default, Duration::from_secs)
}
