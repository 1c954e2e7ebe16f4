//! Builds the configured provider behind a trait object.

use anyhow::{bail, Context};
use keyenvelope::kms::KmsProvider;
use keyenvelope_kms_age::{AgeKmsProvider, AgeProviderConfig};
use keyenvelope_kms_aws::{AwsKmsProvider, AwsProviderConfig};
use keyenvelope_kms_local::{LocalKmsProvider, LocalProviderConfig};
use keyenvelope_kms_remote::azure::{AzureKmsProvider, AzureProviderConfig};
use keyenvelope_kms_remote::gcp::{GcpAuth, GcpKmsProvider, GcpProviderConfig, ServiceAccountKey};
use keyenvelope_kms_remote::vault::{VaultAuth, VaultKmsProvider, VaultProviderConfig};

use crate::config::{secret_from_env, timeout, ProviderConfig};

pub type DynProvider = Box<dyn KmsProvider>;

/// Builds an uninitialized provider from `config`.
pub async fn build(config: &ProviderConfig) -> anyhow::Result<DynProvider> {
    let provider: DynProvider = match config {
        ProviderConfig::Local { key_dir, passphrase_env, kdf } => {
            let mut local = LocalProviderConfig::new(key_dir, secret_from_env(passphrase_env)?);
            if let Some(kdf) = kdf {
                local = local.with_kdf(*kdf);
            }
            Box::new(LocalKmsProvider::new(local))
        }
        ProviderConfig::Age { identity_file, passphrase_env, work_factor } => {
            let mut age = AgeProviderConfig::new(identity_file, secret_from_env(passphrase_env)?);
            if let Some(log_n) = work_factor {
                age = age.with_work_factor(*log_n);
            }
            Box::new(AgeKmsProvider::new(age))
        }
        ProviderConfig::Aws { key_id, region, endpoint_url, timeout_secs } => {
            let mut aws = AwsProviderConfig::new(key_id);
            aws.region.clone_from(region);
            aws.endpoint_url.clone_from(endpoint_url);
            aws.timeout = timeout(*timeout_secs, keyenvelope_kms_aws::DEFAULT_TIMEOUT);
            Box::new(AwsKmsProvider::new(aws))
        }
        ProviderConfig::Gcp {
            key_name,
            credentials_file,
            access_token_env,
            endpoint,
            timeout_secs,
        } => {
            let auth = match (credentials_file, access_token_env) {
                (Some(path), _) => GcpAuth::ServiceAccount(
                    ServiceAccountKey::from_file(path)
                        .await
                        .with_context(|| format!("loading {}", path.display()))?,
                ),
                (None, Some(var)) => GcpAuth::AccessToken(secret_from_env(var)?),
                (None, None) => {
                    bail!("gcp provider needs either credentials_file or access_token_env")
                }
            };
            let mut gcp = GcpProviderConfig::new(key_name, auth);
            if let Some(endpoint) = endpoint {
                gcp.endpoint.clone_from(endpoint);
            }
            gcp.timeout = timeout(*timeout_secs, keyenvelope_kms_remote::http::DEFAULT_TIMEOUT);
            Box::new(GcpKmsProvider::new(gcp)?)
        }
        ProviderConfig::Azure {
            vault_url,
            key_name,
            tenant_id,
            client_id,
            client_secret_env,
            authority,
            timeout_secs,
        } => {
            let mut azure = AzureProviderConfig::new(
                vault_url,
                key_name,
                tenant_id,
                client_id,
                secret_from_env(client_secret_env)?,
            );
            if let Some(authority) = authority {
                azure.authority.clone_from(authority);
            }
            azure.timeout = timeout(*timeout_secs, keyenvelope_kms_remote::http::DEFAULT_TIMEOUT);
            Box::new(AzureKmsProvider::new(azure)?)
        }
        ProviderConfig::Vault {
            address,
            key_name,
            mount_path,
            namespace,
            token_env,
            role_id,
            secret_id_env,
            timeout_secs,
        } => {
            let auth = match (token_env, role_id) {
                (Some(var), _) => VaultAuth::Token(secret_from_env(var)?),
                (None, Some(role_id)) => {
                    let var = secret_id_env
                        .as_deref()
                        .context("vault approle auth needs secret_id_env")?;
                    VaultAuth::AppRole {
                        role_id: role_id.clone(),
                        secret_id: secret_from_env(var)?,
                        mount: "approle".to_string(),
                    }
                }
                (None, None) => bail!("vault provider needs either token_env or role_id"),
            };
            let mut vault = VaultProviderConfig::new(address, key_name, auth);
            if let Some(mount) = mount_path {
                vault = vault.with_mount_path(mount);
            }
            if let Some(ns) = namespace {
                vault = vault.with_namespace(ns);
            }
            vault.timeout = timeout(*timeout_secs, keyenvelope_kms_remote::http::DEFAULT_TIMEOUT);
            Box::new(VaultKmsProvider::new(vault)?)
        }
    };
    Ok(provider)
}

/// Builds and initializes the configured provider.
pub async fn connect(config: &ProviderConfig) -> anyhow::Result<DynProvider> {
    let provider = build(config).await?;
    provider
        .initialize()
        .await
        .with_context(|| format!("failed to initialize {} provider", config.kind()))?;
    tracing::info!(provider = provider.name(), "provider ready");
    Ok(provider)
}
