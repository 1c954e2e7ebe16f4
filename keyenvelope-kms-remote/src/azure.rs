//! Azure Key Vault provider.
//!
//! DEKs are generated locally and wrapped with `wrapkey` (RSA-OAEP-256).
//! The stored form is `{key version}:{base64url wrapped key}` so unwrapping
//! addresses the exact key version that wrapped it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use keyenvelope::error::KmsError;
use keyenvelope::key::DataKey;
use keyenvelope::kms::{GeneratedDek, KekMetadata, KmsProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::http::{self, DEFAULT_TIMEOUT};
use crate::token::{AccessToken, TokenCache};

/// Default Microsoft identity platform authority.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

const API_VERSION: &str = "7.4";
const WRAP_ALGORITHM: &str = "RSA-OAEP-256";
const VAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Configuration for [`AzureKmsProvider`].
#[derive(Debug)]
pub struct AzureProviderConfig {
    /// Vault URL, e.g. `https://my-vault.vault.azure.net`
    pub vault_url: String,
    /// RSA key name
    pub key_name: String,
    /// Entra ID tenant
    pub tenant_id: String,
    /// Application (client) id
    pub client_id: String,
    /// Client secret
    pub client_secret: SecretString,
    /// Token authority
    pub authority: String,
    /// Per-request deadline
    pub timeout: Duration,
}

impl AzureProviderConfig {
    /// Creates a configuration using client-credentials auth.
    pub fn new(
        vault_url: impl Into<String>,
        key_name: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            vault_url: vault_url.into(),
            key_name: key_name.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
            authority: DEFAULT_AUTHORITY.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Serialize)]
struct KeyOperation<'a> {
    alg: &'static str,
    value: &'a str,
}

#[derive(Deserialize)]
struct KeyOperationResult {
    kid: String,
    value: String,
}

#[derive(Deserialize)]
struct KeyBundle {
    key: JsonWebKey,
}

#[derive(Deserialize)]
struct JsonWebKey {
    kid: String,
}

/// Azure Key Vault KEK provider.
///
/// `wrapkey` has no associated data, so this provider does not offer
/// per-user DEKs.
pub struct AzureKmsProvider {
    config: AzureProviderConfig,
    http: reqwest::Client,
    tokens: TokenCache,
    initialized: AtomicBool,
}

impl AzureKmsProvider {
    /// Creates an uninitialized provider.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: AzureProviderConfig) -> Result<Self, KmsError> {
        let http = http::build_client(config.timeout)?;
        Ok(Self {
            config,
            http,
            tokens: TokenCache::default(),
            initialized: AtomicBool::new(false),
        })
    }

    fn key_url(&self, path: &str) -> String {
        let base = http::join(&self.config.vault_url, &format!("keys/{}", self.config.key_name));
        let base = if path.is_empty() { base } else { http::join(&base, path) };
        format!("{base}?api-version={API_VERSION}")
    }

    fn ready(&self) -> Result<(), KmsError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KmsError::NotInitialized)
        }
    }

    async fn fetch_token(&self) -> Result<AccessToken, KmsError> {
        let url = http::join(
            &self.config.authority,
            &format!("{}/oauth2/v2.0/token", self.config.tenant_id),
        );
        let request = self.http.post(url).form(&[
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret().as_str()),
            ("scope", VAULT_SCOPE),
        ]);
        let response: TokenResponse = http::send_json("azure token", request).await?;

        tracing::debug!(expires_in = response.expires_in, "obtained Azure access token");
        Ok(AccessToken::new(response.access_token, Duration::from_secs(response.expires_in)))
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, KmsError> {
        let token = self.tokens.get_or_refresh(|| self.fetch_token()).await?;
        let result = http::send_json(operation, request.bearer_auth(token.expose_secret())).await;
        if matches!(result, Err(KmsError::Unauthorized(_))) {
            self.tokens.invalidate().await;
        }
        result
    }

    async fn metadata(&self) -> Result<KekMetadata, KmsError> {
        let bundle: KeyBundle = self.call("azure get key", self.http.get(self.key_url(""))).await?;
        let version = key_version(&bundle.key.kid)
            .ok_or_else(|| KmsError::Remote(format!("unexpected key id: {}", bundle.key.kid)))?
            .to_string();
        Ok(KekMetadata { id: bundle.key.kid, version })
    }

    async fn try_rotate(&self) -> Result<String, KmsError> {
        self.ready()?;
        let bundle: KeyBundle =
            self.call("azure rotate key", self.http.post(self.key_url("rotate"))).await?;
        Ok(bundle.key.kid)
    }
}

/// Extracts the version segment from a key id (`…/keys/{name}/{version}`).
fn key_version(kid: &str) -> Option<&str> {
    let (_, version) = kid.trim_end_matches('/').rsplit_once('/')?;
    (!version.is_empty()).then_some(version)
}

#[async_trait]
impl KmsProvider for AzureKmsProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        if self.config.vault_url.is_empty() || self.config.key_name.is_empty() {
            return Err(KmsError::Configuration("vault URL and key name are required".to_string()));
        }
        if self.config.client_secret.expose_secret().is_empty() {
            return Err(KmsError::Configuration("client secret is required".to_string()));
        }

        match self.metadata().await {
            Ok(meta) => {
                self.initialized.store(true, Ordering::Release);
                tracing::info!(key = %meta.id, "connected to Azure Key Vault");
                Ok(())
            }
            Err(KmsError::Unauthorized(msg)) => Err(KmsError::Configuration(msg)),
            Err(err) => Err(err),
        }
    }

    async fn health_check(&self) -> bool {
        match self.kek_metadata().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "Azure Key Vault health check failed");
                false
            }
        }
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.ready()?;
        let meta = self.metadata().await?;
        let dek = DataKey::generate();

        let encoded = Zeroizing::new(URL_SAFE_NO_PAD.encode(dek.expose()));
        let body = KeyOperation { alg: WRAP_ALGORITHM, value: &encoded };
        let url = self.key_url(&format!("{}/wrapkey", meta.version));
        let result: KeyOperationResult =
            self.call("azure wrapkey", self.http.post(url).json(&body)).await?;

        let version = key_version(&result.kid).unwrap_or(meta.version.as_str()).to_string();
        Ok(GeneratedDek {
            plaintext: dek,
            encrypted: format!("{version}:{}", result.value),
            kek_version: version,
        })
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.ready()?;
        let (version, value) = encrypted
            .split_once(':')
            .filter(|(v, w)| !v.is_empty() && !w.is_empty())
            .ok_or_else(|| KmsError::UnwrapFailed("expected {version}:{base64url}".to_string()))?;
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| KmsError::UnwrapFailed(format!("invalid base64url: {e}")))?;

        let body = KeyOperation { alg: WRAP_ALGORITHM, value };
        let url = self.key_url(&format!("{version}/unwrapkey"));
        let result: KeyOperationResult = self
            .call("azure unwrapkey", self.http.post(url).json(&body))
            .await
            .map_err(|err| match err {
                KmsError::Remote(msg) => KmsError::UnwrapFailed(msg),
                other => other,
            })?;

        let encoded = Zeroizing::new(result.value);
        let plaintext = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map(Zeroizing::new)
            .map_err(|e| KmsError::Remote(format!("invalid base64url plaintext: {e}")))?;
        DataKey::try_from_slice(&plaintext)
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        self.ready()?;
        self.metadata().await
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(kid) => {
                tracing::info!(kid = %kid, "rotated Azure Key Vault key");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Azure Key Vault key rotation failed");
                false
            }
        }
    }
}
