//! HashiCorp Vault Transit provider.
//!
//! DEKs come from `datakey/plaintext/{key}`; the Transit ciphertext
//! (`vault:v{n}:…`) is stored as-is and unwrapped through `decrypt/{key}`.
//! The transit key itself never leaves Vault.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyenvelope::error::KmsError;
use keyenvelope::key::{DataKey, DEK_SIZE};
use keyenvelope::kms::{GeneratedDek, KekMetadata, KmsProvider};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use zeroize::Zeroizing;

use crate::http::{self, DEFAULT_TIMEOUT};
use crate::token::{AccessToken, TokenCache};

/// `sys/health` statuses for an unsealed standby or performance standby.
const STANDBY_STATUSES: [u16; 3] = [429, 472, 473];

/// How the provider authenticates to Vault.
#[derive(Debug)]
pub enum VaultAuth {
    /// Static token
    Token(SecretString),
    /// AppRole login; the issued token is cached for its lease
    AppRole {
        /// Role id
        role_id: String,
        /// Secret id
        secret_id: SecretString,
        /// Auth mount path, usually `approle`
        mount: String,
    },
}

/// Configuration for [`VaultKmsProvider`].
#[derive(Debug)]
pub struct VaultProviderConfig {
    /// Vault server URL
    pub address: String,
    /// Transit key name
    pub key_name: String,
    /// Transit secrets engine mount path
    pub mount_path: String,
    /// Namespace (Vault Enterprise)
    pub namespace: Option<String>,
    /// Authentication method
    pub auth: VaultAuth,
    /// Per-request deadline
    pub timeout: Duration,
}

impl VaultProviderConfig {
    /// Creates a configuration with the default `transit` mount.
    pub fn new(address: impl Into<String>, key_name: impl Into<String>, auth: VaultAuth) -> Self {
        Self {
            address: address.into(),
            key_name: key_name.into(),
            mount_path: "transit".to_string(),
            namespace: None,
            auth,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets a custom Transit mount path.
    #[must_use]
    pub fn with_mount_path(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }
}

#[derive(Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Deserialize)]
struct DataKeyData {
    plaintext: SecretString,
    ciphertext: String,
}

#[derive(Deserialize)]
struct DecryptData {
    plaintext: SecretString,
}

#[derive(Deserialize)]
struct KeyData {
    latest_version: u64,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

/// Vault Transit KEK provider.
///
/// Transit keys without key derivation cannot bind a context, so this
/// provider does not offer per-user DEKs.
pub struct VaultKmsProvider {
    config: VaultProviderConfig,
    http: reqwest::Client,
    tokens: TokenCache,
    initialized: AtomicBool,
}

impl VaultKmsProvider {
    /// Creates an uninitialized provider.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: VaultProviderConfig) -> Result<Self, KmsError> {
        let http = http::build_client(config.timeout)?;
        Ok(Self {
            config,
            http,
            tokens: TokenCache::default(),
            initialized: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        http::join(&self.config.address, &format!("v1/{path}"))
    }

    fn transit_url(&self, path: &str) -> String {
        self.url(&format!("{}/{path}", self.config.mount_path))
    }

    fn ready(&self) -> Result<(), KmsError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KmsError::NotInitialized)
        }
    }

    async fn login(&self) -> Result<AccessToken, KmsError> {
        match &self.config.auth {
            VaultAuth::Token(token) => {
                Ok(AccessToken::non_expiring(SecretString::new(token.expose_secret().clone())))
            }
            VaultAuth::AppRole { role_id, secret_id, mount } => {
                let body = json!({ "role_id": role_id, "secret_id": secret_id.expose_secret() });
                let url = self.url(&format!("auth/{mount}/login"));
                let mut request = self.http.post(url).json(&body);
                if let Some(ns) = &self.config.namespace {
                    request = request.header("X-Vault-Namespace", ns);
                }
                let response: LoginResponse = http::send_json("vault login", request).await?;

                tracing::debug!(
                    lease_secs = response.auth.lease_duration,
                    "vault AppRole login succeeded"
                );
                Ok(AccessToken::new(
                    response.auth.client_token,
                    Duration::from_secs(response.auth.lease_duration),
                ))
            }
        }
    }

    async fn authorized(
        &self,
        operation: &str,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, KmsError> {
        let token = self.tokens.get_or_refresh(|| self.login()).await?;

        let mut request =
            self.http.request(method, url).header("X-Vault-Token", token.expose_secret());
        if let Some(ns) = &self.config.namespace {
            request = request.header("X-Vault-Namespace", ns);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let result = http::send(operation, request).await;
        if matches!(result, Err(KmsError::Unauthorized(_))) {
            self.tokens.invalidate().await;
        }
        result
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        method: reqwest::Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<T, KmsError> {
        let response = self.authorized(operation, method, url, body).await?;
        http::decode_json(operation, response).await
    }

    /// Checks `sys/health`, counting unsealed standbys as healthy.
    async fn server_health(&self) -> Result<(), KmsError> {
        let url = format!("{}?standbyok=true&perfstandbyok=true", self.url("sys/health"));
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| http::classify_send_error("vault health", &e))?;

        let status = response.status();
        if status.is_success() || STANDBY_STATUSES.contains(&status.as_u16()) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(http::classify_status("vault health", status, &body))
    }

    async fn metadata(&self) -> Result<KekMetadata, KmsError> {
        let url = self.transit_url(&format!("keys/{}", self.config.key_name));
        let response: DataResponse<KeyData> =
            self.call("vault read key", reqwest::Method::GET, url, None).await?;
        Ok(KekMetadata {
            id: format!("{}/keys/{}", self.config.mount_path, self.config.key_name),
            version: format!("v{}", response.data.latest_version),
        })
    }

    async fn try_rotate(&self) -> Result<(), KmsError> {
        self.ready()?;
        let url = self.transit_url(&format!("keys/{}/rotate", self.config.key_name));
        self.authorized("vault rotate key", reqwest::Method::POST, url, None).await?;
        Ok(())
    }
}

/// Extracts `v{n}` from a Transit ciphertext (`vault:v{n}:…`).
fn ciphertext_version(ciphertext: &str) -> Option<&str> {
    let mut parts = ciphertext.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("vault"), Some(version), Some(_)) if version.starts_with('v') => Some(version),
        _ => None,
    }
}

fn decode_key(plaintext: &SecretString) -> Result<DataKey, KmsError> {
    let bytes = STANDARD
        .decode(plaintext.expose_secret())
        .map(Zeroizing::new)
        .map_err(|e| KmsError::Remote(format!("invalid base64 key from Vault: {e}")))?;
    if bytes.len() != DEK_SIZE {
        return Err(KmsError::Remote(format!(
            "unexpected key size from Vault: {} (expected {DEK_SIZE})",
            bytes.len()
        )));
    }
    DataKey::try_from_slice(&bytes)
}

#[async_trait]
impl KmsProvider for VaultKmsProvider {
    fn name(&self) -> &'static str {
        "vault"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        if self.config.address.is_empty() || self.config.key_name.is_empty() {
            return Err(KmsError::Configuration(
                "vault address and key name are required".to_string(),
            ));
        }

        match self.metadata().await {
            Ok(meta) => {
                self.initialized.store(true, Ordering::Release);
                tracing::info!(
                    key = %meta.id,
                    version = %meta.version,
                    "connected to Vault Transit"
                );
                Ok(())
            }
            Err(KmsError::Unauthorized(msg)) => Err(KmsError::Configuration(msg)),
            Err(err) => Err(err),
        }
    }

    async fn health_check(&self) -> bool {
        if self.ready().is_err() {
            return false;
        }
        let result = match self.server_health().await {
            Ok(()) => self.metadata().await.map(|_| ()),
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "vault health check failed");
                false
            }
        }
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.ready()?;
        let url = self.transit_url(&format!("datakey/plaintext/{}", self.config.key_name));
        let response: DataResponse<DataKeyData> = self
            .call("vault datakey", reqwest::Method::POST, url, Some(json!({ "bits": 256 })))
            .await?;

        let version = ciphertext_version(&response.data.ciphertext)
            .ok_or_else(|| KmsError::Remote("unexpected Transit ciphertext format".to_string()))?
            .to_string();
        Ok(GeneratedDek {
            plaintext: decode_key(&response.data.plaintext)?,
            encrypted: response.data.ciphertext,
            kek_version: version,
        })
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.ready()?;
        if ciphertext_version(encrypted).is_none() {
            return Err(KmsError::UnwrapFailed("expected vault:v{n}:… ciphertext".to_string()));
        }

        let url = self.transit_url(&format!("decrypt/{}", self.config.key_name));
        let body = json!({ "ciphertext": encrypted });
        let response: DataResponse<DecryptData> = self
            .call("vault decrypt", reqwest::Method::POST, url, Some(body))
            .await
            .map_err(|err| match err {
                KmsError::Remote(msg) => KmsError::UnwrapFailed(msg),
                other => other,
            })?;
        decode_key(&response.data.plaintext)
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        self.ready()?;
        self.metadata().await
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(()) => {
                tracing::info!(key = %self.config.key_name, "rotated Vault Transit key");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "vault key rotation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_server::TestServer;

    const KEY_B64: &str = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=";

    fn transit_handler(request: &crate::test_server::Recorded) -> (u16, String) {
        let path = request.path.split('?').next().unwrap_or_default();
        let public = path == "/v1/sys/health" || path.starts_with("/v1/auth/");
        if !public && request.header("x-vault-token") != Some("s.token") {
            return (403, r#"{"errors":["permission denied"]}"#.to_string());
        }
        match (request.method.as_str(), path) {
            ("GET", "/v1/sys/health") => {
                (200, r#"{"initialized":true,"sealed":false}"#.to_string())
            }
            ("GET", "/v1/transit/keys/app") => {
                (200, r#"{"data":{"latest_version":2}}"#.to_string())
            }
            ("POST", "/v1/transit/datakey/plaintext/app") => (
                200,
                format!(r#"{{"data":{{"plaintext":"{KEY_B64}","ciphertext":"vault:v2:abcdef"}}}}"#),
            ),
            ("POST", "/v1/transit/decrypt/app") => {
                if request.json()["ciphertext"] == "vault:v2:abcdef" {
                    (200, format!(r#"{{"data":{{"plaintext":"{KEY_B64}"}}}}"#))
                } else {
                    (400, r#"{"errors":["cipher: message authentication failed"]}"#.to_string())
                }
            }
            ("POST", "/v1/transit/keys/app/rotate") => (204, String::new()),
            ("POST", "/v1/auth/approle/login") => {
                if request.json()["secret_id"] == "secret" {
                    let auth = r#"{"auth":{"client_token":"s.token","lease_duration":3600}}"#;
                    (200, auth.to_string())
                } else {
                    (400, r#"{"errors":["invalid secret id"]}"#.to_string())
                }
            }
            _ => (404, r#"{"errors":[]}"#.to_string()),
        }
    }

    fn provider(url: &str, auth: VaultAuth) -> VaultKmsProvider {
        VaultKmsProvider::new(VaultProviderConfig::new(url, "app", auth)).unwrap()
    }

    #[tokio::test]
    async fn test_token_auth_round_trip() {
        let server = TestServer::start(transit_handler).await;
        let provider = provider(&server.url, VaultAuth::Token(SecretString::new("s.token".into())));

        provider.initialize().await.unwrap();
        assert!(provider.health_check().await);

        let dek = provider.generate_dek().await.unwrap();
        assert_eq!(dek.encrypted, "vault:v2:abcdef");
        assert_eq!(dek.kek_version, "v2");

        let unwrapped = provider.decrypt_dek(&dek.encrypted).await.unwrap();
        assert_eq!(unwrapped, dek.plaintext);

        let meta = provider.kek_metadata().await.unwrap();
        assert_eq!(meta.id, "transit/keys/app");
        assert_eq!(meta.version, "v2");

        assert!(provider.rotate_key().await);
        assert!(provider.per_user_deks().is_none());
    }

    #[tokio::test]
    async fn test_approle_login_is_cached() {
        let server = TestServer::start(transit_handler).await;
        let provider = provider(
            &server.url,
            VaultAuth::AppRole {
                role_id: "role".into(),
                secret_id: SecretString::new("secret".into()),
                mount: "approle".into(),
            },
        );

        provider.initialize().await.unwrap();
        provider.generate_dek().await.unwrap();
        provider.kek_metadata().await.unwrap();

        let logins = server
            .recorded()
            .iter()
            .filter(|r| r.path == "/v1/auth/approle/login")
            .count();
        assert_eq!(logins, 1);
    }

    #[tokio::test]
    async fn test_rejected_token_is_configuration_error() {
        let server = TestServer::start(transit_handler).await;
        let provider = provider(&server.url, VaultAuth::Token(SecretString::new("wrong".into())));

        assert!(matches!(provider.initialize().await, Err(KmsError::Configuration(_))));
        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn test_altered_ciphertext_fails_unwrap() {
        let server = TestServer::start(transit_handler).await;
        let provider = provider(&server.url, VaultAuth::Token(SecretString::new("s.token".into())));
        provider.initialize().await.unwrap();

        assert!(matches!(
            provider.decrypt_dek("vault:v2:tampered").await,
            Err(KmsError::UnwrapFailed(_))
        ));
        assert!(matches!(provider.decrypt_dek("garbage").await, Err(KmsError::UnwrapFailed(_))));
    }

    #[tokio::test]
    async fn test_unreachable_vault() {
        let provider =
            provider("http://127.0.0.1:9", VaultAuth::Token(SecretString::new("t".into())));

        let err = provider.initialize().await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
        assert!(!provider.health_check().await);
        assert!(matches!(provider.generate_dek().await, Err(KmsError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_standby_node_is_healthy() {
        for status in STANDBY_STATUSES {
            let server = TestServer::start(move |request| {
                if request.path.starts_with("/v1/sys/health") {
                    (status, r#"{"initialized":true,"sealed":false,"standby":true}"#.to_string())
                } else {
                    transit_handler(request)
                }
            })
            .await;
            let provider =
                provider(&server.url, VaultAuth::Token(SecretString::new("s.token".into())));
            provider.initialize().await.unwrap();

            assert!(provider.health_check().await, "standby status {status}");
            let health = server
                .recorded()
                .into_iter()
                .find(|r| r.path.starts_with("/v1/sys/health"))
                .unwrap();
            assert_eq!(health.path, "/v1/sys/health?standbyok=true&perfstandbyok=true");
        }
    }

    #[tokio::test]
    async fn test_sealed_vault_is_unhealthy() {
        let server = TestServer::start(|request| {
            if request.path.starts_with("/v1/sys/health") {
                (503, r#"{"initialized":true,"sealed":true}"#.to_string())
            } else {
                transit_handler(request)
            }
        })
        .await;
        let provider = provider(&server.url, VaultAuth::Token(SecretString::new("s.token".into())));
        provider.initialize().await.unwrap();

        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn test_rejected_rotation_discards_token() {
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);
        let server = TestServer::start(move |request| {
            if request.path == "/v1/transit/keys/app/rotate" && !flag.swap(true, Ordering::SeqCst) {
                return (403, r#"{"errors":["permission denied"]}"#.to_string());
            }
            transit_handler(request)
        })
        .await;
        let provider = provider(
            &server.url,
            VaultAuth::AppRole {
                role_id: "role".into(),
                secret_id: SecretString::new("secret".into()),
                mount: "approle".into(),
            },
        );
        provider.initialize().await.unwrap();

        assert!(!provider.rotate_key().await);
        assert!(rejected.load(Ordering::SeqCst));

        // The next call logs in again and succeeds
        assert!(provider.rotate_key().await);
        let logins = server
            .recorded()
            .iter()
            .filter(|r| r.path == "/v1/auth/approle/login")
            .count();
        assert_eq!(logins, 2);
    }

    #[test]
    fn test_decode_key_checks_size() {
        let key = decode_key(&SecretString::new(KEY_B64.into())).unwrap();
        assert_eq!(key.expose(), &[1u8; DEK_SIZE]);

        let short = SecretString::new(STANDARD.encode([1u8; 16]));
        assert!(matches!(decode_key(&short), Err(KmsError::Remote(_))));
        let invalid = SecretString::new("not base64!".into());
        assert!(matches!(decode_key(&invalid), Err(KmsError::Remote(_))));
    }

    #[test]
    fn test_ciphertext_version() {
        assert_eq!(ciphertext_version("vault:v3:abc"), Some("v3"));
        assert_eq!(ciphertext_version("vault:v3"), None);
        assert_eq!(ciphertext_version("other:v1:abc"), None);
    }
}
