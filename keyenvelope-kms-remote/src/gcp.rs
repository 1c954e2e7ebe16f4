//! Google Cloud KMS provider over the REST API.
//!
//! DEKs are generated locally and wrapped with `cryptoKeys.encrypt`. Per-user
//! DEKs bind the user id as `additionalAuthenticatedData`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use keyenvelope::error::KmsError;
use keyenvelope::key::DataKey;
use keyenvelope::kms::{
    GeneratedDek, KekMetadata, KmsProvider, PerUserDekProvider, PerUserDekSemantics,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroizing;

use crate::http::{self, DEFAULT_TIMEOUT};
use crate::token::{AccessToken, TokenCache};

/// Default Cloud KMS endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://cloudkms.googleapis.com";

const KMS_SCOPE: &str = "https://www.googleapis.com/auth/cloudkms";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_TTL_SECS: i64 = 3600;

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The fields of a service-account JSON key this provider needs.
#[derive(Debug, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account e-mail, used as the JWT issuer
    pub client_email: String,
    /// PEM-encoded RSA private key
    pub private_key: SecretString,
    /// OAuth token endpoint
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Parses a service-account JSON key.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self, KmsError> {
        serde_json::from_str(json)
            .map_err(|e| KmsError::Configuration(format!("invalid service account key: {e}")))
    }

    /// Reads a service-account JSON key file.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the file is unreadable or invalid.
    pub async fn from_file(path: &Path) -> Result<Self, KmsError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            KmsError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Mints a signed RS256 assertion for the token exchange.
    fn assertion(&self) -> Result<String, KmsError> {
        #[derive(Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: KMS_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_TTL_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.expose_secret().as_bytes())
            .map_err(|e| {
                KmsError::Configuration(format!("invalid service account private key: {e}"))
            })?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| KmsError::Configuration(format!("failed to sign assertion: {e}")))
    }
}

/// How the provider obtains OAuth access tokens.
#[derive(Debug)]
pub enum GcpAuth {
    /// Service-account JWT exchanged for short-lived tokens
    ServiceAccount(ServiceAccountKey),
    /// Pre-issued access token (e.g. from the metadata server)
    AccessToken(SecretString),
}

/// Configuration for [`GcpKmsProvider`].
#[derive(Debug)]
pub struct GcpProviderConfig {
    /// `projects/{p}/locations/{l}/keyRings/{r}/cryptoKeys/{k}`
    pub key_name: String,
    /// Credentials
    pub auth: GcpAuth,
    /// API endpoint
    pub endpoint: String,
    /// Per-request deadline
    pub timeout: Duration,
}

impl GcpProviderConfig {
    /// Creates a configuration against the public endpoint.
    pub fn new(key_name: impl Into<String>, auth: GcpAuth) -> Self {
        Self {
            key_name: key_name.into(),
            auth,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct EncryptResponse {
    name: String,
    ciphertext: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest<'a> {
    plaintext: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    additional_authenticated_data: Option<String>,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: SecretString,
}

#[derive(Deserialize)]
struct CryptoKey {
    name: String,
    primary: Option<CryptoKeyVersion>,
}

#[derive(Deserialize)]
struct CryptoKeyVersion {
    name: String,
}

/// Google Cloud KMS provider.
///
/// Offers randomized per-user DEKs.
pub struct GcpKmsProvider {
    config: GcpProviderConfig,
    http: reqwest::Client,
    tokens: TokenCache,
    initialized: AtomicBool,
}

impl GcpKmsProvider {
    /// Creates an uninitialized provider.
    ///
    /// # Errors
    ///
    /// Returns `KmsError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: GcpProviderConfig) -> Result<Self, KmsError> {
        let http = http::build_client(config.timeout)?;
        Ok(Self {
            config,
            http,
            tokens: TokenCache::default(),
            initialized: AtomicBool::new(false),
        })
    }

    fn url(&self, suffix: &str) -> String {
        http::join(&self.config.endpoint, &format!("v1/{}{suffix}", self.config.key_name))
    }

    fn ready(&self) -> Result<(), KmsError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(KmsError::NotInitialized)
        }
    }

    async fn fetch_token(&self) -> Result<AccessToken, KmsError> {
        match &self.config.auth {
            GcpAuth::AccessToken(token) => {
                Ok(AccessToken::non_expiring(SecretString::new(token.expose_secret().clone())))
            }
            GcpAuth::ServiceAccount(key) => {
                let assertion = key.assertion()?;
                let request = self
                    .http
                    .post(&key.token_uri)
                    .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())]);
                let response: TokenResponse = http::send_json("gcp token", request).await?;

                tracing::debug!(expires_in = response.expires_in, "obtained GCP access token");
                Ok(AccessToken::new(
                    response.access_token,
                    Duration::from_secs(response.expires_in),
                ))
            }
        }
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
        let key: CryptoKey = self.call("gcp get key", self.http.get(self.url(""))).await?;
        let version = key
            .primary
            .map(|v| v.name)
            .ok_or_else(|| KmsError::KekNotFound(format!("{} has no primary version", key.name)))?;
        Ok(KekMetadata { id: key.name, version })
    }

    async fn wrap(&self, user_id: Option<&str>) -> Result<GeneratedDek, KmsError> {
        self.ready()?;
        let dek = DataKey::generate();

        let encoded = Zeroizing::new(STANDARD.encode(dek.expose()));
        let body = EncryptRequest {
            plaintext: &encoded,
            additional_authenticated_data: user_id.map(|user| STANDARD.encode(user)),
        };
        let response: EncryptResponse =
            self.call("gcp encrypt", self.http.post(self.url(":encrypt")).json(&body)).await?;

        Ok(GeneratedDek {
            plaintext: dek,
            encrypted: response.ciphertext,
            kek_version: response.name,
        })
    }

    async fn unwrap(&self, encrypted: &str, user_id: Option<&str>) -> Result<DataKey, KmsError> {
        self.ready()?;
        STANDARD
            .decode(encrypted)
            .map_err(|e| KmsError::UnwrapFailed(format!("invalid base64: {e}")))?;

        let mut body = json!({ "ciphertext": encrypted });
        if let Some(user) = user_id {
            body["additionalAuthenticatedData"] = json!(STANDARD.encode(user));
        }
        let response: DecryptResponse = self
            .call("gcp decrypt", self.http.post(self.url(":decrypt")).json(&body))
            .await
            .map_err(|err| match err {
                KmsError::Remote(msg) => KmsError::UnwrapFailed(msg),
                other => other,
            })?;

        let plaintext = STANDARD
            .decode(response.plaintext.expose_secret())
            .map(Zeroizing::new)
            .map_err(|e| KmsError::Remote(format!("invalid base64 plaintext: {e}")))?;
        DataKey::try_from_slice(&plaintext)
    }

    async fn try_rotate(&self) -> Result<String, KmsError> {
        self.ready()?;
        let request = self.http.post(self.url("/cryptoKeyVersions")).json(&json!({}));
        let created: CryptoKeyVersion = self.call("gcp create version", request).await?;
        let version_id = created
            .name
            .rsplit('/')
            .next()
            .ok_or_else(|| KmsError::Remote("unexpected key version name".to_string()))?
            .to_string();

        let _: CryptoKey = self
            .call(
                "gcp update primary",
                self.http
                    .post(self.url(":updatePrimaryVersion"))
                    .json(&json!({ "cryptoKeyVersionId": version_id })),
            )
            .await?;
        Ok(created.name)
    }
}

#[async_trait]
impl KmsProvider for GcpKmsProvider {
    fn name(&self) -> &'static str {
        "gcp"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        if self.config.key_name.is_empty() {
            return Err(KmsError::Configuration("GCP key name is required".to_string()));
        }

        match self.metadata().await {
            Ok(meta) => {
                self.initialized.store(true, Ordering::Release);
                tracing::info!(key = %meta.id, version = %meta.version, "connected to Cloud KMS");
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
                tracing::warn!(error = %err, "Cloud KMS health check failed");
                false
            }
        }
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.wrap(None).await
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, None).await
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        self.ready()?;
        self.metadata().await
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(version) => {
                tracing::info!(version = %version, "rotated Cloud KMS key");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Cloud KMS key rotation failed");
                false
            }
        }
    }

    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        Some(self)
    }
}

#[async_trait]
impl PerUserDekProvider for GcpKmsProvider {
    fn semantics(&self) -> PerUserDekSemantics {
        PerUserDekSemantics::Randomized
    }

    async fn generate_per_user_dek(&self, user_id: &str) -> Result<GeneratedDek, KmsError> {
        self.wrap(Some(user_id)).await
    }

    async fn decrypt_per_user_dek(
        &self,
        user_id: &str,
        encrypted: &str,
    ) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, Some(user_id)).await
    }
}
