//! AWS KMS key provider for `keyenvelope`.
//!
//! DEKs come from `GenerateDataKey` and are stored as the base64 KMS
//! ciphertext blob; unwrapping calls `Decrypt`. AWS rotates key material
//! behind a stable ARN, so the reported KEK version is the key ARN.
//!
//! # Example
//!
//! ```rust,no_run
//! use keyenvelope::kms::KmsProvider;
//! use keyenvelope_kms_aws::{AwsKmsProvider, AwsProviderConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AwsKmsProvider::new(AwsProviderConfig::new("alias/keyenvelope-kek"));
//! provider.initialize().await?;
//! let dek = provider.generate_dek().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! The provider uses the AWS SDK's default credential chain:
//! - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::config::timeout::TimeoutConfig;
use aws_sdk_kms::config::Region;
use aws_sdk_kms::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::types::DataKeySpec;
use aws_sdk_kms::Client as KmsClient;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use keyenvelope::error::KmsError;
use keyenvelope::key::DataKey;
use keyenvelope::kms::{
    GeneratedDek, KekMetadata, KmsProvider, PerUserDekProvider, PerUserDekSemantics,
};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Encryption context key binding a per-user DEK to its principal.
pub const USER_CONTEXT_KEY: &str = "user_id";

/// Default per-operation deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`AwsKmsProvider`].
#[derive(Debug, Clone)]
pub struct AwsProviderConfig {
    /// KMS key ID, ARN or alias (e.g. `alias/keyenvelope-kek`)
    pub key_id: String,
    /// Region override; defaults to the SDK's region resolution
    pub region: Option<String>,
    /// Endpoint override, e.g. a local KMS emulator
    pub endpoint_url: Option<String>,
    /// Deadline for each KMS operation, retries included
    pub timeout: Duration,
}

impl AwsProviderConfig {
    /// Creates a configuration for `key_id` with SDK defaults.
    pub fn new(key_id: impl Into<String>) -> Self {
        Self { key_id: key_id.into(), region: None, endpoint_url: None, timeout: DEFAULT_TIMEOUT }
    }
}

struct Connection {
    client: KmsClient,
    key_arn: String,
}

/// AWS KMS provider.
///
/// Offers randomized per-user DEKs bound through the KMS encryption context.
pub struct AwsKmsProvider {
    config: AwsProviderConfig,
    connection: RwLock<Option<Connection>>,
}

impl AwsKmsProvider {
    /// Creates an uninitialized provider.
    #[must_use]
    pub fn new(config: AwsProviderConfig) -> Self {
        Self { config, connection: RwLock::new(None) }
    }

    async fn client(&self) -> Result<(KmsClient, String), KmsError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(KmsError::NotInitialized)?;
        Ok((connection.client.clone(), connection.key_arn.clone()))
    }

    async fn describe(client: &KmsClient, key_id: &str) -> Result<String, KmsError> {
        let response = client
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify("DescribeKey", e))?;

        response
            .key_metadata()
            .and_then(|meta| meta.arn())
            .map(str::to_string)
            .ok_or_else(|| KmsError::Remote("DescribeKey returned no key ARN".to_string()))
    }

    async fn generate(&self, user_id: Option<&str>) -> Result<GeneratedDek, KmsError> {
        let (client, key_arn) = self.client().await?;

        let mut request = client.generate_data_key().key_id(&key_arn).key_spec(DataKeySpec::Aes256);
        if let Some(user) = user_id {
            request = request.encryption_context(USER_CONTEXT_KEY, user);
        }
        let mut response = request.send().await.map_err(|e| classify("GenerateDataKey", e))?;

        let plaintext = response
            .plaintext
            .take()
            .map(|blob| Zeroizing::new(blob.into_inner()))
            .ok_or_else(|| KmsError::WrapFailed("no plaintext key returned".to_string()))?;
        let ciphertext = response
            .ciphertext_blob()
            .ok_or_else(|| KmsError::WrapFailed("no ciphertext blob returned".to_string()))?;

        Ok(GeneratedDek {
            plaintext: DataKey::try_from_slice(&plaintext)?,
            encrypted: STANDARD.encode(ciphertext.as_ref()),
            kek_version: response.key_id().unwrap_or(key_arn.as_str()).to_string(),
        })
    }

    async fn unwrap(&self, encrypted: &str, user_id: Option<&str>) -> Result<DataKey, KmsError> {
        let blob = STANDARD
            .decode(encrypted)
            .map_err(|e| KmsError::UnwrapFailed(format!("invalid base64: {e}")))?;
        let (client, key_arn) = self.client().await?;

        let mut request = client.decrypt().key_id(&key_arn).ciphertext_blob(Blob::new(blob));
        if let Some(user) = user_id {
            request = request.encryption_context(USER_CONTEXT_KEY, user);
        }
        let response = request.send().await.map_err(|e| classify("Decrypt", e))?;

        let plaintext = response
            .plaintext
            .map(|blob| Zeroizing::new(blob.into_inner()))
            .ok_or_else(|| KmsError::UnwrapFailed("no plaintext returned".to_string()))?;
        DataKey::try_from_slice(&plaintext)
    }

    async fn try_rotate(&self) -> Result<(), KmsError> {
        let (client, key_arn) = self.client().await?;
        client
            .enable_key_rotation()
            .key_id(&key_arn)
            .send()
            .await
            .map_err(|e| classify("EnableKeyRotation", e))?;
        Ok(())
    }
}

#[async_trait]
impl KmsProvider for AwsKmsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn initialize(&self) -> Result<(), KmsError> {
        if self.config.key_id.is_empty() {
            return Err(KmsError::Configuration("AWS KMS key id is required".to_string()));
        }

        let timeouts = TimeoutConfig::builder().operation_timeout(self.config.timeout).build();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
        if let Some(region) = &self.config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &self.config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let client = KmsClient::new(&loader.load().await);

        let key_arn = match Self::describe(&client, &self.config.key_id).await {
            Ok(arn) => arn,
            Err(KmsError::Unauthorized(msg)) => return Err(KmsError::Configuration(msg)),
            Err(err) => return Err(err),
        };

        tracing::info!(key_arn = %key_arn, "connected to AWS KMS");
        *self.connection.write().await = Some(Connection { client, key_arn });
        Ok(())
    }

    async fn health_check(&self) -> bool {
        match self.kek_metadata().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(error = %err, "AWS KMS health check failed");
                false
            }
        }
    }

    async fn generate_dek(&self) -> Result<GeneratedDek, KmsError> {
        self.generate(None).await
    }

    async fn decrypt_dek(&self, encrypted: &str) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, None).await
    }

    async fn kek_metadata(&self) -> Result<KekMetadata, KmsError> {
        let (client, key_arn) = self.client().await?;
        let arn = Self::describe(&client, &key_arn).await?;
        Ok(KekMetadata { id: arn.clone(), version: arn })
    }

    async fn rotate_key(&self) -> bool {
        match self.try_rotate().await {
            Ok(()) => {
                tracing::info!(key_id = %self.config.key_id, "enabled AWS KMS key rotation");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "AWS KMS key rotation failed");
                false
            }
        }
    }

    fn per_user_deks(&self) -> Option<&dyn PerUserDekProvider> {
        Some(self)
    }
}

#[async_trait]
impl PerUserDekProvider for AwsKmsProvider {
    fn semantics(&self) -> PerUserDekSemantics {
        PerUserDekSemantics::Randomized
    }

    async fn generate_per_user_dek(&self, user_id: &str) -> Result<GeneratedDek, KmsError> {
        self.generate(Some(user_id)).await
    }

    async fn decrypt_per_user_dek(
        &self,
        user_id: &str,
        encrypted: &str,
    ) -> Result<DataKey, KmsError> {
        self.unwrap(encrypted, Some(user_id)).await
    }
}

fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> KmsError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = format!("{operation}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) => KmsError::Timeout(detail),
        SdkError::DispatchFailure(failure) if failure.is_timeout() => KmsError::Timeout(detail),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => KmsError::Unavailable(detail),
        SdkError::ServiceError(context) => classify_service_code(context.err().code(), detail),
        _ => KmsError::Remote(detail),
    }
}

/// Maps a KMS service error code to a provider error.
fn classify_service_code(code: Option<&str>, detail: String) -> KmsError {
    match code {
        Some("NotFoundException") => KmsError::KekNotFound(detail),
        Some(
            "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException",
        ) => KmsError::Unauthorized(detail),
        Some(
            "KMSInternalException"
            | "DependencyTimeoutException"
            | "ThrottlingException"
            | "KMSInvalidStateException",
        ) => KmsError::Unavailable(detail),
        Some("InvalidCiphertextException" | "IncorrectKeyException") => {
            KmsError::UnwrapFailed(detail)
        }
        Some("DisabledException") => KmsError::KekNotFound(detail),
        _ => KmsError::Remote(detail),
    }
}
