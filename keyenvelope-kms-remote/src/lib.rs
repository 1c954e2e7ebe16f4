//! REST-based key providers for `keyenvelope`.
//!
//! - [`gcp::GcpKmsProvider`]: Google Cloud KMS (`gcp` feature)
//! - [`azure::AzureKmsProvider`]: Azure Key Vault (`azure` feature)
//! - [`vault::VaultKmsProvider`]: HashiCorp Vault Transit (`vault` feature)
//!
//! All adapters share one HTTP client per provider with a bounded request
//! timeout, a lazily refreshed [`token::TokenCache`], and the same mapping
//! of failures onto [`KmsError`](keyenvelope::error::KmsError): timeouts and
//! connection or 5xx failures are retryable, 401/403 are authorization
//! failures, 404 means the KEK does not exist.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod http;
pub mod token;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcp")]
pub mod gcp;
#[cfg(feature = "vault")]
pub mod vault;

#[cfg(test)]
mod test_server;
