//! HTTP plumbing shared by the REST adapters: client construction and
//! mapping of transport failures and status codes onto [`KmsError`].

use std::time::Duration;

use keyenvelope::error::KmsError;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body excerpt carried in an error message.
const MAX_ERROR_BODY: usize = 256;

/// Builds a client whose every request is bounded by `timeout`.
///
/// # Errors
///
/// Returns `KmsError::Configuration` if the TLS backend cannot be set up.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, KmsError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| KmsError::Configuration(format!("failed to create HTTP client: {e}")))
}

/// Classifies a transport-level failure.
pub fn classify_send_error(operation: &str, err: &reqwest::Error) -> KmsError {
    let detail = format!("{operation}: {err}");
    if err.is_timeout() {
        KmsError::Timeout(detail)
    } else if err.is_connect() || err.is_request() {
        KmsError::Unavailable(detail)
    } else if err.is_decode() {
        KmsError::Remote(detail)
    } else {
        KmsError::Unavailable(detail)
    }
}

/// Classifies a non-success HTTP status.
pub fn classify_status(operation: &str, status: StatusCode, body: &str) -> KmsError {
    let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
    let detail = format!("{operation}: HTTP {status}: {excerpt}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KmsError::Unauthorized(detail),
        StatusCode::NOT_FOUND => KmsError::KekNotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => KmsError::Timeout(detail),
        StatusCode::TOO_MANY_REQUESTS => KmsError::Unavailable(detail),
        s if s.is_server_error() => KmsError::Unavailable(detail),
        _ => KmsError::Remote(detail),
    }
}

/// Sends a request and returns the response if its status is a success.
///
/// # Errors
///
/// Returns the classified transport or status failure.
pub async fn send(operation: &str, request: reqwest::RequestBuilder) -> Result<Response, KmsError> {
    let response = request.send().await.map_err(|e| classify_send_error(operation, &e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(operation, status, &body))
}

/// Sends a request and decodes a JSON success body.
///
/// # Errors
///
/// Returns the classified failure, or `KmsError::Remote` for an
/// unparseable body.
pub async fn send_json<T: DeserializeOwned>(
    operation: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, KmsError> {
    let response = send(operation, request).await?;
    decode_json(operation, response).await
}

/// Decodes a JSON success body.
///
/// # Errors
///
/// Returns `KmsError::Timeout` if reading the body times out, otherwise
/// `KmsError::Remote` for an unparseable body.
pub async fn decode_json<T: DeserializeOwned>(
    operation: &str,
    response: Response,
) -> Result<T, KmsError> {
    response.json::<T>().await.map_err(|e| {
        if e.is_timeout() {
            KmsError::Timeout(format!("{operation}: {e}"))
        } else {
            KmsError::Remote(format!("{operation}: failed to parse response: {e}"))
        }
    })
}

/// Joins a base URL and a path without doubling slashes.
pub fn join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
