//! Cached bearer tokens with explicit expiry.

use std::future::Future;
use std::time::{Duration, Instant};

use keyenvelope::error::KmsError;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

/// Tokens are refreshed this long before they expire.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// A bearer token and the instant it stops being valid.
pub struct AccessToken {
    value: SecretString,
    expires_at: Instant,
}

impl AccessToken {
    /// Creates a token valid for `ttl` from now.
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self { value: SecretString::new(value.into()), expires_at: Instant::now() + ttl }
    }

    /// Creates a token that never expires, e.g. a static Vault token.
    pub fn non_expiring(value: SecretString) -> Self {
        // ~30 years; Instant has no MAX.
        let far_future = Duration::from_secs(60 * 60 * 24 * 365 * 30);
        Self { value, expires_at: Instant::now() + far_future }
    }

    /// Returns `true` if the token expires within `skew`.
    #[must_use]
    pub fn expires_within(&self, skew: Duration) -> bool {
        Instant::now() + skew >= self.expires_at
    }

    fn share(&self) -> SecretString {
        SecretString::new(self.value.expose_secret().clone())
    }
}

/// Holds at most one token and refreshes it lazily.
///
/// Concurrent callers that find the token stale wait for a single refresh.
pub struct TokenCache {
    current: Mutex<Option<AccessToken>>,
    skew: Duration,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_SKEW)
    }
}

impl TokenCache {
    /// Creates an empty cache refreshing `skew` before expiry.
    #[must_use]
    pub fn new(skew: Duration) -> Self {
        Self { current: Mutex::new(None), skew }
    }

    /// Returns the cached token, calling `refresh` first if it is missing
    /// or about to expire.
    ///
    /// # Errors
    ///
    /// Propagates the refresh failure; the stale token is discarded.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<SecretString, KmsError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<AccessToken, KmsError>> + Send,
    {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if !token.expires_within(self.skew) {
                return Ok(token.share());
            }
        }

        *current = None;
        let token = refresh().await?;
        let value = token.share();
        *current = Some(token);
        Ok(value)
    }

    /// Drops the cached token so the next call refreshes.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
