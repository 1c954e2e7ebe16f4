//! Context labels for per-user key derivation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Non-secret labels that separate keys derived for the same user.
///
/// Two contexts are equal when they carry the same labels, regardless of
/// insertion order. The canonical form sorts labels by name:
/// `purpose=encryption;scope=messages`.
///
/// # Example
///
/// ```
/// use keyenvelope::context::DerivationContext;
///
/// let ctx = DerivationContext::new()
///     .with("purpose", "encryption")
///     .with("scope", "messages");
///
/// assert_eq!(ctx.to_string(), "purpose=encryption;scope=messages");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DerivationContext {
    labels: BTreeMap<String, String>,
}

impl DerivationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a context carrying only a `purpose` label.
    #[must_use]
    pub fn purpose(purpose: impl Into<String>) -> Self {
        Self::new().with("purpose", purpose)
    }

    /// Adds or replaces a label.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    /// Returns a label value, if set.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Returns `true` if no labels are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterates over labels in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for DerivationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.labels.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

impl<K, V> FromIterator<(K, V)> for DerivationContext
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self { labels: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }
}
