//! Secret wrappers for upstream credentials

use std::fmt;
use std::hash::{Hash, Hasher};
use zeroize::Zeroize;

/// Number of leading characters of an API key shown in logs and reports.
pub const KEY_PREFIX_LEN: usize = 8;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Opaque upstream API key.
///
/// Identity is the raw string, but Debug/Display only ever render the
/// fixed-length prefix from [`ApiKey::prefix`]. Keys too short to have a
/// meaningful prefix render as `[REDACTED]`.
#[derive(Clone)]
pub struct ApiKey(Secret<String>);

impl ApiKey {
    /// Wrap a raw key. Surrounding whitespace is stripped.
    pub fn new(value: impl Into<String>) -> Self {
        let mut raw = value.into();
        let trimmed = raw.trim().to_owned();
        raw.zeroize();
        Self(Secret::new(trimmed))
    }

    /// Raw key for the upstream call.
    pub fn expose(&self) -> &str {
        self.0.expose()
    }

    /// Display form: the first `KEY_PREFIX_LEN` characters followed by `...`.
    pub fn prefix(&self) -> String {
        let raw = self.expose();
        if raw.chars().count() <= KEY_PREFIX_LEN {
            return "[REDACTED]".to_string();
        }
        let head: String = raw.chars().take(KEY_PREFIX_LEN).collect();
        format!("{head}...")
    }
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for ApiKey {}

impl Hash for ApiKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.expose().hash(state);
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({})", self.prefix())
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// Parse a comma- or newline-separated key list, skipping blank entries.
pub fn parse_key_list(raw: &str) -> Vec<ApiKey> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ApiKey::new)
        .collect()
}
