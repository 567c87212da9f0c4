use sha2::{Digest, Sha256};
use std::fmt;

const SEPARATOR: char = ':';
const ESCAPE: char = '\\';

/// Deterministic cache key: `operation:param1:param2...`.
///
/// Separators and escapes inside components are escaped, so distinct
/// (operation, params) tuples never render to the same string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(operation: &str) -> Self {
        let mut key = String::with_capacity(operation.len() + 16);
        push_escaped(&mut key, operation);
        Self(key)
    }

    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.0.push(SEPARATOR);
        push_escaped(&mut self.0, &value.to_string());
        self
    }

    /// `operation:<sha256 hex of text>`, for free text too long to embed (LLM prompts).
    pub fn digest(operation: &str, text: &str) -> Self {
        let hash = Sha256::digest(text.as_bytes());
        Self::new(operation).param(hex::encode(hash))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn push_escaped(out: &mut String, component: &str) {
    for c in component.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}
