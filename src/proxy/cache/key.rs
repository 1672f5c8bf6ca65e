use std::fmt;

use anyhow::{Context, Result, bail};
use regex::Regex;

/// Name of the capture group that carries the blob digest in a path pattern.
pub const KEY_GROUP: &str = "key";

/// Matches the blob download path Docker Hub redirects layer pulls to.
pub const DEFAULT_BLOB_PATH_PATTERN: &str =
    r"/registry-v2/docker/registry/v2/blobs/sha256/../(?P<key>[^/]+)/";

/// Content hash identifying one cached blob. Doubles as the blob's file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Accepts only values that are safe to use as a flat file name.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty()
            || value.starts_with('.')
            || value.contains(['/', '\\', '\0'])
        {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides whether a request path names a cacheable blob.
pub trait KeyClassifier: Send + Sync {
    fn classify(&self, path: &str) -> Option<CacheKey>;
}

#[derive(Debug, Clone)]
pub struct PathPatternClassifier {
    pattern: Regex,
}

impl PathPatternClassifier {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("invalid blob path pattern '{pattern}'"))?;
        if !pattern
            .capture_names()
            .any(|name| name == Some(KEY_GROUP))
        {
            bail!("blob path pattern must define a named capture group '{KEY_GROUP}'");
        }
        Ok(Self { pattern })
    }
}

impl Default for PathPatternClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_BLOB_PATH_PATTERN).expect("default blob path pattern is valid")
    }
}

impl KeyClassifier for PathPatternClassifier {
    fn classify(&self, path: &str) -> Option<CacheKey> {
        let captures = self.pattern.captures(path)?;
        let key = captures.name(KEY_GROUP)?;
        CacheKey::parse(key.as_str())
    }
}
