//! Call metadata: string key/value pairs that travel with a request.
//!
//! Keys are case-insensitive on the wire (HTTP headers), so they are stored
//! lower-cased. Iteration order is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header prefix marking metadata that is propagated between services.
pub const METADATA_PREFIX: &str = "x-md-";

/// Correlation header set on every HTTP request and forwarded on RPC calls.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Lower-cased string map attached to a call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pair, lower-casing the key. Returns the previous value.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into())
    }

    /// Case-insensitive lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&key.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose key starts with any of `prefixes`.
    pub fn with_prefixes<'a>(
        &'a self,
        prefixes: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.iter()
            .filter(move |(k, _)| prefixes.iter().any(|p| k.starts_with(p.as_str())))
    }

    /// Copies every entry of `other` into `self`, overwriting existing keys.
    pub fn extend_from(&mut self, other: &Metadata) {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut md = Self::new();
        for (k, v) in iter {
            md.insert(k, v);
        }
        md
    }
}

impl From<Metadata> for BTreeMap<String, String> {
    fn from(md: Metadata) -> Self {
        md.0
    }
}
