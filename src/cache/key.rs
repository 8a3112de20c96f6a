//! Cache keys identifying one cacheable computation.

use std::fmt;

/// Key for one logical resource in the prefetch cache: the resource name
/// plus any query parameters that shape the result, rendered into a single
/// string (`livestock?herd=12&page=2`).
///
/// Two call sites that build the same resource with the same parameters in
/// the same order share an entry; equality and hashing are on the rendered
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for a parameterless resource.
    pub fn new(resource: impl Into<String>) -> Self {
        Self(resource.into())
    }

    /// Key for a resource qualified by query parameters, rendered in the
    /// order given.
    pub fn with_params<K, V>(resource: &str, params: &[(K, V)]) -> Self
    where
        K: fmt::Display,
        V: fmt::Display,
    {
        if params.is_empty() {
            return Self(resource.to_string());
        }

        let mut rendered = String::from(resource);
        for (i, (name, value)) in params.iter().enumerate() {
            rendered.push(if i == 0 { '?' } else { '&' });
            rendered.push_str(&format!("{}={}", name, value));
        }
        Self(rendered)
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

impl From<&str> for CacheKey {
    fn from(resource: &str) -> Self {
        Self::new(resource)
    }
}

impl From<String> for CacheKey {
    fn from(resource: String) -> Self {
        Self::new(resource)
    }
}
