//! Cache Key Canonicalization
//!
//! A cache key is built from the resource id, the request parameters in
//! canonical order, and the resource namespace's version token:
//!
//! ```text
//! product:42:v3
//! search:v7?color=red&q=blue%20shoes
//! ```
//!
//! Parameter order and duplicate keys never change the key; bumping the
//! version token produces a key no earlier entry can match.

use std::collections::BTreeMap;

/// Deterministic cache key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    resource: String,
    version: u64,
    rendered: String,
}

impl CacheKey {
    /// Build a key from a resource id, its parameters and the current version token.
    ///
    /// Parameters are sorted by name; when a name repeats, the last value wins.
    pub fn new<I, K, V>(resource: impl Into<String>, params: I, version: u64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let resource = resource.into();
        let canonical: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();

        let mut rendered = format!("{}:v{}", resource, version);
        if !canonical.is_empty() {
            let query = canonical
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            rendered.push('?');
            rendered.push_str(&query);
        }

        Self {
            resource,
            version,
            rendered,
        }
    }

    /// Key for a resource without parameters
    pub fn for_resource(resource: impl Into<String>, version: u64) -> Self {
        Self::new(resource, std::iter::empty::<(&str, &str)>(), version)
    }

    /// Resource id
    #[inline]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Version token the key was built with
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rendered key string
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_only_key() {
        let key = CacheKey::for_resource("product:42", 3);
        assert_eq!(key.as_str(), "product:42:v3");
        assert_eq!(key.resource(), "product:42");
        assert_eq!(key.version(), 3);
    }

    #[test]
    fn test_param_order_is_irrelevant() {
        let a = CacheKey::new("search", [("q", "shoes"), ("color", "red")], 1);
        let b = CacheKey::new("search", [("color", "red"), ("q", "shoes")], 1);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "search:v1?color=red&q=shoes");
    }

    #[test]
    fn test_params_are_escaped() {
        let key = CacheKey::new("search", [("q", "blue shoes&more")], 7);
        assert_eq!(key.as_str(), "search:v7?q=blue%20shoes%26more");

        // An escaped value cannot forge a second parameter
        let forged = CacheKey::new("search", [("q", "blue shoes"), ("more", "")], 7);
        assert_ne!(key, forged);
    }

    #[test]
    fn test_version_changes_key() {
        let v3 = CacheKey::for_resource("product:42", 3);
        let v4 = CacheKey::for_resource("product:42", 4);
        assert_ne!(v3, v4);
        assert_eq!(v4.to_string(), "product:42:v4");
    }

    #[test]
    fn test_repeated_param_last_wins() {
        let key = CacheKey::new("list", vec![("page", "1"), ("page", "2")], 0);
        assert_eq!(key.as_str(), "list:v0?page=2");
    }
}
