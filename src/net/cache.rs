//! Shared network response cache.
//!
//! Plugins store raw responses keyed by a digest of
//! `method | url | body`, namespaced per audit and per scheme. The
//! cache is read-mostly; writers are safe per key. Each audit's
//! entries are dropped when the audit closes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Reader/writer override for cache behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Honor the default cacheability of the response.
    Auto,
    /// Use/store the cache regardless of cacheability.
    Force,
    /// Bypass the cache entirely.
    Skip,
}

/// A cached raw response and the time the original fetch took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    /// Raw response bytes, exactly as received.
    pub body: Vec<u8>,
    /// Wall-clock seconds the original request took.
    pub elapsed: f64,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct Namespace {
    audit: String,
    scheme: String,
}

/// Response cache shared across plugins and audits.
#[derive(Default)]
pub struct NetworkCache {
    entries: RwLock<HashMap<Namespace, HashMap<String, CachedResponse>>>,
}

impl NetworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the cache key for a request.
    pub fn request_key(method: &str, url: &str, body: Option<&[u8]>) -> String {
        super::cache_digest(&[method.as_bytes(), url.as_bytes(), body.unwrap_or_default()])
    }

    /// Look up a cached response. `CachePolicy::Skip` always misses.
    pub fn get(
        &self,
        audit: &str,
        scheme: &str,
        key: &str,
        policy: CachePolicy,
    ) -> Option<CachedResponse> {
        if policy == CachePolicy::Skip {
            return None;
        }
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&Namespace {
                audit: audit.to_string(),
                scheme: scheme.to_string(),
            })
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    /// Store a response. `cacheable` is the default judgement of the
    /// writer; `Force` stores regardless, `Skip` never stores.
    pub fn set(
        &self,
        audit: &str,
        scheme: &str,
        key: &str,
        response: CachedResponse,
        cacheable: bool,
        policy: CachePolicy,
    ) {
        let store = match policy {
            CachePolicy::Force => true,
            CachePolicy::Skip => false,
            CachePolicy::Auto => cacheable,
        };
        if !store {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(Namespace {
                audit: audit.to_string(),
                scheme: scheme.to_string(),
            })
            .or_default()
            .insert(key.to_string(), response);
    }

    /// Drop every entry belonging to an audit.
    pub fn clear_audit(&self, audit: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|ns, _| ns.audit != audit);
    }

    /// Number of entries cached for an audit, across schemes.
    pub fn len_for_audit(&self, audit: &str) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(ns, _)| ns.audit == audit)
            .map(|(_, ns)| ns.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn response(body: &[u8]) -> CachedResponse {
        CachedResponse {
            body: body.to_vec(),
            elapsed: 0.25,
        }
    }

    #[test]
    fn test_roundtrip() {
        let cache = NetworkCache::new();
        let key = NetworkCache::request_key("GET", "http://example.com/", None);
        cache.set(
            "audit-1",
            "http",
            &key,
            response(b"hello"),
            true,
            CachePolicy::Auto,
        );

        let hit = cache.get("audit-1", "http", &key, CachePolicy::Auto).unwrap();
        assert_eq!(hit.body, b"hello");
    }

    #[test]
    fn test_namespaces_isolate() {
        let cache = NetworkCache::new();
        let key = NetworkCache::request_key("GET", "http://example.com/", None);
        cache.set(
            "audit-1",
            "http",
            &key,
            response(b"hello"),
            true,
            CachePolicy::Auto,
        );

        assert!(cache.get("audit-2", "http", &key, CachePolicy::Auto).is_none());
        assert!(cache.get("audit-1", "https", &key, CachePolicy::Auto).is_none());
    }

    #[test]
    fn test_skip_policy_bypasses() {
        let cache = NetworkCache::new();
        let key = NetworkCache::request_key("GET", "http://example.com/", None);
        cache.set(
            "audit-1",
            "http",
            &key,
            response(b"hello"),
            true,
            CachePolicy::Auto,
        );
        assert!(cache.get("audit-1", "http", &key, CachePolicy::Skip).is_none());

        cache.set(
            "audit-1",
            "http",
            "other",
            response(b"x"),
            true,
            CachePolicy::Skip,
        );
        assert!(cache.get("audit-1", "http", "other", CachePolicy::Auto).is_none());
    }

    #[test]
    fn test_force_policy_overrides_cacheability() {
        let cache = NetworkCache::new();
        cache.set(
            "audit-1",
            "http",
            "k",
            response(b"x"),
            false,
            CachePolicy::Auto,
        );
        assert!(cache.get("audit-1", "http", "k", CachePolicy::Auto).is_none());

        cache.set(
            "audit-1",
            "http",
            "k",
            response(b"x"),
            false,
            CachePolicy::Force,
        );
        assert!(cache.get("audit-1", "http", "k", CachePolicy::Auto).is_some());
    }

    #[test]
    fn test_clear_audit() {
        let cache = NetworkCache::new();
        cache.set("a", "http", "k", response(b"x"), true, CachePolicy::Auto);
        cache.set("b", "http", "k", response(b"y"), true, CachePolicy::Auto);

        cache.clear_audit("a");
        assert_eq!(cache.len_for_audit("a"), 0);
        assert_eq!(cache.len_for_audit("b"), 1);
    }

    proptest! {
        #[test]
        fn prop_cache_roundtrips_byte_for_byte(body in proptest::collection::vec(any::<u8>(), 0..512)) {
            let cache = NetworkCache::new();
            let key = NetworkCache::request_key("POST", "http://example.com/submit", Some(&body));
            cache.set(
                "audit",
                "http",
                &key,
                CachedResponse { body: body.clone(), elapsed: 1.0 },
                true,
                CachePolicy::Auto,
            );
            let hit = cache.get("audit", "http", &key, CachePolicy::Auto).unwrap();
            prop_assert_eq!(hit.body, body);
        }
    }
}
