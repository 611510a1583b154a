//! Stable content-derived identities for data items.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Stable hex identity of a data item.
///
/// The identity is a SHA-256 digest over a canonical serialization of
/// the item's identity-bearing fields. Two items with the same identity
/// are the same logical item and will be merged by the audit store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    /// Compute the identity of an item from its tag and identity fields.
    ///
    /// The canonical form is `kind "\n" subtype "\n"` followed by one
    /// `key "=" value "\n"` line per field in key order. Field order in
    /// the input map therefore never affects the digest.
    pub fn compute(kind: &str, subtype: &str, fields: &BTreeMap<String, String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b"\n");
        hasher.update(subtype.as_bytes());
        hasher.update(b"\n");
        for (key, value) in fields {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        Identity(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already-computed hex digest.
    ///
    /// Used when identities cross the wire as plain strings (ACK
    /// payloads, RPC arguments).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Identity(hex.into())
    }

    /// The hex digest as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form for display; the full digest is available via as_str.
        write!(f, "{}", &self.0[..self.0.len().min(16)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identity_is_deterministic() {
        let a = Identity::compute("resource", "url", &fields(&[("url", "http://example.com/")]));
        let b = Identity::compute("resource", "url", &fields(&[("url", "http://example.com/")]));
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_field_order_is_irrelevant() {
        let a = Identity::compute(
            "information",
            "http_request",
            &fields(&[("method", "GET"), ("url", "http://example.com/")]),
        );
        let b = Identity::compute(
            "information",
            "http_request",
            &fields(&[("url", "http://example.com/"), ("method", "GET")]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_identity_discriminates_on_tag() {
        let f = fields(&[("name", "example.com")]);
        let a = Identity::compute("resource", "domain", &f);
        let b = Identity::compute("resource", "url", &f);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_is_hex_sha256() {
        let id = Identity::compute("resource", "domain", &fields(&[("name", "example.com")]));
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_display_is_shortened() {
        let id = Identity::compute("resource", "domain", &fields(&[("name", "example.com")]));
        assert_eq!(format!("{}", id).len(), 16);
    }
}
