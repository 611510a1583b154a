//! Network pacing primitives shared by every plugin: per-host
//! connection slots and the response cache.
//!
//! The core never performs network I/O itself; plugins bring their own
//! clients and cooperate through these two structures.

mod cache;
mod slots;

pub use cache::{CachePolicy, CachedResponse, NetworkCache};
pub use slots::{ConnectionSlot, SlotManager};

use sha2::{Digest, Sha256};

/// Hex SHA-256 over the given byte slices, separated by `|`.
///
/// Used for network cache keys (`method | url | body`) and response
/// body digests.
pub fn cache_digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_digest_is_deterministic() {
        let a = cache_digest(&[b"GET", b"http://example.com/", b""]);
        let b = cache_digest(&[b"GET", b"http://example.com/", b""]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_digest_separates_parts() {
        let joined = cache_digest(&[b"GEThttp://x/"]);
        let split = cache_digest(&[b"GET", b"http://x/"]);
        assert_ne!(joined, split);
    }
}
