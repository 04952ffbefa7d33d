//! Hashing utilities for minisvc
//!
//! - BLAKE3 for content fingerprints (checksums, etags)
//! - Strong entity-tag helpers for conditional bundle fetches

use blake3::Hasher;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Quote a fingerprint for use as a strong `ETag`
pub fn quote_etag(fingerprint: &str) -> String {
    format!("\"{}\"", fingerprint)
}

/// Compare a request validator against a fingerprint.
///
/// Accepts quoted or bare values and `*`. Weak validators (`W/"..."`) never
/// match since the bundle ETag is strong.
pub fn etag_matches(validator: &str, fingerprint: &str) -> bool {
    validator.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        if candidate.starts_with("W/") {
            return false;
        }
        candidate.trim_matches('"') == fingerprint
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let data = b"hello world";
        let hash = blake3_hash(data);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Blake3Hasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), blake3_hash(b"hello world"));
    }

    #[test]
    fn test_etag_matches() {
        assert!(etag_matches("\"abc\"", "abc"));
        assert!(etag_matches("abc", "abc"));
        assert!(etag_matches("\"x\", \"abc\"", "abc"));
        assert!(etag_matches("*", "abc"));
        assert!(!etag_matches("W/\"abc\"", "abc"));
        assert!(!etag_matches("\"abd\"", "abc"));
        assert_eq!(quote_etag("abc"), "\"abc\"");
    }
}
