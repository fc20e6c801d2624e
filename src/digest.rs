// Content digests used throughout the pipelines.
//
// None of these are used for secrecy. md5 keys the token/key tables and
// bloom filters, sha1 feeds the quorum endpoints (the server expects it),
// and truncated sha256 backs the message dedup store.

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hex characters kept by [`truncated_hash`] and [`dedup_hash`].
const TRUNCATED_HEX_LEN: usize = 16;

/// Full md5 digest as lowercase hex.
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Full sha1 digest as lowercase hex. Quorum URLs travel in this form.
pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// md5 truncated to 16 hex characters. Keys the token/key telemetry
/// entries and the hashed first/third-party domains.
pub fn truncated_hash(input: &str) -> String {
    let mut digest = md5_hex(input);
    digest.truncate(TRUNCATED_HEX_LEN);
    digest
}

/// sha256 truncated to 16 hex characters. Backs the persisted dedup store.
pub fn dedup_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(TRUNCATED_HEX_LEN);
    digest
}

/// Raw md5 digest bytes, for bloom-filter position derivation.
pub fn md5_bytes(input: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}

/// Random 32-bit value for the `anti-duplicates` message field.
pub fn random32() -> u32 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn sha1_known_vector() {
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn truncated_is_prefix() {
        let full = md5_hex("example.com");
        let short = truncated_hash("example.com");
        assert_eq!(short.len(), 16);
        assert!(full.starts_with(&short));
    }

    #[test]
    fn dedup_hash_is_stable() {
        assert_eq!(dedup_hash("https://example.com/"), dedup_hash("https://example.com/"));
        assert_ne!(dedup_hash("https://example.com/"), dedup_hash("https://example.org/"));
        assert_eq!(dedup_hash("x").len(), 16);
    }
}
