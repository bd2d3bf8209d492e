//! Hashing utilities for ProofPay

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::stable_stringify;

/// Prefix carried by every mandate payload hash
pub const HASH_PREFIX: &str = "sha256:";

/// Compute SHA-256 hash of data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Hash several items in sequence, returned as hex
pub fn hash_all_hex(items: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item);
    }
    hex::encode(hasher.finalize())
}

/// `sha256:` + hex(SHA-256(stable_stringify(payload)))
pub fn mandate_payload_hash(payload: &Value) -> String {
    format!(
        "{HASH_PREFIX}{}",
        sha256_hex(stable_stringify(payload).as_bytes())
    )
}

/// Case-insensitive comparison of two prefixed hashes
pub fn hashes_match(a: &str, b: &str) -> bool {
    let a = a.trim();
    let b = b.trim();
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_hash_format() {
        let hash = mandate_payload_hash(&json!({"type": "ap2.intent"}));
        assert!(hash.starts_with(HASH_PREFIX));
        assert_eq!(hash.len(), HASH_PREFIX.len() + 64);
    }

    #[test]
    fn test_payload_hash_ignores_insertion_order() {
        let a: Value = serde_json::from_str(r#"{"id":"i1","exp":2,"iat":1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"iat":1,"id":"i1","exp":2}"#).unwrap();
        assert_eq!(mandate_payload_hash(&a), mandate_payload_hash(&b));
    }

    #[test]
    fn test_hash_all_matches_concatenation() {
        assert_eq!(hash_all_hex(&[b"ab", b"c"]), sha256_hex(b"abc"));
    }
}
