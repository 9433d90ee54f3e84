//! Content hashing for idempotency keys and cache keys
//!
//! Hashes are computed over the canonical JSON form of a value. Record
//! fields live in `BTreeMap`s and `serde_json` objects are sorted maps, so
//! equal content always serializes to equal bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    /// Used for idempotency content hashes (durable, collision resistant)
    Sha256,
    /// Used for cache keys (fast, recomputed on every lookup)
    Blake3,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

/// Hex digest of raw bytes
pub fn hash_bytes(data: &[u8], algorithm: ChecksumAlgorithm) -> String {
    match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hex::encode(hasher.finalize())
        },
        ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
    }
}

/// Canonical serialized bytes of a value
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// SHA-256 of the canonical serialization, used as an idempotency content hash
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(hash_bytes(&canonical_bytes(value)?, ChecksumAlgorithm::Sha256))
}

/// BLAKE3 of the canonical serialization, used for cache key halves
pub fn fast_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(hash_bytes(&canonical_bytes(value)?, ChecksumAlgorithm::Blake3))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{DataRecord, Value};

    #[test]
    fn test_hash_bytes_sha256() {
        assert_eq!(
            hash_bytes(b"hello world", ChecksumAlgorithm::Sha256),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_content_hash_ignores_insertion_order() {
        let a = DataRecord::new("1").with_field("x", 1i64).with_field("y", "b");
        let b = DataRecord::new("1").with_field("y", "b").with_field("x", 1i64);
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn test_content_hash_detects_changes() {
        let a = DataRecord::new("1").with_field("x", Value::from("bob"));
        let b = DataRecord::new("1").with_field("x", Value::from("Bob"));
        assert_ne!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
        assert_ne!(fast_hash(&a).unwrap(), fast_hash(&b).unwrap());
    }
}
