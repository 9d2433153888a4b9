//! Content digests used for change detection and stable local file names.

use std::sync::Arc;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::config::DigestAlgorithm;
use crate::error::HashError;

/// Deterministic digest over raw bytes, rendered as lowercase hex.
pub trait ContentHasher: Send + Sync {
    /// Digest `content`. Identical bytes always produce identical output.
    fn digest(&self, content: &[u8]) -> Result<String, HashError>;

    /// Algorithm implemented by this hasher.
    fn algorithm(&self) -> DigestAlgorithm;

    /// Verify the engine works before any hash-dependent step runs.
    fn self_test(&self) -> Result<(), HashError> {
        self.digest(b"").map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl ContentHasher for Md5Hasher {
    fn digest(&self, content: &[u8]) -> Result<String, HashError> {
        Ok(hex::encode(Md5::digest(content)))
    }

    fn algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Md5
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest(&self, content: &[u8]) -> Result<String, HashError> {
        Ok(hex::encode(Sha256::digest(content)))
    }

    fn algorithm(&self) -> DigestAlgorithm {
        DigestAlgorithm::Sha256
    }
}

/// Build the hasher selected by configuration.
pub fn hasher_for(algorithm: DigestAlgorithm) -> Arc<dyn ContentHasher> {
    match algorithm {
        DigestAlgorithm::Md5 => Arc::new(Md5Hasher),
        DigestAlgorithm::Sha256 => Arc::new(Sha256Hasher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_matches_known_vectors() {
        let hasher = Md5Hasher;
        assert_eq!(hasher.digest(b"").unwrap(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            hasher.digest(b"hello world").unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn sha256_is_stable_and_lowercase() {
        let hasher = hasher_for(DigestAlgorithm::Sha256);
        let first = hasher.digest(b"bundle").unwrap();
        assert_eq!(first, hasher.digest(b"bundle").unwrap());
        assert_eq!(first.len(), 64);
        assert_eq!(first, first.to_ascii_lowercase());
        assert!(hasher.self_test().is_ok());
    }
}
