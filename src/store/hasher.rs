//! Content hash negotiation.
//!
//! Shards are content-addressed by a 256-bit digest. The manifest may pin
//! the algorithm; blake3 is the default, sha-256 the fallback. An algorithm
//! the runtime cannot provide is a fatal [`EngineError::AlgorithmUnavailable`].

use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Supported 256-bit content hash algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    /// Negotiate from a manifest tag. `None` selects the default (blake3).
    pub fn negotiate(tag: Option<&str>) -> EngineResult<Self> {
        match tag {
            None => Ok(HashAlgorithm::Blake3),
            Some(name) => match name.to_ascii_lowercase().as_str() {
                "blake3" => Ok(HashAlgorithm::Blake3),
                "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
                other => Err(EngineError::AlgorithmUnavailable(other.to_string())),
            },
        }
    }

    /// Hash `data` and return the lowercase hex digest (64 chars).
    pub fn digest_hex(&self, data: &[u8]) -> String {
        match self {
            HashAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
            HashAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                hex_encode(&hasher.finalize())
            }
        }
    }

    /// Hash a large buffer off the async executor.
    pub async fn digest_hex_blocking(&self, data: bytes::Bytes) -> String {
        let algo = *self;
        tokio::task::spawn_blocking(move || algo.digest_hex(&data))
            .await
            .expect("hash task panicked")
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HashAlgorithm::Blake3 => write!(f, "blake3"),
            HashAlgorithm::Sha256 => write!(f, "sha256"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        write!(out, "{b:02x}").expect("writing to String cannot fail");
    }
    out
}

/// Whether `hash` is a plausible 256-bit hex digest.
pub fn is_valid_digest(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(
            HashAlgorithm::negotiate(None).unwrap(),
            HashAlgorithm::Blake3
        );
        assert_eq!(
            HashAlgorithm::negotiate(Some("SHA-256")).unwrap(),
            HashAlgorithm::Sha256
        );
        assert!(matches!(
            HashAlgorithm::negotiate(Some("md5")),
            Err(EngineError::AlgorithmUnavailable(_))
        ));
    }

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            HashAlgorithm::Sha256.digest_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_blake3_digest_shape() {
        let hex = HashAlgorithm::Blake3.digest_hex(b"shard");
        assert!(is_valid_digest(&hex));
    }

    #[test]
    fn test_digest_validation() {
        assert!(is_valid_digest(&"a".repeat(64)));
        assert!(!is_valid_digest(&"a".repeat(63)));
        assert!(!is_valid_digest(&"g".repeat(64)));
    }
}
