//! Error taxonomy for the engine.
//!
//! Every public operation returns [`EngineResult`]. Transient failures
//! (shard fetch, hash verify) are retried internally; everything that
//! reaches the caller is one of these variants.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No usable compute device could be obtained.
    #[error("no compute device available: {0}")]
    DeviceUnavailable(String),

    /// Persistent storage could not be opened.
    #[error("persistent store unavailable at {path}: {reason}")]
    StoreUnavailable { path: String, reason: String },

    /// A pending write would exceed the configured storage quota.
    #[error("quota exceeded: write of {requested} bytes, {available} bytes available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// A shard, manifest, or tensor is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Shard content hash did not match the manifest.
    #[error("integrity failure for shard {shard}: expected {expected}, computed {computed}")]
    IntegrityFailure {
        shard: u32,
        expected: String,
        computed: String,
    },

    /// The manifest violates its schema. Carries every reason found.
    #[error("invalid manifest: {}", reasons.join("; "))]
    ManifestInvalid { reasons: Vec<String> },

    /// The manifest pins a hash algorithm the runtime cannot provide.
    #[error("hash algorithm {0:?} not available")]
    AlgorithmUnavailable(String),

    /// No kernel variant satisfies the device capabilities.
    #[error("no usable kernel variant for {op} on this device")]
    KernelUnavailable { op: String },

    /// An update would place KV entries past the cache capacity.
    #[error("kv cache overflow: position {position} + {count} new tokens exceeds max {max_seq_len}")]
    CacheOverflow {
        position: usize,
        count: usize,
        max_seq_len: usize,
    },

    /// A second generation was started while one is in flight.
    #[error("a generation is already in progress")]
    GenerationInProgress,

    /// Cooperative cancellation was delivered.
    #[error("operation cancelled")]
    Cancelled,

    /// Transport failed after exhausting retries.
    #[error("transport failure after {attempts} attempts: {reason}")]
    TransportFailure { attempts: u32, reason: String },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON (manifest or persisted state).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Build a `ManifestInvalid` from a single reason.
    pub fn manifest(reason: impl Into<String>) -> Self {
        EngineError::ManifestInvalid {
            reasons: vec![reason.into()],
        }
    }

    /// Whether this error is worth a local retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransportFailure { .. } | EngineError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_reasons_joined() {
        let err = EngineError::ManifestInvalid {
            reasons: vec!["totalSize mismatch".into(), "missing vocabSize".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("totalSize mismatch"));
        assert!(msg.contains("missing vocabSize"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::TransportFailure {
            attempts: 3,
            reason: "timeout".into()
        }
        .is_transient());
        assert!(!EngineError::GenerationInProgress.is_transient());
    }
}
