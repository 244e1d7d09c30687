//! Runtime configuration for the engine.
//!
//! Everything tunable lives here: storage paths and quota, KV cache layout
//! thresholds, download behavior, and the per-request generation options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for persistent state (models, download state).
    pub storage_root: PathBuf,

    /// Storage quota in bytes. Writes that would exceed it fail early.
    /// `None` disables the pre-check.
    pub quota_bytes: Option<u64>,

    /// KV cache tuning.
    pub cache: CacheConfig,

    /// Download behavior.
    pub download: DownloadConfig,

    /// Treat a missing weight tensor as a hard error instead of
    /// substituting zeros.
    pub strict_weights: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(".moe-edge"),
            quota_bytes: None,
            cache: CacheConfig::default(),
            download: DownloadConfig::default(),
            strict_weights: false,
        }
    }
}

/// KV cache layout selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Sequences up to this length use the contiguous layout; longer ones
    /// switch to the paged layout.
    pub contiguous_threshold: usize,

    /// Tokens per page in the paged layout.
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            contiguous_threshold: 4096,
            page_size: 256,
        }
    }
}

/// Shard download behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Shards fetched in parallel.
    pub concurrency: usize,

    /// Retry attempts per shard before the download fails.
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds; doubles per attempt.
    pub backoff_base_ms: u64,

    /// Backoff delay ceiling in milliseconds.
    pub backoff_cap_ms: u64,

    /// Minimum interval between speed samples reported to the progress
    /// callback, in milliseconds.
    pub speed_sample_interval_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_cap_ms: 8_000,
            speed_sample_interval_ms: 1_000,
        }
    }
}

/// Per-request generation options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Softmax temperature. Values at or below
    /// [`GenerationOptions::GREEDY_EPSILON`] collapse to argmax.
    pub temperature: f32,

    /// Nucleus sampling threshold.
    pub top_p: f32,

    /// Keep only the k most likely tokens before nucleus filtering.
    /// 0 disables the filter.
    pub top_k: usize,

    /// Repetition penalty applied against recently generated tokens.
    pub repetition_penalty: f32,

    /// Number of trailing generated tokens the penalty looks at.
    pub repetition_window: usize,

    /// Generation stops when the detokenized suffix ends with any of these.
    pub stop_sequences: Vec<String>,

    /// Drive generation through the speculative decoder when a draft
    /// model is loaded.
    pub use_speculative: bool,

    /// RNG seed for reproducible sampling. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl GenerationOptions {
    /// Temperatures at or below this behave as greedy argmax.
    pub const GREEDY_EPSILON: f32 = 1e-5;
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            repetition_window: 100,
            stop_sequences: Vec::new(),
            use_speculative: false,
            seed: None,
        }
    }
}
