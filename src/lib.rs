//! moe-edge: offline inference engine for quantized Mixture-of-Experts
//! models.
//!
//! A model ships as a JSON manifest plus content-addressed binary shards.
//! The engine streams shards into a persistent local store (resumable,
//! hash-verified), materializes tensors on demand (F32, F16, Q4_K), and
//! runs an autoregressive decode loop through a capability-driven kernel
//! dispatcher — optionally accelerated by draft-and-verify speculative
//! decoding.
//!
//! Entry point: [`Session`]. Typical flow:
//! `Session::init` → `download` → `load` → `generate` → `unload`.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod gpu;
pub mod kernels;
pub mod manifest;
pub mod moe;
pub mod pipeline;
pub mod sampler;
pub mod session;
pub mod speculative;
pub mod store;
pub mod tensor;
pub mod tokenizer;
pub mod transport;

pub use cancel::CancelToken;
pub use config::{EngineConfig, GenerationOptions};
pub use error::{EngineError, EngineResult};
pub use pipeline::engine::GenerationEvent;
pub use session::{DownloadRequest, LoadRequest, ModelInfo, Session};
