//! KV cache storage.
//!
//! - [`kv`]: per-layer key/value cache over contiguous, paged, and
//!   sliding-window layouts

pub mod kv;
