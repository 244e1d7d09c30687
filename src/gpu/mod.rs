//! Device capabilities and buffer management.
//!
//! - [`device`]: compute device probe and capability record
//! - [`buffer`]: pooled buffers with leak accounting

pub mod buffer;
pub mod device;
