//! Tensor representation and loading.
//!
//! - [`dtype`]: element types, f16 bit conversion, Q4_K block geometry
//! - [`alias`]: logical tensor name normalization
//! - [`loader`]: shard bytes → materialized tensors, lazy expert hydration

pub mod alias;
pub mod dtype;
pub mod loader;
