//! Persistent model storage.
//!
//! - [`hasher`]: content hash negotiation (blake3 / sha-256)
//! - [`shard_store`]: chunk-aligned shard blob store with verified reads
//! - [`download`]: resumable shard download with bounded concurrency

pub mod download;
pub mod hasher;
pub mod shard_store;
