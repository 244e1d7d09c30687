//! Compute kernels and dispatch.
//!
//! - [`cpu`]: host reference implementations of every operation
//! - [`dispatcher`]: capability-driven variant selection and pipeline cache

pub mod cpu;
pub mod dispatcher;

use serde::{Deserialize, Serialize};

/// Operations the dispatcher knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    MatMul,
    DequantQ4K,
    Attention,
    RmsNorm,
    Rope,
    SiluGated,
    Softmax,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Op::MatMul => "matmul",
            Op::DequantQ4K => "dequant-q4k",
            Op::Attention => "attention",
            Op::RmsNorm => "rmsnorm",
            Op::Rope => "rope",
            Op::SiluGated => "silu-gated",
            Op::Softmax => "softmax",
        };
        write!(f, "{name}")
    }
}

/// Kernel variants, selected per operation by device capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    /// f16 arithmetic, 4-wide element processing.
    F16Vec4,
    /// f16 arithmetic.
    F16,
    /// Plain f32.
    F32,
    /// Subgroup broadcast, 4 blocks per group.
    SubgroupVec4,
    /// Subgroup broadcast.
    Subgroup,
    /// Workgroup shared memory, 4 blocks per group.
    SharedVec4,
    /// Workgroup shared memory.
    Shared,
    /// The only variant of single-variant ops.
    Standard,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Variant::F16Vec4 => "f16_vec4",
            Variant::F16 => "f16",
            Variant::F32 => "f32",
            Variant::SubgroupVec4 => "subgroup_vec4",
            Variant::Subgroup => "subgroup",
            Variant::SharedVec4 => "shared_vec4",
            Variant::Shared => "shared",
            Variant::Standard => "standard",
        };
        write!(f, "{name}")
    }
}
