//! Capability-driven kernel dispatch.
//!
//! Each operation has an ordered list of variants; the first one the device
//! capabilities satisfy wins. A (op, variant) pair is compiled into a
//! pipeline on first use and cached for the session. Callers pass raw
//! buffers; shapes follow the contracts documented per method.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::gpu::buffer::{BufferPool, PooledBuffer};
use crate::gpu::device::DeviceCaps;
use crate::kernels::cpu::{self, AttentionShape, RopeTable};
use crate::kernels::{Op, Variant};
use crate::tensor::dtype::Q4K_BLOCK_BYTES;

/// A compiled pipeline for one (op, variant) pair.
#[derive(Debug)]
pub struct Pipeline {
    pub op: Op,
    pub variant: Variant,
    pub compiled_at: Instant,
}

/// Features a variant needs from the device.
#[derive(Debug, Clone, Copy, Default)]
struct Requirements {
    fp16: bool,
    subgroups: bool,
}

impl Requirements {
    fn satisfied_by(&self, caps: &DeviceCaps) -> bool {
        (!self.fp16 || caps.fp16) && (!self.subgroups || caps.subgroups)
    }
}

fn requirements(variant: Variant) -> Requirements {
    match variant {
        Variant::F16Vec4 | Variant::F16 => Requirements {
            fp16: true,
            subgroups: false,
        },
        Variant::SubgroupVec4 | Variant::Subgroup => Requirements {
            fp16: false,
            subgroups: true,
        },
        Variant::F32 | Variant::SharedVec4 | Variant::Shared | Variant::Standard => {
            Requirements::default()
        }
    }
}

/// Preference order per operation.
fn preference(op: Op) -> &'static [Variant] {
    match op {
        Op::MatMul => &[Variant::F16Vec4, Variant::F16, Variant::F32],
        Op::DequantQ4K => &[
            Variant::SubgroupVec4,
            Variant::Subgroup,
            Variant::SharedVec4,
            Variant::Shared,
        ],
        Op::Attention | Op::RmsNorm | Op::Rope | Op::SiluGated | Op::Softmax => {
            &[Variant::Standard]
        }
    }
}

/// Compiles and caches pipelines; executes operations through the
/// selected variant.
pub struct KernelDispatcher {
    caps: DeviceCaps,
    pool: BufferPool,
    pipelines: Mutex<HashMap<(Op, Variant), Pipeline>>,
    rope_tables: Mutex<HashMap<(usize, u32), RopeTable>>,
}

impl KernelDispatcher {
    pub fn new(caps: DeviceCaps, pool: BufferPool) -> Self {
        Self {
            caps,
            pool,
            pipelines: Mutex::new(HashMap::new()),
            rope_tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// The variant the current device selects for `op`.
    pub fn selected_variant(&self, op: Op) -> EngineResult<Variant> {
        preference(op)
            .iter()
            .copied()
            .find(|&v| requirements(v).satisfied_by(&self.caps))
            .ok_or_else(|| EngineError::KernelUnavailable { op: op.to_string() })
    }

    /// Demand a specific variant; fails when the device cannot run it.
    /// Used when a caller cannot accept the fallback's precision.
    pub fn require_variant(&self, op: Op, variant: Variant) -> EngineResult<()> {
        if !preference(op).contains(&variant) || !requirements(variant).satisfied_by(&self.caps) {
            return Err(EngineError::KernelUnavailable {
                op: format!("{op} ({variant})"),
            });
        }
        Ok(())
    }

    /// Compile (once) and record the pipeline for `op`.
    fn prepare(&self, op: Op) -> EngineResult<Variant> {
        let variant = self.selected_variant(op)?;
        let mut pipelines = self.pipelines.lock().expect("pipeline cache poisoned");
        pipelines.entry((op, variant)).or_insert_with(|| {
            debug!(op = %op, variant = %variant, "compiling kernel pipeline");
            Pipeline {
                op,
                variant,
                compiled_at: Instant::now(),
            }
        });
        Ok(variant)
    }

    /// Number of pipelines compiled so far this session.
    pub fn compiled_count(&self) -> usize {
        self.pipelines.lock().expect("pipeline cache poisoned").len()
    }

    /// `[m, k] x [n, k] -> [m, n]`; the weight is `[n, k]` row-major.
    pub fn matmul(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        k: usize,
        n: usize,
    ) -> EngineResult<PooledBuffer> {
        let variant = self.prepare(Op::MatMul)?;
        let mut out = self.pool.acquire(m * n, "matmul");
        match variant {
            Variant::F16Vec4 => cpu::matmul_f16_vec4(a, b, m, k, n, &mut out),
            Variant::F16 => cpu::matmul_f16(a, b, m, k, n, &mut out),
            _ => cpu::matmul_f32(a, b, m, k, n, &mut out),
        }
        Ok(out)
    }

    /// Dequantize a Q4_K tensor to f32. One dispatch group per block;
    /// vec4 variants widen to four blocks per group.
    pub fn dequant_q4k(&self, raw: &[u8], elements: usize) -> EngineResult<PooledBuffer> {
        let blocks = elements.div_ceil(crate::tensor::dtype::Q4K_BLOCK_ELEMENTS);
        if raw.len() < blocks * Q4K_BLOCK_BYTES {
            return Err(EngineError::NotFound(format!(
                "q4k tensor truncated: {} bytes for {elements} elements",
                raw.len()
            )));
        }
        let variant = self.prepare(Op::DequantQ4K)?;
        let group = match variant {
            Variant::SubgroupVec4 | Variant::SharedVec4 => 4,
            _ => 1,
        };
        let mut out = self.pool.acquire(elements, "dequant");
        cpu::dequant_q4k(raw, elements, group, &mut out);
        Ok(out)
    }

    /// Row-wise RMS normalization with per-feature weights.
    pub fn rmsnorm(&self, x: &[f32], weight: &[f32], rows: usize) -> EngineResult<PooledBuffer> {
        self.prepare(Op::RmsNorm)?;
        let mut out = self.pool.acquire(rows * weight.len(), "rmsnorm");
        cpu::rmsnorm(x, weight, rows, &mut out);
        Ok(out)
    }

    /// Rotate `[tokens, heads, head_dim]` pairs in place, positions
    /// starting at `start_pos`. Tables are built lazily per
    /// (head_dim, theta) and grown to cover the requested positions.
    pub fn rope(
        &self,
        x: &mut [f32],
        tokens: usize,
        heads: usize,
        head_dim: usize,
        start_pos: usize,
        theta: f32,
        max_positions: usize,
    ) -> EngineResult<()> {
        self.prepare(Op::Rope)?;
        let key = (head_dim, theta.to_bits());
        let mut tables = self.rope_tables.lock().expect("rope cache poisoned");
        let needed = (start_pos + tokens).max(max_positions);
        let table = tables
            .entry(key)
            .or_insert_with(|| RopeTable::new(needed, head_dim, theta));
        if table.positions < start_pos + tokens {
            *table = RopeTable::new(start_pos + tokens, head_dim, theta);
        }
        table.apply(x, tokens, heads, start_pos);
        Ok(())
    }

    /// Causal attention with grouped-query support; see
    /// [`cpu::attention`] for buffer layouts.
    pub fn attention(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        shape: AttentionShape,
    ) -> EngineResult<PooledBuffer> {
        self.prepare(Op::Attention)?;
        let mut out = self
            .pool
            .acquire(shape.q_tokens * shape.num_heads * shape.head_dim, "attention");
        cpu::attention(q, k, v, shape, &mut out);
        Ok(out)
    }

    /// Gated SiLU: `silu(gate) * up`, elementwise.
    pub fn silu_gated(&self, gate: &[f32], up: &[f32]) -> EngineResult<PooledBuffer> {
        self.prepare(Op::SiluGated)?;
        let mut out = self.pool.acquire(gate.len(), "silu");
        cpu::silu_gated(gate, up, &mut out);
        Ok(out)
    }

    /// In-place softmax along the slice.
    pub fn softmax(&self, x: &mut [f32]) -> EngineResult<()> {
        self.prepare(Op::Softmax)?;
        cpu::softmax(x);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher(caps: DeviceCaps) -> KernelDispatcher {
        KernelDispatcher::new(caps, BufferPool::new())
    }

    #[test]
    fn test_variant_selection_full_featured() {
        let d = dispatcher(DeviceCaps::full_featured());
        assert_eq!(d.selected_variant(Op::MatMul).unwrap(), Variant::F16Vec4);
        assert_eq!(
            d.selected_variant(Op::DequantQ4K).unwrap(),
            Variant::SubgroupVec4
        );
        assert_eq!(d.selected_variant(Op::Attention).unwrap(), Variant::Standard);
    }

    #[test]
    fn test_variant_selection_minimal() {
        let d = dispatcher(DeviceCaps::minimal());
        assert_eq!(d.selected_variant(Op::MatMul).unwrap(), Variant::F32);
        assert_eq!(
            d.selected_variant(Op::DequantQ4K).unwrap(),
            Variant::SharedVec4
        );
    }

    #[test]
    fn test_required_variant_mismatch_is_fatal() {
        let d = dispatcher(DeviceCaps::minimal());
        let err = d.require_variant(Op::MatMul, Variant::F16Vec4).unwrap_err();
        assert!(matches!(err, EngineError::KernelUnavailable { .. }));
        // Wrong op/variant pairing is also rejected.
        assert!(d.require_variant(Op::RmsNorm, Variant::F16).is_err());
        // A supported pairing passes.
        d.require_variant(Op::MatMul, Variant::F32).unwrap();
    }

    #[test]
    fn test_pipeline_compiled_once() {
        let d = dispatcher(DeviceCaps::host());
        let a = [1.0, 0.0, 0.0, 1.0];
        d.matmul(&a, &a, 2, 2, 2).unwrap();
        d.matmul(&a, &a, 2, 2, 2).unwrap();
        d.softmax(&mut [1.0, 2.0]).unwrap();
        assert_eq!(d.compiled_count(), 2);
    }

    #[test]
    fn test_host_matmul_uses_f16_path_consistently() {
        // Host caps report fp16, so both calls run the same variant and
        // agree bit-for-bit.
        let d = dispatcher(DeviceCaps::host());
        let a: Vec<f32> = (0..6).map(|i| i as f32 * 0.5).collect();
        let b: Vec<f32> = (0..6).map(|i| (5 - i) as f32 * 0.25).collect();
        let first = d.matmul(&a, &b, 2, 3, 2).unwrap().to_vec();
        let second = d.matmul(&a, &b, 2, 3, 2).unwrap().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dequant_truncated_input_rejected() {
        let d = dispatcher(DeviceCaps::host());
        let raw = vec![0u8; 100]; // less than one block
        assert!(d.dequant_q4k(&raw, 256).is_err());
    }

    #[test]
    fn test_outputs_return_to_pool() {
        let pool = BufferPool::new();
        let d = KernelDispatcher::new(DeviceCaps::host(), pool.clone());
        {
            let out = d.silu_gated(&[1.0, 2.0], &[1.0, 1.0]).unwrap();
            assert_eq!(out.len(), 2);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
