//! Host reference implementations of the compute kernels.
//!
//! Every operation the dispatcher exposes has its ground-truth form here.
//! Layout conventions: activations are `[tokens, features]` row-major;
//! weights are `[out_features, in_features]` row-major, so a projection is
//! `x @ w^T`; attention tensors are `[tokens, heads, head_dim]`.

use half::f16;

use crate::tensor::dtype::{Q4K_BLOCK_BYTES, Q4K_BLOCK_ELEMENTS};

/// Epsilon inside the RMS normalization root.
pub const RMSNORM_EPS: f32 = 1e-5;

/// `out[m][n] = sum_k a[m][k] * b[n][k]` — weight rows are output features.
pub fn matmul_f32(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);
    debug_assert_eq!(out.len(), m * n);

    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let col = &b[j * k..(j + 1) * k];
            let mut acc = 0.0f32;
            for (x, w) in row.iter().zip(col) {
                acc += x * w;
            }
            out[i * n + j] = acc;
        }
    }
}

/// Matmul through f16 operands with f32 accumulation. Matches the
/// precision of devices that narrow inputs to half floats.
pub fn matmul_f16(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);

    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let col = &b[j * k..(j + 1) * k];
            let mut acc = 0.0f32;
            for (x, w) in row.iter().zip(col) {
                acc += (f16::from_f32(*x) * f16::from_f32(*w)).to_f32();
            }
            out[i * n + j] = acc;
        }
    }
}

/// The f16 matmul with 4-wide inner-loop widening.
pub fn matmul_f16_vec4(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), n * k);

    for i in 0..m {
        let row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let col = &b[j * k..(j + 1) * k];
            let mut lanes = [0.0f32; 4];
            let quads = k / 4;
            for q in 0..quads {
                for l in 0..4 {
                    let idx = q * 4 + l;
                    lanes[l] += (f16::from_f32(row[idx]) * f16::from_f32(col[idx])).to_f32();
                }
            }
            let mut acc = lanes.iter().sum::<f32>();
            for idx in quads * 4..k {
                acc += (f16::from_f32(row[idx]) * f16::from_f32(col[idx])).to_f32();
            }
            out[i * n + j] = acc;
        }
    }
}

/// Unpack the 6-bit sub-scale and sub-min for sub-block `j` from the
/// 12-byte packed area of a Q4_K block (llama.cpp canonical layout).
fn scale_min_k4(j: usize, packed: &[u8]) -> (f32, f32) {
    debug_assert!(j < 8);
    let (sc, mn) = if j < 4 {
        (packed[j] & 63, packed[j + 4] & 63)
    } else {
        (
            (packed[j + 4] & 0x0F) | ((packed[j - 4] >> 6) << 4),
            (packed[j + 4] >> 4) | ((packed[j] >> 6) << 4),
        )
    };
    (sc as f32, mn as f32)
}

/// Dequantize one 144-byte Q4_K block into 256 f32 values.
pub fn dequant_q4k_block(block: &[u8], out: &mut [f32]) {
    debug_assert_eq!(block.len(), Q4K_BLOCK_BYTES);
    debug_assert_eq!(out.len(), Q4K_BLOCK_ELEMENTS);

    let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
    let dmin = f16::from_le_bytes([block[2], block[3]]).to_f32();
    let scales = &block[4..16];
    let qs = &block[16..144];

    let mut is = 0;
    let mut q = 0;
    let mut y = 0;
    // 64 elements per stride: 32 low nibbles then 32 high nibbles.
    for _ in 0..4 {
        let (sc, mn) = scale_min_k4(is, scales);
        let d1 = d * sc;
        let m1 = dmin * mn;
        let (sc, mn) = scale_min_k4(is + 1, scales);
        let d2 = d * sc;
        let m2 = dmin * mn;

        for l in 0..32 {
            out[y + l] = d1 * (qs[q + l] & 0x0F) as f32 - m1;
        }
        for l in 0..32 {
            out[y + 32 + l] = d2 * (qs[q + l] >> 4) as f32 - m2;
        }
        q += 32;
        is += 2;
        y += 64;
    }
}

/// Dequantize a Q4_K tensor, `group` blocks per pass (the vec4 variants
/// widen to four blocks per dispatch group). A trailing partial block is
/// truncated to `elements`.
pub fn dequant_q4k(raw: &[u8], elements: usize, group: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), elements);
    let blocks = elements.div_ceil(Q4K_BLOCK_ELEMENTS);
    debug_assert!(raw.len() >= blocks * Q4K_BLOCK_BYTES);

    let mut scratch = [0.0f32; Q4K_BLOCK_ELEMENTS];
    for base in (0..blocks).step_by(group.max(1)) {
        for b in base..(base + group.max(1)).min(blocks) {
            let block = &raw[b * Q4K_BLOCK_BYTES..(b + 1) * Q4K_BLOCK_BYTES];
            let start = b * Q4K_BLOCK_ELEMENTS;
            let take = Q4K_BLOCK_ELEMENTS.min(elements - start);
            if take == Q4K_BLOCK_ELEMENTS {
                dequant_q4k_block(block, &mut out[start..start + Q4K_BLOCK_ELEMENTS]);
            } else {
                dequant_q4k_block(block, &mut scratch);
                out[start..start + take].copy_from_slice(&scratch[..take]);
            }
        }
    }
}

/// Root-mean-square normalization, row-wise: each row is divided by
/// `sqrt(mean(x^2) + eps)` and scaled by the per-feature weight.
pub fn rmsnorm(x: &[f32], weight: &[f32], rows: usize, out: &mut [f32]) {
    let width = weight.len();
    debug_assert_eq!(x.len(), rows * width);
    debug_assert_eq!(out.len(), rows * width);

    for r in 0..rows {
        let row = &x[r * width..(r + 1) * width];
        let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / width as f32;
        let inv = 1.0 / (mean_sq + RMSNORM_EPS).sqrt();
        for (i, v) in row.iter().enumerate() {
            out[r * width + i] = v * inv * weight[i];
        }
    }
}

/// Precomputed rotary-embedding angle tables.
///
/// `cos`/`sin` are `[positions, head_dim / 2]`, frequency
/// `theta^(-2i / head_dim)` per coordinate pair.
#[derive(Debug)]
pub struct RopeTable {
    pub head_dim: usize,
    pub positions: usize,
    cos: Vec<f32>,
    sin: Vec<f32>,
}

impl RopeTable {
    pub fn new(positions: usize, head_dim: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let mut cos = Vec::with_capacity(positions * half);
        let mut sin = Vec::with_capacity(positions * half);
        for pos in 0..positions {
            for i in 0..half {
                let freq = theta.powf(-2.0 * i as f32 / head_dim as f32);
                let angle = pos as f32 * freq;
                cos.push(angle.cos());
                sin.push(angle.sin());
            }
        }
        Self {
            head_dim,
            positions,
            cos,
            sin,
        }
    }

    /// Rotate `(even, odd)` pairs of every head in place. `x` is
    /// `[tokens, heads, head_dim]`; token `t` uses table row
    /// `start_pos + t`.
    pub fn apply(&self, x: &mut [f32], tokens: usize, heads: usize, start_pos: usize) {
        let half = self.head_dim / 2;
        debug_assert_eq!(x.len(), tokens * heads * self.head_dim);
        debug_assert!(start_pos + tokens <= self.positions);

        for t in 0..tokens {
            let table_row = (start_pos + t) * half;
            for h in 0..heads {
                let base = (t * heads + h) * self.head_dim;
                for i in 0..half {
                    let c = self.cos[table_row + i];
                    let s = self.sin[table_row + i];
                    let even = x[base + 2 * i];
                    let odd = x[base + 2 * i + 1];
                    x[base + 2 * i] = even * c - odd * s;
                    x[base + 2 * i + 1] = even * s + odd * c;
                }
            }
        }
    }
}

/// Shape parameters for the attention kernel.
#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub q_tokens: usize,
    pub kv_len: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Global position of query token 0; the causal mask admits key `j`
    /// for query `i` when `j <= causal_offset + i`.
    pub causal_offset: usize,
}

/// Causal scaled-dot-product attention with grouped-query support.
///
/// `q` is `[q_tokens, num_heads, head_dim]`, `k`/`v` are
/// `[kv_len, num_kv_heads, head_dim]`, `out` is
/// `[q_tokens, num_heads * head_dim]`. Each KV head serves
/// `num_heads / num_kv_heads` query heads.
pub fn attention(q: &[f32], k: &[f32], v: &[f32], shape: AttentionShape, out: &mut [f32]) {
    let AttentionShape {
        q_tokens,
        kv_len,
        num_heads,
        num_kv_heads,
        head_dim,
        causal_offset,
    } = shape;
    debug_assert_eq!(q.len(), q_tokens * num_heads * head_dim);
    debug_assert_eq!(k.len(), kv_len * num_kv_heads * head_dim);
    debug_assert_eq!(v.len(), kv_len * num_kv_heads * head_dim);
    debug_assert_eq!(out.len(), q_tokens * num_heads * head_dim);
    debug_assert_eq!(num_heads % num_kv_heads.max(1), 0);

    let group = num_heads / num_kv_heads;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut scores = vec![0.0f32; kv_len];

    for t in 0..q_tokens {
        let visible = (causal_offset + t + 1).min(kv_len);
        for h in 0..num_heads {
            let kv_h = h / group;
            let q_vec = &q[(t * num_heads + h) * head_dim..][..head_dim];

            for (j, score) in scores[..visible].iter_mut().enumerate() {
                let k_vec = &k[(j * num_kv_heads + kv_h) * head_dim..][..head_dim];
                let mut dot = 0.0f32;
                for (a, b) in q_vec.iter().zip(k_vec) {
                    dot += a * b;
                }
                *score = dot * scale;
            }
            softmax(&mut scores[..visible]);

            let out_vec = &mut out[t * num_heads * head_dim + h * head_dim..][..head_dim];
            out_vec.fill(0.0);
            for (j, &p) in scores[..visible].iter().enumerate() {
                let v_vec = &v[(j * num_kv_heads + kv_h) * head_dim..][..head_dim];
                for (o, val) in out_vec.iter_mut().zip(v_vec) {
                    *o += p * val;
                }
            }
        }
    }
}

/// `out[i] = silu(gate[i]) * up[i]` where `silu(x) = x / (1 + e^-x)`.
pub fn silu_gated(gate: &[f32], up: &[f32], out: &mut [f32]) {
    debug_assert_eq!(gate.len(), up.len());
    debug_assert_eq!(gate.len(), out.len());
    for ((g, u), o) in gate.iter().zip(up).zip(out.iter_mut()) {
        *o = g / (1.0 + (-g).exp()) * u;
    }
}

/// Numerically stable in-place softmax.
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in x.iter_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_identity() {
        // a = [[1,2],[3,4]], b = identity rows → out == a.
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut out = [0.0; 4];
        matmul_f32(&a, &b, 2, 2, 2, &mut out);
        assert_eq!(out, a);
    }

    #[test]
    fn test_matmul_variants_agree_on_small_values() {
        // Values exactly representable in f16 keep all three variants
        // bit-identical.
        let a: Vec<f32> = (0..12).map(|i| (i % 5) as f32 * 0.25).collect();
        let b: Vec<f32> = (0..20).map(|i| (i % 3) as f32 * 0.5).collect();
        let (m, k, n) = (3, 4, 5);
        let mut out32 = vec![0.0; m * n];
        let mut out16 = vec![0.0; m * n];
        let mut out16v = vec![0.0; m * n];
        matmul_f32(&a, &b, m, k, n, &mut out32);
        matmul_f16(&a, &b, m, k, n, &mut out16);
        matmul_f16_vec4(&a, &b, m, k, n, &mut out16v);
        assert_eq!(out32, out16);
        assert_eq!(out32, out16v);
    }

    #[test]
    fn test_scale_min_unpacking() {
        // Sub-block 0: low 6 bits of bytes 0 and 4.
        let mut packed = [0u8; 12];
        packed[0] = 0b0010_1010; // sc = 42
        packed[4] = 0b0001_0101; // mn = 21
        assert_eq!(scale_min_k4(0, &packed), (42.0, 21.0));

        // Sub-block 4 pulls its high bits from bytes 0 and 4.
        let mut packed = [0u8; 12];
        packed[8] = 0x21; // low nibble 1 → sc low, high nibble 2 → mn low
        packed[0] = 0b1100_0000; // top bits → sc high nibble = 3
        packed[4] = 0b0100_0000; // top bits → mn high nibble = 1
        let (sc, mn) = scale_min_k4(4, &packed);
        assert_eq!(sc, (0x01 | (0x03 << 4)) as f32);
        assert_eq!(mn, (0x02 | (0x01 << 4)) as f32);
    }

    #[test]
    fn test_dequant_q4k_uniform_block() {
        // d = 1.0, dmin = 0.0, all sub-scales 1, all quants q → value q.
        let mut block = [0u8; Q4K_BLOCK_BYTES];
        block[0..2].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
        block[2..4].copy_from_slice(&f16::from_f32(0.0).to_le_bytes());
        for j in 0..4 {
            block[4 + j] = 1; // sub-scales 0..4
            block[8 + j] = 0; // sub-mins 0..4
        }
        // Bytes 12..16 pack scale/min for sub-blocks 4..8: low nibble is
        // the scale's low bits, high nibble the min's low bits. 0x01 gives
        // scale 1, min 0.
        for j in 0..4 {
            block[12 + j] = 0x01;
        }
        // Quants: low nibble 5, high nibble 9.
        for b in block[16..144].iter_mut() {
            *b = 0x95;
        }

        let mut out = [0.0f32; Q4K_BLOCK_ELEMENTS];
        dequant_q4k_block(&block, &mut out);
        // Each 64-stride: 32 fives then 32 nines.
        for chunk in out.chunks(64) {
            assert!(chunk[..32].iter().all(|&v| v == 5.0), "{chunk:?}");
            assert!(chunk[32..].iter().all(|&v| v == 9.0));
        }
    }

    #[test]
    fn test_dequant_q4k_min_offsets() {
        // d = 2.0, dmin = 1.0, scale 3, min 7 → value = 2*3*q - 1*7.
        let mut block = [0u8; Q4K_BLOCK_BYTES];
        block[0..2].copy_from_slice(&f16::from_f32(2.0).to_le_bytes());
        block[2..4].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
        for j in 0..4 {
            block[4 + j] = 3;
            block[8 + j] = 7;
        }
        for j in 0..4 {
            block[12 + j] = 0x73; // scale low = 3, min low = 7
        }
        for b in block[16..144].iter_mut() {
            *b = 0x44; // q = 4 in both nibbles
        }

        let mut out = [0.0f32; Q4K_BLOCK_ELEMENTS];
        dequant_q4k_block(&block, &mut out);
        assert!(out.iter().all(|&v| v == 2.0 * 3.0 * 4.0 - 7.0));
    }

    #[test]
    fn test_dequant_partial_tail() {
        let mut raw = vec![0u8; 2 * Q4K_BLOCK_BYTES];
        for block in raw.chunks_mut(Q4K_BLOCK_BYTES) {
            block[0..2].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
            for j in 0..4 {
                block[4 + j] = 1;
            }
            for j in 0..4 {
                block[12 + j] = 0x01;
            }
            for b in block[16..144].iter_mut() {
                *b = 0x22;
            }
        }
        let elements = 300; // 256 + 44
        let mut out = vec![0.0f32; elements];
        dequant_q4k(&raw, elements, 1, &mut out);
        assert!(out.iter().all(|&v| v == 2.0));

        // Grouped driver produces identical output.
        let mut out4 = vec![0.0f32; elements];
        dequant_q4k(&raw, elements, 4, &mut out4);
        assert_eq!(out, out4);
    }

    #[test]
    fn test_rmsnorm_unit_weight() {
        let x = [3.0, 4.0];
        let w = [1.0, 1.0];
        let mut out = [0.0; 2];
        rmsnorm(&x, &w, 1, &mut out);
        // rms = sqrt((9+16)/2) = sqrt(12.5)
        let rms = 12.5f32.sqrt();
        assert!((out[0] - 3.0 / rms).abs() < 1e-4);
        assert!((out[1] - 4.0 / rms).abs() < 1e-4);
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let table = RopeTable::new(4, 4, 10_000.0);
        let mut x = [1.0, 2.0, 3.0, 4.0];
        let orig = x;
        table.apply(&mut x, 1, 1, 0);
        assert_eq!(x, orig);
    }

    #[test]
    fn test_rope_rotation_preserves_norm() {
        let table = RopeTable::new(8, 4, 10_000.0);
        let mut x = [1.0, 2.0, 3.0, 4.0];
        let norm_before: f32 = x.iter().map(|v| v * v).sum();
        table.apply(&mut x, 1, 1, 5);
        let norm_after: f32 = x.iter().map(|v| v * v).sum();
        assert!((norm_before - norm_after).abs() < 1e-4);
        assert_ne!(x[0], 1.0);
    }

    #[test]
    fn test_rope_start_offset_matches_absolute_position() {
        let table = RopeTable::new(16, 4, 10_000.0);
        let base = [0.5, -1.0, 2.0, 0.25];

        // Rotating token 3 of a 4-token batch equals rotating a single
        // token with start_pos = 3.
        let mut batch = [0.0f32; 16];
        for t in 0..4 {
            batch[t * 4..(t + 1) * 4].copy_from_slice(&base);
        }
        table.apply(&mut batch, 4, 1, 0);

        let mut single = base;
        table.apply(&mut single, 1, 1, 3);
        assert_eq!(&batch[12..16], &single);
    }

    #[test]
    fn test_attention_single_position() {
        // One query, one key: softmax over one score is 1, so the output
        // is exactly v.
        let q = [1.0, 0.0];
        let k = [0.3, 0.7];
        let v = [5.0, -2.0];
        let mut out = [0.0; 2];
        attention(
            &q,
            &k,
            &v,
            AttentionShape {
                q_tokens: 1,
                kv_len: 1,
                num_heads: 1,
                num_kv_heads: 1,
                head_dim: 2,
                causal_offset: 0,
            },
            &mut out,
        );
        assert_eq!(out, v);
    }

    #[test]
    fn test_attention_causal_mask() {
        // Two queries over two keys: the first query must ignore key 1.
        let q = [1.0, 0.0, 1.0, 0.0];
        let k = [10.0, 0.0, 10.0, 0.0]; // both keys identical, huge score
        let v = [1.0, 1.0, 9.0, 9.0];
        let mut out = [0.0; 4];
        attention(
            &q,
            &k,
            &v,
            AttentionShape {
                q_tokens: 2,
                kv_len: 2,
                num_heads: 1,
                num_kv_heads: 1,
                head_dim: 2,
                causal_offset: 0,
            },
            &mut out,
        );
        // Query 0 sees only v0; query 1 averages both equally.
        assert_eq!(&out[..2], &[1.0, 1.0]);
        assert!((out[2] - 5.0).abs() < 1e-5);
        assert!((out[3] - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_attention_gqa_head_sharing() {
        // 2 query heads, 1 kv head: both query heads read the same KV.
        let q = [1.0, 0.0, 1.0, 0.0]; // token 0, heads 0 and 1
        let k = [0.2, 0.1];
        let v = [3.0, 4.0];
        let mut out = [0.0; 4];
        attention(
            &q,
            &k,
            &v,
            AttentionShape {
                q_tokens: 1,
                kv_len: 1,
                num_heads: 2,
                num_kv_heads: 1,
                head_dim: 2,
                causal_offset: 0,
            },
            &mut out,
        );
        assert_eq!(&out[..2], &[3.0, 4.0]);
        assert_eq!(&out[2..], &[3.0, 4.0]);
    }

    #[test]
    fn test_silu_gated() {
        let gate = [0.0, 1.0, -1.0];
        let up = [2.0, 2.0, 2.0];
        let mut out = [0.0; 3];
        silu_gated(&gate, &up, &mut out);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 2.0 / (1.0 + (-1.0f32).exp())).abs() < 1e-6);
        assert!((out[2] - (-2.0) / (1.0 + 1.0f32.exp())).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut x = [1.0, 2.0, 3.0, 0.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(x[2] > x[1] && x[1] > x[0] && x[0] > x[3]);
    }

    #[test]
    fn test_softmax_handles_large_logits() {
        let mut x = [1000.0, 1000.0];
        softmax(&mut x);
        assert!((x[0] - 0.5).abs() < 1e-6);
    }
}