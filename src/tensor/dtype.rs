//! Element types and their storage geometry.
//!
//! Three dtypes are supported: F32, F16, and the Q4_K block-quantized
//! format (256 elements per 144-byte block: f16 scale + f16 min + 12 bytes
//! of packed 6-bit sub-scales/sub-mins + 128 bytes of 4-bit values).

use serde::{Deserialize, Serialize};

/// Elements per Q4_K block.
pub const Q4K_BLOCK_ELEMENTS: usize = 256;

/// Serialized bytes per Q4_K block.
pub const Q4K_BLOCK_BYTES: usize = 144;

/// Bytes of packed 6-bit sub-scales and sub-mins per block.
pub const Q4K_SCALE_BYTES: usize = 12;

/// Supported tensor element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    F32,
    F16,
    #[serde(rename = "Q4_K")]
    Q4K,
}

impl Dtype {
    /// Parse a manifest quantization tag.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "F32" | "f32" => Some(Dtype::F32),
            "F16" | "f16" => Some(Dtype::F16),
            "Q4_K" | "q4_k" => Some(Dtype::Q4K),
            _ => None,
        }
    }

    /// Serialized byte length of a tensor with `elements` elements.
    ///
    /// Q4_K rounds up to whole blocks; F32/F16 are exact multiples.
    pub fn byte_len(&self, elements: usize) -> usize {
        match self {
            Dtype::F32 => elements * 4,
            Dtype::F16 => elements * 2,
            Dtype::Q4K => elements.div_ceil(Q4K_BLOCK_ELEMENTS) * Q4K_BLOCK_BYTES,
        }
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::F32 => write!(f, "F32"),
            Dtype::F16 => write!(f, "F16"),
            Dtype::Q4K => write!(f, "Q4_K"),
        }
    }
}

/// Bit-accurate f16 → f32 conversion of a raw half-float pattern.
///
/// Denormals, signed zeros, infinities and NaN all map per IEEE 754.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    half::f16::from_bits(bits).to_f32()
}

/// Convert little-endian f16 bytes to f32 values.
pub fn f16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f16_bits_to_f32(u16::from_le_bytes([pair[0], pair[1]])))
        .collect()
}

/// Reinterpret little-endian f32 bytes. Aligned buffers cast in place;
/// unaligned ones (mid-shard tensor offsets) fall back to per-element
/// reads.
pub fn f32_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(slice) => slice.to_vec(),
        Err(_) => bytes
            .chunks_exact(4)
            .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
            .collect(),
    }
}
