//! Model manifest parsing and validation.
//!
//! The manifest is a JSON descriptor enumerating architecture, shards and
//! the tensor table. Parsing accumulates every schema violation into one
//! `ManifestInvalid` instead of bailing at the first, so a broken manifest
//! is diagnosable in a single pass.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::store::hasher::is_valid_digest;
use crate::tensor::dtype::Dtype;

/// Highest manifest format version this engine understands.
pub const SUPPORTED_VERSION: u32 = 1;

/// A validated model manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub version: u32,
    pub model_id: String,
    pub architecture: Architecture,
    pub moe: Option<MoeSpec>,
    pub quantization: Dtype,
    pub shards: Vec<ShardRecord>,
    pub total_size: u64,
    pub model_hash: String,
    pub hash_algorithm: Option<String>,
    pub tensors: HashMap<String, TensorDesc>,

    /// The original document, kept for persistence alongside the shards.
    pub raw: serde_json::Value,
}

/// Transformer architecture record.
#[derive(Debug, Clone)]
pub struct Architecture {
    pub layers: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,
    pub rope_theta: f32,
    pub sliding_window: Option<usize>,
}

/// Mixture-of-experts record.
#[derive(Debug, Clone)]
pub struct MoeSpec {
    pub num_experts: usize,
    pub top_k: usize,
    /// Maps "layer.expert" keys to the shard indices holding that
    /// expert's weights; consulted by the lazy expert loader.
    pub expert_shard_map: HashMap<String, Vec<u32>>,
}

/// One shard of the serialized model.
#[derive(Debug, Clone)]
pub struct ShardRecord {
    pub index: u32,
    pub filename: String,
    pub size: u64,
    pub hash: String,
    /// Byte offset of this shard within the full model image.
    pub offset: u64,
}

/// Where a logical tensor's bytes live and how to interpret them.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub location: TensorLocation,
}

impl TensorDesc {
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn spans(&self) -> &[TensorSpan] {
        match &self.location {
            TensorLocation::Single(span) => std::slice::from_ref(span),
            TensorLocation::Spans(spans) => spans,
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.spans().iter().map(|s| s.length).sum()
    }
}

/// Single-shard or multi-shard placement.
#[derive(Debug, Clone)]
pub enum TensorLocation {
    Single(TensorSpan),
    Spans(Vec<TensorSpan>),
}

/// A contiguous byte range within one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSpan {
    pub shard: u32,
    pub offset: u64,
    pub length: u64,
}

// Wire schema: every field optional so validation can report all problems
// at once instead of failing on the first missing key.

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    version: Option<u32>,
    model_id: Option<String>,
    architecture: Option<ArchitectureDoc>,
    #[serde(default)]
    moe: Option<MoeDoc>,
    quantization: Option<String>,
    shards: Option<Vec<ShardDoc>>,
    total_size: Option<u64>,
    model_hash: Option<String>,
    #[serde(default)]
    hash_algorithm: Option<String>,
    tensors: Option<HashMap<String, TensorDoc>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchitectureDoc {
    layers: Option<usize>,
    hidden_size: Option<usize>,
    intermediate_size: Option<usize>,
    num_heads: Option<usize>,
    #[serde(default)]
    num_kv_heads: Option<usize>,
    #[serde(default)]
    head_dim: Option<usize>,
    vocab_size: Option<usize>,
    max_seq_len: Option<usize>,
    rope_theta: Option<f32>,
    #[serde(default)]
    sliding_window: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct MoeDoc {
    num_experts: Option<usize>,
    top_k: Option<usize>,
    #[serde(default)]
    expert_shard_map: HashMap<String, Vec<u32>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ShardDoc {
    index: Option<u32>,
    filename: Option<String>,
    size: Option<u64>,
    hash: Option<String>,
    offset: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TensorDoc {
    shape: Option<Vec<usize>>,
    dtype: Option<String>,
    #[serde(default)]
    shard: Option<u32>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    length: Option<u64>,
    #[serde(default)]
    spans: Option<Vec<SpanDoc>>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpanDoc {
    shard: Option<u32>,
    offset: Option<u64>,
    length: Option<u64>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn parse(json: &str) -> EngineResult<Self> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let doc: ManifestDoc = serde_json::from_value(raw.clone())?;

        let mut reasons = Vec::new();

        let version = doc.version.unwrap_or_else(|| {
            reasons.push("missing version".to_string());
            0
        });
        if doc.version.is_some() && version > SUPPORTED_VERSION {
            reasons.push(format!(
                "unsupported manifest version {version} (supported <= {SUPPORTED_VERSION})"
            ));
        }

        let model_id = match doc.model_id {
            Some(ref id) if !id.is_empty() => id.clone(),
            _ => {
                reasons.push("missing modelId".to_string());
                String::new()
            }
        };

        let architecture = validate_architecture(doc.architecture.as_ref(), &mut reasons);
        let moe = validate_moe(doc.moe.as_ref(), &mut reasons);

        let quantization = match doc.quantization.as_deref() {
            None => {
                reasons.push("missing quantization".to_string());
                Dtype::F32
            }
            Some(tag) => Dtype::parse(tag).unwrap_or_else(|| {
                reasons.push(format!("unknown quantization {tag:?}"));
                Dtype::F32
            }),
        };

        let shards = validate_shards(doc.shards.as_deref(), doc.total_size, &mut reasons);

        let total_size = doc.total_size.unwrap_or_else(|| {
            reasons.push("missing totalSize".to_string());
            0
        });

        let model_hash = match doc.model_hash {
            Some(ref h) if is_valid_digest(h) => h.clone(),
            Some(ref h) => {
                reasons.push(format!(
                    "modelHash must be 64 hex chars, got {} chars",
                    h.len()
                ));
                String::new()
            }
            None => {
                reasons.push("missing modelHash".to_string());
                String::new()
            }
        };

        let tensors = validate_tensors(doc.tensors, &shards, &mut reasons);

        if !reasons.is_empty() {
            return Err(EngineError::ManifestInvalid { reasons });
        }

        Ok(Manifest {
            version,
            model_id,
            architecture,
            moe,
            quantization,
            shards,
            total_size,
            model_hash,
            hash_algorithm: doc.hash_algorithm,
            tensors,
            raw,
        })
    }

    /// Look up a tensor descriptor by exact name.
    pub fn tensor(&self, name: &str) -> Option<&TensorDesc> {
        self.tensors.get(name)
    }

    /// Whether layer `layer` runs a MoE feed-forward: the manifest carries
    /// a MoE record and the tensor table has that layer's router gate.
    pub fn is_moe_layer(&self, layer: usize) -> bool {
        self.moe.is_some()
            && self
                .tensors
                .contains_key(&format!("model.layers.{layer}.mlp.gate.weight"))
    }

    /// Resident weight bytes excluding lazily loaded experts.
    pub fn resident_bytes(&self) -> u64 {
        self.tensors
            .iter()
            .filter(|(name, _)| !name.contains(".mlp.experts."))
            .map(|(_, desc)| desc.byte_len())
            .sum()
    }
}

fn validate_architecture(doc: Option<&ArchitectureDoc>, reasons: &mut Vec<String>) -> Architecture {
    let missing = |reasons: &mut Vec<String>, field: &str| {
        reasons.push(format!("missing architecture.{field}"));
        0usize
    };

    let Some(doc) = doc else {
        reasons.push("missing architecture".to_string());
        return Architecture {
            layers: 0,
            hidden_size: 0,
            intermediate_size: 0,
            num_heads: 0,
            num_kv_heads: 0,
            head_dim: 0,
            vocab_size: 0,
            max_seq_len: 0,
            rope_theta: 0.0,
            sliding_window: None,
        };
    };

    let layers = doc.layers.unwrap_or_else(|| missing(reasons, "layers"));
    let hidden_size = doc
        .hidden_size
        .unwrap_or_else(|| missing(reasons, "hiddenSize"));
    let intermediate_size = doc
        .intermediate_size
        .unwrap_or_else(|| missing(reasons, "intermediateSize"));
    let num_heads = doc
        .num_heads
        .unwrap_or_else(|| missing(reasons, "numHeads"));
    let vocab_size = doc
        .vocab_size
        .unwrap_or_else(|| missing(reasons, "vocabSize"));
    let max_seq_len = doc
        .max_seq_len
        .unwrap_or_else(|| missing(reasons, "maxSeqLen"));
    let rope_theta = doc.rope_theta.unwrap_or_else(|| {
        reasons.push("missing architecture.ropeTheta".to_string());
        0.0
    });

    // Derived defaults: kv heads fall back to query heads, head dim to
    // hidden / heads.
    let num_kv_heads = doc.num_kv_heads.unwrap_or(num_heads);
    let head_dim = doc.head_dim.unwrap_or_else(|| {
        if num_heads > 0 {
            hidden_size / num_heads
        } else {
            0
        }
    });

    if num_kv_heads > num_heads && num_heads > 0 {
        reasons.push(format!(
            "numKvHeads ({num_kv_heads}) exceeds numHeads ({num_heads})"
        ));
    }

    Architecture {
        layers,
        hidden_size,
        intermediate_size,
        num_heads,
        num_kv_heads,
        head_dim,
        vocab_size,
        max_seq_len,
        rope_theta,
        sliding_window: doc.sliding_window,
    }
}

fn validate_moe(doc: Option<&MoeDoc>, reasons: &mut Vec<String>) -> Option<MoeSpec> {
    let doc = doc?;
    let num_experts = doc.num_experts.unwrap_or_else(|| {
        reasons.push("missing moe.numExperts".to_string());
        0
    });
    let top_k = doc.top_k.unwrap_or_else(|| {
        reasons.push("missing moe.topK".to_string());
        0
    });
    if num_experts > 0 && top_k > num_experts {
        reasons.push(format!(
            "moe.topK ({top_k}) exceeds moe.numExperts ({num_experts})"
        ));
    }
    if doc.num_experts.is_some() && num_experts == 0 {
        reasons.push("moe.numExperts must be positive".to_string());
    }
    Some(MoeSpec {
        num_experts,
        top_k,
        expert_shard_map: doc.expert_shard_map.clone(),
    })
}

fn validate_shards(
    docs: Option<&[ShardDoc]>,
    total_size: Option<u64>,
    reasons: &mut Vec<String>,
) -> Vec<ShardRecord> {
    let Some(docs) = docs else {
        reasons.push("missing shards".to_string());
        return Vec::new();
    };
    if docs.is_empty() {
        reasons.push("shards must not be empty".to_string());
        return Vec::new();
    }

    let mut shards = Vec::with_capacity(docs.len());
    let mut expected_offset = 0u64;
    for (i, doc) in docs.iter().enumerate() {
        let index = doc.index.unwrap_or(i as u32);
        if index as usize != i {
            reasons.push(format!("shard {i} has out-of-order index {index}"));
        }
        let size = doc.size.unwrap_or_else(|| {
            reasons.push(format!("shard {i}: missing size"));
            0
        });
        let offset = doc.offset.unwrap_or(expected_offset);
        if offset != expected_offset {
            reasons.push(format!(
                "shard {i}: offset {offset} breaks contiguity (expected {expected_offset})"
            ));
        }
        let hash = match doc.hash {
            Some(ref h) if is_valid_digest(h) => h.clone(),
            Some(ref h) => {
                reasons.push(format!(
                    "shard {i}: hash must be 64 hex chars, got {} chars",
                    h.len()
                ));
                String::new()
            }
            None => {
                reasons.push(format!("shard {i}: missing hash"));
                String::new()
            }
        };
        let filename = doc
            .filename
            .clone()
            .unwrap_or_else(|| format!("shard_{index:03}.bin"));

        expected_offset += size;
        shards.push(ShardRecord {
            index,
            filename,
            size,
            hash,
            offset,
        });
    }

    if let Some(declared) = total_size {
        let sum: u64 = shards.iter().map(|s| s.size).sum();
        if sum != declared {
            reasons.push(format!(
                "totalSize mismatch: shards sum to {sum}, manifest declares {declared}"
            ));
        }
    }

    shards
}

fn validate_tensors(
    docs: Option<HashMap<String, TensorDoc>>,
    shards: &[ShardRecord],
    reasons: &mut Vec<String>,
) -> HashMap<String, TensorDesc> {
    let Some(docs) = docs else {
        reasons.push("missing tensors".to_string());
        return HashMap::new();
    };

    let mut tensors = HashMap::with_capacity(docs.len());
    for (name, doc) in docs {
        let Some(shape) = doc.shape else {
            reasons.push(format!("tensor {name}: missing shape"));
            continue;
        };
        let dtype = match doc.dtype.as_deref().and_then(Dtype::parse) {
            Some(d) => d,
            None => {
                reasons.push(format!("tensor {name}: missing or unknown dtype"));
                continue;
            }
        };

        let location = if let Some(spans) = doc.spans {
            let mut out = Vec::with_capacity(spans.len());
            for (i, span) in spans.iter().enumerate() {
                match (span.shard, span.offset, span.length) {
                    (Some(shard), Some(offset), Some(length)) => {
                        out.push(TensorSpan {
                            shard,
                            offset,
                            length,
                        });
                    }
                    _ => reasons.push(format!("tensor {name}: span {i} incomplete")),
                }
            }
            if out.is_empty() {
                reasons.push(format!("tensor {name}: empty span list"));
                continue;
            }
            TensorLocation::Spans(out)
        } else {
            match (doc.shard, doc.offset, doc.length) {
                (Some(shard), Some(offset), Some(length)) => {
                    TensorLocation::Single(TensorSpan {
                        shard,
                        offset,
                        length,
                    })
                }
                _ => {
                    reasons.push(format!("tensor {name}: missing location"));
                    continue;
                }
            }
        };

        let desc = TensorDesc {
            shape,
            dtype,
            location,
        };

        let expected = dtype.byte_len(desc.elements()) as u64;
        if desc.byte_len() != expected {
            reasons.push(format!(
                "tensor {name}: byte length {} does not match shape (expected {expected})",
                desc.byte_len()
            ));
        }
        for span in desc.spans() {
            match shards.iter().find(|s| s.index == span.shard) {
                None => reasons.push(format!(
                    "tensor {name}: references unknown shard {}",
                    span.shard
                )),
                Some(shard) if span.offset + span.length > shard.size => {
                    reasons.push(format!(
                        "tensor {name}: span {}..{} past end of shard {} ({} bytes)",
                        span.offset,
                        span.offset + span.length,
                        span.shard,
                        shard.size
                    ));
                }
                Some(_) => {}
            }
        }

        tensors.insert(name, desc);
    }
    tensors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_manifest_json(total_size: u64) -> String {
        let zeros = "0".repeat(64);
        format!(
            r#"{{
                "version": 1,
                "modelId": "test-model",
                "architecture": {{
                    "layers": 2, "hiddenSize": 8, "intermediateSize": 16,
                    "numHeads": 2, "vocabSize": 16, "maxSeqLen": 64,
                    "ropeTheta": 10000.0
                }},
                "quantization": "F32",
                "shards": [
                    {{"index": 0, "filename": "shard_000.bin", "size": 100, "hash": "{zeros}", "offset": 0}},
                    {{"index": 1, "filename": "shard_001.bin", "size": 100, "hash": "{zeros}", "offset": 100}}
                ],
                "totalSize": {total_size},
                "modelHash": "{zeros}",
                "tensors": {{
                    "model.norm.weight": {{"shard": 0, "offset": 0, "length": 32, "shape": [8], "dtype": "F32"}}
                }}
            }}"#
        )
    }

    #[test]
    fn test_parse_minimal() {
        let m = Manifest::parse(&minimal_manifest_json(200)).unwrap();
        assert_eq!(m.model_id, "test-model");
        assert_eq!(m.architecture.num_kv_heads, 2); // defaulted to numHeads
        assert_eq!(m.architecture.head_dim, 4); // hidden / heads
        assert_eq!(m.shards.len(), 2);
        assert!(m.moe.is_none());
    }

    #[test]
    fn test_total_size_mismatch() {
        let err = Manifest::parse(&minimal_manifest_json(300)).unwrap_err();
        let EngineError::ManifestInvalid { reasons } = err else {
            panic!("expected ManifestInvalid");
        };
        assert!(
            reasons.iter().any(|r| r.contains("totalSize mismatch")),
            "reasons: {reasons:?}"
        );
    }

    #[test]
    fn test_unsupported_version() {
        let json = minimal_manifest_json(200).replace(r#""version": 1"#, r#""version": 99"#);
        let err = Manifest::parse(&json).unwrap_err();
        assert!(err.to_string().contains("unsupported manifest version 99"));
    }

    #[test]
    fn test_moe_top_k_bound() {
        let json = minimal_manifest_json(200).replace(
            r#""quantization": "F32""#,
            r#""moe": {"numExperts": 4, "topK": 8}, "quantization": "F32""#,
        );
        let err = Manifest::parse(&json).unwrap_err();
        assert!(err.to_string().contains("topK (8) exceeds"));
    }

    #[test]
    fn test_offset_discontinuity() {
        let json = minimal_manifest_json(200).replace(r#""offset": 100"#, r#""offset": 128"#);
        let err = Manifest::parse(&json).unwrap_err();
        assert!(err.to_string().contains("breaks contiguity"));
    }

    #[test]
    fn test_bad_hash_length() {
        let json = minimal_manifest_json(200).replace(&"0".repeat(64), "abcd");
        let err = Manifest::parse(&json).unwrap_err();
        assert!(err.to_string().contains("64 hex chars"));
    }

    #[test]
    fn test_tensor_length_check() {
        // 8-element F32 tensor must be 32 bytes; declare 16.
        let json = minimal_manifest_json(200).replace(r#""length": 32"#, r#""length": 16"#);
        let err = Manifest::parse(&json).unwrap_err();
        assert!(err.to_string().contains("does not match shape"));
    }
}
