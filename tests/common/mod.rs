//! Shared test fixtures: a tiny synthetic sharded model and an
//! in-memory transport.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use moe_edge::error::{EngineError, EngineResult};
use moe_edge::store::shard_store::ShardStore;
use moe_edge::tokenizer::{SpecialTokens, Tokenizer};
use moe_edge::transport::ShardTransport;

/// A synthetic model: manifest JSON plus shard bytes.
pub struct SynthModel {
    pub model_id: String,
    pub manifest_json: String,
    pub shards: Vec<Vec<u8>>,
}

const HIDDEN: usize = 8;
const INTER: usize = 16;
const LAYERS: usize = 2;
const HEADS: usize = 2;
const VOCAB: usize = 16;
const MAX_SEQ: usize = 32;
const EXPERTS: usize = 4;

/// Deterministic small weight values.
fn weight_values(seed: u64, n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let x = seed.wrapping_mul(6364136223846793005).wrapping_add((i as u64).wrapping_mul(1442695040888963407));
            ((x >> 33) % 2000) as f32 / 2000.0 - 0.5
        })
        .map(|v| v * 0.2)
        .collect()
}

fn le_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Build a 2-layer toy model. With `moe`, layer 1 becomes a 4-expert
/// top-2 MoE layer. One shard boundary cuts through the embedding
/// tensor, so multi-span assembly is always exercised.
pub fn synth_model(model_id: &str, moe: bool) -> SynthModel {
    let mut tensors: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::new();
    let mut seed = 1u64;
    let mut push = |tensors: &mut Vec<(String, Vec<usize>, Vec<f32>)>, name: String, shape: Vec<usize>| {
        let n = shape.iter().product();
        seed += 1;
        tensors.push((name, shape, weight_values(seed, n)));
    };

    push(&mut tensors, "model.embed_tokens.weight".into(), vec![VOCAB, HIDDEN]);
    for l in 0..LAYERS {
        let p = |s: &str| format!("model.layers.{l}.{s}");
        push(&mut tensors, p("input_layernorm.weight"), vec![HIDDEN]);
        push(&mut tensors, p("self_attn.q_proj.weight"), vec![HIDDEN, HIDDEN]);
        push(&mut tensors, p("self_attn.k_proj.weight"), vec![HIDDEN, HIDDEN]);
        push(&mut tensors, p("self_attn.v_proj.weight"), vec![HIDDEN, HIDDEN]);
        push(&mut tensors, p("self_attn.o_proj.weight"), vec![HIDDEN, HIDDEN]);
        push(&mut tensors, p("post_attention_layernorm.weight"), vec![HIDDEN]);
        if moe && l == 1 {
            push(&mut tensors, p("mlp.gate.weight"), vec![EXPERTS, HIDDEN]);
            for e in 0..EXPERTS {
                let ep = |s: &str| format!("model.layers.{l}.mlp.experts.{e}.{s}");
                push(&mut tensors, ep("gate_proj.weight"), vec![INTER, HIDDEN]);
                push(&mut tensors, ep("up_proj.weight"), vec![INTER, HIDDEN]);
                push(&mut tensors, ep("down_proj.weight"), vec![HIDDEN, INTER]);
            }
        } else {
            push(&mut tensors, p("mlp.gate_proj.weight"), vec![INTER, HIDDEN]);
            push(&mut tensors, p("mlp.up_proj.weight"), vec![INTER, HIDDEN]);
            push(&mut tensors, p("mlp.down_proj.weight"), vec![HIDDEN, INTER]);
        }
    }
    push(&mut tensors, "model.norm.weight".into(), vec![HIDDEN]);
    push(&mut tensors, "lm_head.weight".into(), vec![VOCAB, HIDDEN]);

    // Serialize all tensors into one image, then cut it into two shards
    // through the middle of the first tensor.
    let mut image = Vec::new();
    let mut offsets = Vec::new();
    for (_, _, values) in &tensors {
        offsets.push(image.len() as u64);
        image.extend(le_bytes(values));
    }
    let cut = 100u64; // inside the embedding tensor
    let shard_bytes = vec![image[..cut as usize].to_vec(), image[cut as usize..].to_vec()];

    let locate = |offset: u64, length: u64| -> serde_json::Value {
        if offset + length <= cut {
            json!({"shard": 0, "offset": offset, "length": length})
        } else if offset >= cut {
            json!({"shard": 1, "offset": offset - cut, "length": length})
        } else {
            json!({"spans": [
                {"shard": 0, "offset": offset, "length": cut - offset},
                {"shard": 1, "offset": 0, "length": length - (cut - offset)},
            ]})
        }
    };

    let mut tensor_table = serde_json::Map::new();
    for ((name, shape, values), offset) in tensors.iter().zip(&offsets) {
        let length = values.len() as u64 * 4;
        let mut entry = locate(*offset, length);
        entry["shape"] = json!(shape);
        entry["dtype"] = json!("F32");
        tensor_table.insert(name.clone(), entry);
    }

    let shard_records: Vec<serde_json::Value> = shard_bytes
        .iter()
        .enumerate()
        .scan(0u64, |offset, (i, bytes)| {
            let record = json!({
                "index": i,
                "filename": format!("shard_{i:03}.bin"),
                "size": bytes.len(),
                "hash": blake3_hex(bytes),
                "offset": *offset,
            });
            *offset += bytes.len() as u64;
            Some(record)
        })
        .collect();

    let mut manifest = json!({
        "version": 1,
        "modelId": model_id,
        "architecture": {
            "layers": LAYERS,
            "hiddenSize": HIDDEN,
            "intermediateSize": INTER,
            "numHeads": HEADS,
            "vocabSize": VOCAB,
            "maxSeqLen": MAX_SEQ,
            "ropeTheta": 10000.0,
        },
        "quantization": "F32",
        "shards": shard_records,
        "totalSize": image.len(),
        "modelHash": blake3_hex(&image),
        "tensors": tensor_table,
    });
    if moe {
        manifest["moe"] = json!({
            "numExperts": EXPERTS,
            "topK": 2,
            "expertShardMap": {},
        });
    }

    SynthModel {
        model_id: model_id.to_string(),
        manifest_json: serde_json::to_string_pretty(&manifest).unwrap(),
        shards: shard_bytes,
    }
}

fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Install a synthetic model straight into a store, bypassing download.
pub async fn install(model: &SynthModel, store: &ShardStore) {
    store
        .save_manifest(&model.model_id, &model.manifest_json)
        .await
        .unwrap();
    for (i, bytes) in model.shards.iter().enumerate() {
        store
            .write_shard(&model.model_id, i as u32, bytes, None)
            .await
            .unwrap();
    }
}

/// Tokenizer over a 16-token vocabulary: byte `b` maps to `b % 14 + 2`.
/// The eos id is outside the vocabulary so generations never stop early.
#[derive(Debug, Clone, Default)]
pub struct TestTokenizer;

impl Tokenizer for TestTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| (b % 14) as u32 + 2).collect()
    }

    fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .map(|&id| (b'a' + (id % 26) as u8) as char)
            .collect()
    }

    fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            bos: None,
            eos: 99,
            pad: None,
        }
    }
}

/// In-memory transport serving a synthetic model, with per-URL failure
/// injection and call counting.
pub struct FakeTransport {
    files: HashMap<String, Bytes>,
    pub calls: AtomicUsize,
    failing: Mutex<HashMap<String, usize>>,
}

impl FakeTransport {
    pub fn serving(model: &SynthModel, base_url: &str) -> Self {
        let mut files = HashMap::new();
        files.insert(
            format!("{base_url}/manifest.json"),
            Bytes::from(model.manifest_json.clone()),
        );
        for (i, bytes) in model.shards.iter().enumerate() {
            files.insert(
                format!("{base_url}/shard_{i:03}.bin"),
                Bytes::from(bytes.clone()),
            );
        }
        Self {
            files,
            calls: AtomicUsize::new(0),
            failing: Mutex::new(HashMap::new()),
        }
    }

    /// Make `url` fail its next `times` fetches.
    pub fn fail_next(&self, url: &str, times: usize) {
        self.failing.lock().unwrap().insert(url.to_string(), times);
    }

    /// Replace a served file (e.g. corrupt a shard).
    pub fn corrupt(&mut self, url: &str, bytes: Vec<u8>) {
        self.files.insert(url.to_string(), Bytes::from(bytes));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn serve(&self, url: &str) -> EngineResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failing = self.failing.lock().unwrap();
            if let Some(remaining) = failing.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::TransportFailure {
                        attempts: 1,
                        reason: format!("injected failure for {url}"),
                    });
                }
            }
        }
        self.files
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::TransportFailure {
                attempts: 1,
                reason: format!("404 {url}"),
            })
    }
}

#[async_trait]
impl ShardTransport for FakeTransport {
    async fn fetch_range(&self, url: &str, offset: u64, length: u64) -> EngineResult<Bytes> {
        let body = self.serve(url)?;
        let end = (offset + length).min(body.len() as u64);
        Ok(body.slice(offset as usize..end as usize))
    }

    async fn fetch(&self, url: &str) -> EngineResult<Bytes> {
        self.serve(url)
    }
}
