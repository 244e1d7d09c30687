//! Forward pass and generation loop.
//!
//! The pipeline owns the KV cache and borrows weights from the loader.
//! Prefill runs the whole prompt in one pass; each decode step processes a
//! single token against the accumulated cache. MoE layers route through
//! the expert planner and hydrate experts lazily. Generated tokens stream
//! to the caller over an mpsc channel: `Token` events as they decode, one
//! `Done` (or `Error`) at the end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::kv::KvCache;
use crate::cancel::CancelToken;
use crate::config::GenerationOptions;
use crate::error::{EngineError, EngineResult};
use crate::kernels::cpu::AttentionShape;
use crate::kernels::dispatcher::KernelDispatcher;
use crate::manifest::{Architecture, Manifest};
use crate::moe::router::MoeRouter;
use crate::sampler::Sampler;
use crate::speculative::{SpecStats, SpeculativeDecoder};
use crate::tensor::loader::{
    DeviceTensor, FfnWeights, LayerWeights, LoadProgress, ModelWeights, TensorLoader,
};
use crate::tokenizer::Tokenizer;

/// Events streamed during one generation.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token with its detokenized text fragment.
    Token { token_id: u32, text: String },
    /// Generation is complete.
    Done {
        total_tokens: usize,
        prompt_tokens: usize,
        completion_tokens: usize,
        stats: GenerationStats,
    },
    /// An error occurred during generation.
    Error(String),
}

/// Timing and throughput of one generation.
#[derive(Debug, Clone, Default)]
pub struct GenerationStats {
    pub prefill_ms: f64,
    pub decode_ms: f64,
    pub tokens_per_sec: f64,
    pub speculative: Option<SpecStats>,
}

/// The autoregressive inference pipeline for one model.
pub struct InferencePipeline {
    manifest: Arc<Manifest>,
    weights: ModelWeights,
    loader: Arc<TensorLoader>,
    dispatcher: Arc<KernelDispatcher>,
    router: Option<MoeRouter>,
    cache: KvCache,
    strict_weights: bool,
}

impl InferencePipeline {
    pub fn new(
        manifest: Arc<Manifest>,
        weights: ModelWeights,
        loader: Arc<TensorLoader>,
        dispatcher: Arc<KernelDispatcher>,
        cache: KvCache,
        strict_weights: bool,
    ) -> Self {
        let router = manifest
            .moe
            .as_ref()
            .map(|moe| MoeRouter::new(moe.num_experts, moe.top_k));
        Self {
            manifest,
            weights,
            loader,
            dispatcher,
            router,
            cache,
            strict_weights,
        }
    }

    /// Materialize the resident weight set through the loader, layer by
    /// layer.
    ///
    /// The loader reports a missing tensor as `NotFound`; the fallback
    /// decision is made here. With `strict` the error propagates;
    /// otherwise the weight is logged and zero-filled so decoding makes
    /// progress on incompletely migrated models.
    pub async fn load_weights(
        loader: &TensorLoader,
        strict: bool,
        on_progress: Option<&(dyn Fn(LoadProgress) + Send + Sync)>,
        cancel: &CancelToken,
    ) -> EngineResult<ModelWeights> {
        let manifest = loader.manifest();
        let arch = &manifest.architecture;
        let total_layers = arch.layers;
        let progress = |stage: &'static str, layer: usize| {
            if let Some(cb) = on_progress {
                cb(LoadProgress {
                    stage,
                    layer,
                    total_layers,
                });
            }
        };

        progress("embedding", 0);
        let embed = fetch_or_zeros(
            loader,
            strict,
            "model.embed_tokens.weight",
            &[arch.vocab_size, arch.hidden_size],
        )
        .await?;

        let q_dim = arch.num_heads * arch.head_dim;
        let kv_dim = arch.num_kv_heads * arch.head_dim;
        let mut layers = Vec::with_capacity(total_layers);
        for l in 0..total_layers {
            cancel.check()?;
            let p = |suffix: &str| format!("model.layers.{l}.{suffix}");

            let ffn = if manifest.is_moe_layer(l) {
                let moe = manifest.moe.as_ref().expect("moe layer without moe record");
                FfnWeights::Moe {
                    router: fetch_or_zeros(
                        loader,
                        strict,
                        &p("mlp.gate.weight"),
                        &[moe.num_experts, arch.hidden_size],
                    )
                    .await?,
                }
            } else {
                FfnWeights::Dense {
                    gate: fetch_or_zeros(
                        loader,
                        strict,
                        &p("mlp.gate_proj.weight"),
                        &[arch.intermediate_size, arch.hidden_size],
                    )
                    .await?,
                    up: fetch_or_zeros(
                        loader,
                        strict,
                        &p("mlp.up_proj.weight"),
                        &[arch.intermediate_size, arch.hidden_size],
                    )
                    .await?,
                    down: fetch_or_zeros(
                        loader,
                        strict,
                        &p("mlp.down_proj.weight"),
                        &[arch.hidden_size, arch.intermediate_size],
                    )
                    .await?,
                }
            };

            layers.push(LayerWeights {
                input_norm: fetch_or_zeros(
                    loader,
                    strict,
                    &p("input_layernorm.weight"),
                    &[arch.hidden_size],
                )
                .await?,
                q_proj: fetch_or_zeros(
                    loader,
                    strict,
                    &p("self_attn.q_proj.weight"),
                    &[q_dim, arch.hidden_size],
                )
                .await?,
                k_proj: fetch_or_zeros(
                    loader,
                    strict,
                    &p("self_attn.k_proj.weight"),
                    &[kv_dim, arch.hidden_size],
                )
                .await?,
                v_proj: fetch_or_zeros(
                    loader,
                    strict,
                    &p("self_attn.v_proj.weight"),
                    &[kv_dim, arch.hidden_size],
                )
                .await?,
                o_proj: fetch_or_zeros(
                    loader,
                    strict,
                    &p("self_attn.o_proj.weight"),
                    &[arch.hidden_size, q_dim],
                )
                .await?,
                post_norm: fetch_or_zeros(
                    loader,
                    strict,
                    &p("post_attention_layernorm.weight"),
                    &[arch.hidden_size],
                )
                .await?,
                ffn,
            });
            progress("layer", l + 1);
        }

        progress("final", total_layers);
        let final_norm =
            fetch_or_zeros(loader, strict, "model.norm.weight", &[arch.hidden_size]).await?;
        let lm_head = fetch_or_zeros(
            loader,
            strict,
            "lm_head.weight",
            &[arch.vocab_size, arch.hidden_size],
        )
        .await?;

        info!(
            model_id = %manifest.model_id,
            layers = total_layers,
            "resident weights loaded"
        );
        Ok(ModelWeights {
            embed,
            layers,
            final_norm,
            lm_head,
        })
    }

    pub fn architecture(&self) -> &Architecture {
        &self.manifest.architecture
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut KvCache {
        &mut self.cache
    }

    pub fn router(&self) -> Option<&MoeRouter> {
        self.router.as_ref()
    }

    /// Clear generation state for a fresh sequence.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Gather embedding rows for a token batch: `[n, hidden]`.
    fn embed(&self, tokens: &[u32]) -> Vec<f32> {
        let hidden = self.manifest.architecture.hidden_size;
        let vocab = self.manifest.architecture.vocab_size;
        let mut x = vec![0.0f32; tokens.len() * hidden];
        for (t, &id) in tokens.iter().enumerate() {
            let id = id as usize;
            if id < vocab {
                x[t * hidden..(t + 1) * hidden]
                    .copy_from_slice(&self.weights.embed[id * hidden..(id + 1) * hidden]);
            } else {
                warn!(token = id, vocab, "token id out of vocabulary, embedding zeros");
            }
        }
        x
    }

    /// Run `tokens` through every layer starting at sequence position
    /// `start_pos`; returns logits for every input position,
    /// `[n, vocab]`.
    pub async fn forward(&mut self, tokens: &[u32], start_pos: usize) -> EngineResult<Vec<f32>> {
        let arch = self.manifest.architecture.clone();
        let n = tokens.len();
        let hidden = arch.hidden_size;
        let q_dim = arch.num_heads * arch.head_dim;
        let kv_dim = arch.num_kv_heads * arch.head_dim;

        let mut x = self.embed(tokens);

        for l in 0..arch.layers {
            let layer = &self.weights.layers[l];

            // Attention block.
            let normed = self.dispatcher.rmsnorm(&x, &layer.input_norm, n)?;
            let mut q = self.dispatcher.matmul(&normed, &layer.q_proj, n, hidden, q_dim)?;
            let mut k = self.dispatcher.matmul(&normed, &layer.k_proj, n, hidden, kv_dim)?;
            let v = self.dispatcher.matmul(&normed, &layer.v_proj, n, hidden, kv_dim)?;
            drop(normed);

            self.dispatcher.rope(
                &mut q,
                n,
                arch.num_heads,
                arch.head_dim,
                start_pos,
                arch.rope_theta,
                arch.max_seq_len,
            )?;
            self.dispatcher.rope(
                &mut k,
                n,
                arch.num_kv_heads,
                arch.head_dim,
                start_pos,
                arch.rope_theta,
                arch.max_seq_len,
            )?;

            self.cache.update(l, &k, &v, start_pos)?;
            drop(k);
            drop(v);

            let kv_len = self.cache.fill(l);
            let attn = {
                let (keys, vals) = self.cache.get(l, 0, kv_len);
                self.dispatcher.attention(
                    &q,
                    &keys,
                    &vals,
                    AttentionShape {
                        q_tokens: n,
                        kv_len,
                        num_heads: arch.num_heads,
                        num_kv_heads: arch.num_kv_heads,
                        head_dim: arch.head_dim,
                        causal_offset: kv_len - n,
                    },
                )?
            };
            drop(q);

            let attn_out = self.dispatcher.matmul(&attn, &layer.o_proj, n, q_dim, hidden)?;
            drop(attn);
            for (xi, ai) in x.iter_mut().zip(attn_out.iter()) {
                *xi += ai;
            }
            drop(attn_out);

            // Feed-forward block.
            let normed = self.dispatcher.rmsnorm(&x, &layer.post_norm, n)?;
            let ffn_out = match &layer.ffn {
                FfnWeights::Dense { gate, up, down } => {
                    let inter = arch.intermediate_size;
                    let g = self.dispatcher.matmul(&normed, gate, n, hidden, inter)?;
                    let u = self.dispatcher.matmul(&normed, up, n, hidden, inter)?;
                    let activated = self.dispatcher.silu_gated(&g, &u)?;
                    drop(g);
                    drop(u);
                    let out = self.dispatcher.matmul(&activated, down, n, inter, hidden)?;
                    out.to_vec()
                }
                FfnWeights::Moe { router: gate } => {
                    self.moe_forward(l, &normed, n, gate).await?
                }
            };
            drop(normed);

            for (xi, fi) in x.iter_mut().zip(&ffn_out) {
                *xi += fi;
            }
        }

        let normed = self.dispatcher.rmsnorm(&x, &self.weights.final_norm, n)?;
        let logits = self
            .dispatcher
            .matmul(&normed, &self.weights.lm_head, n, hidden, arch.vocab_size)?;
        Ok(logits.to_vec())
    }

    /// MoE feed-forward: route, run each active expert over its token
    /// group, recombine weighted outputs.
    async fn moe_forward(
        &self,
        layer: usize,
        normed: &[f32],
        n: usize,
        gate: &crate::tensor::loader::DeviceTensor,
    ) -> EngineResult<Vec<f32>> {
        let arch = &self.manifest.architecture;
        let hidden = arch.hidden_size;
        let inter = arch.intermediate_size;
        let router = self
            .router
            .as_ref()
            .expect("moe layer reached without router");

        let selection = router.route(normed, n, gate, &self.dispatcher)?;
        let plan = router.execution_plan(&selection);

        let mut outputs: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        for (&expert, assignments) in &plan {
            // The loader reports missing experts as NotFound; in lenient
            // mode the expert contributes zeros for this call.
            let weights = match self.loader.load_expert(layer, expert).await {
                Ok(w) => w,
                Err(EngineError::NotFound(what)) if !self.strict_weights => {
                    warn!(layer, expert, missing = %what, "expert weights missing, contributing zeros");
                    outputs.insert(expert, vec![0.0; assignments.len() * hidden]);
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Gather this expert's token rows.
            let mut rows = vec![0.0f32; assignments.len() * hidden];
            for (i, a) in assignments.iter().enumerate() {
                rows[i * hidden..(i + 1) * hidden]
                    .copy_from_slice(&normed[a.token * hidden..(a.token + 1) * hidden]);
            }

            let m = assignments.len();
            let g = self.dispatcher.matmul(&rows, &weights.gate, m, hidden, inter)?;
            let u = self.dispatcher.matmul(&rows, &weights.up, m, hidden, inter)?;
            let activated = self.dispatcher.silu_gated(&g, &u)?;
            drop(g);
            drop(u);
            let out = self.dispatcher.matmul(&activated, &weights.down, m, inter, hidden)?;
            outputs.insert(expert, out.to_vec());
        }

        Ok(router.combine(&outputs, &plan, n, hidden))
    }

    /// Process the whole prompt; returns logits at the last position.
    pub async fn prefill(&mut self, tokens: &[u32]) -> EngineResult<Vec<f32>> {
        debug!(prompt_tokens = tokens.len(), "prefill");
        let logits = self.forward(tokens, 0).await?;
        let vocab = self.manifest.architecture.vocab_size;
        Ok(logits[(tokens.len() - 1) * vocab..].to_vec())
    }

    /// Process one token at the cache cursor; returns next-token logits.
    pub async fn decode_step(&mut self, token: u32) -> EngineResult<Vec<f32>> {
        let pos = self.cache.current_seq_len();
        self.forward(&[token], pos).await
    }
}

/// Load one resident tensor, zero-filling a `NotFound` in lenient mode.
async fn fetch_or_zeros(
    loader: &TensorLoader,
    strict: bool,
    name: &str,
    shape: &[usize],
) -> EngineResult<DeviceTensor> {
    match loader.load_device(name).await {
        Err(EngineError::NotFound(_)) if !strict => {
            warn!(tensor = name, "weight missing, substituting zeros");
            let elements = shape.iter().product();
            Ok(DeviceTensor {
                data: loader.pool().acquire(elements, "weight"),
                shape: shape.to_vec(),
            })
        }
        other => other,
    }
}

/// Drive one full generation, streaming events into `tx`.
///
/// Returns the generated token ids (also streamed); errors are both sent
/// as events and returned.
pub async fn run_generation(
    pipeline: &mut InferencePipeline,
    mut draft: Option<&mut InferencePipeline>,
    tokenizer: &dyn Tokenizer,
    prompt: &str,
    opts: &GenerationOptions,
    cancel: &CancelToken,
    tx: &mpsc::Sender<GenerationEvent>,
) -> EngineResult<Vec<u32>> {
    let specials = tokenizer.special_tokens();
    let mut prompt_ids = tokenizer.encode(prompt);
    if let Some(bos) = specials.bos {
        prompt_ids.insert(0, bos);
    }
    if prompt_ids.is_empty() {
        prompt_ids.push(specials.eos);
    }

    pipeline.reset();
    let speculative = opts.use_speculative && draft.is_some();
    let mut spec = SpeculativeDecoder::default();

    let prefill_start = Instant::now();
    let mut logits = pipeline.prefill(&prompt_ids).await?;
    if let (true, Some(d)) = (speculative, draft.as_deref_mut()) {
        d.reset();
        d.prefill(&prompt_ids).await?;
    }
    let prefill_ms = prefill_start.elapsed().as_secs_f64() * 1e3;

    let mut sampler = Sampler::new(opts.seed);
    let mut generated: Vec<u32> = Vec::new();
    let mut text_so_far = String::new();
    let decode_start = Instant::now();

    'outer: while generated.len() < opts.max_tokens {
        cancel.check()?;

        let step_tokens: Vec<u32> = if speculative && !generated.is_empty() {
            let d = draft.as_deref_mut().expect("speculative without draft");
            let prev = *generated.last().expect("non-empty generated");
            spec.step(pipeline, d, prev, &generated, opts, &mut sampler)
                .await?
        } else {
            // Plain single-token step: penalize, sample, advance.
            Sampler::apply_repetition_penalty(
                &mut logits,
                &recent_window(&generated, opts.repetition_window),
                opts.repetition_penalty,
            );
            vec![sampler.sample(&logits, opts) as u32]
        };

        for token in step_tokens {
            if token == specials.eos {
                debug!("eos reached");
                break 'outer;
            }
            generated.push(token);

            let full = tokenizer.decode(&generated);
            let fragment = full[text_so_far.len()..].to_string();
            text_so_far = full;
            if tx
                .send(GenerationEvent::Token {
                    token_id: token,
                    text: fragment,
                })
                .await
                .is_err()
            {
                // Receiver dropped, stop generating.
                break 'outer;
            }

            if hits_stop_sequence(&text_so_far, &opts.stop_sequences) {
                debug!("stop sequence reached");
                break 'outer;
            }
            if generated.len() >= opts.max_tokens {
                break 'outer;
            }
        }

        if !speculative {
            let next = *generated.last().expect("sampled token pushed above");
            logits = pipeline.decode_step(next).await?;
        }
    }

    let decode_ms = decode_start.elapsed().as_secs_f64() * 1e3;
    let stats = GenerationStats {
        prefill_ms,
        decode_ms,
        tokens_per_sec: if decode_ms > 0.0 {
            generated.len() as f64 / (decode_ms / 1e3)
        } else {
            0.0
        },
        speculative: speculative.then(|| spec.stats()),
    };

    info!(
        prompt_tokens = prompt_ids.len(),
        completion_tokens = generated.len(),
        "generation complete"
    );
    let _ = tx
        .send(GenerationEvent::Done {
            total_tokens: prompt_ids.len() + generated.len(),
            prompt_tokens: prompt_ids.len(),
            completion_tokens: generated.len(),
            stats,
        })
        .await;
    Ok(generated)
}

/// The trailing `window` generated tokens, as sampler indices.
pub(crate) fn recent_window(generated: &[u32], window: usize) -> Vec<usize> {
    let start = generated.len().saturating_sub(window);
    generated[start..].iter().map(|&t| t as usize).collect()
}

/// Whether any stop substring appears in the freshly grown suffix.
fn hits_stop_sequence(text: &str, stops: &[String]) -> bool {
    stops.iter().any(|s| !s.is_empty() && text.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_window() {
        let generated = vec![1, 2, 3, 4, 5];
        assert_eq!(recent_window(&generated, 3), vec![3, 4, 5]);
        assert_eq!(recent_window(&generated, 10).len(), 5);
    }

    #[test]
    fn test_stop_sequence_suffix() {
        assert!(hits_stop_sequence("hello\n\n", &["\n\n".to_string()]));
        assert!(!hits_stop_sequence("hello\n", &["\n\n".to_string()]));
        assert!(!hits_stop_sequence("hello", &[]));
    }
}
