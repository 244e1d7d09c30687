//! Speculative decoding: draft-and-verify with rejection sampling.
//!
//! A smaller draft model proposes `k` tokens autoregressively; the main
//! model verifies all of them in a single forward pass. Each draft token
//! is accepted with probability `min(1, p_main / p_draft)`; the first
//! rejection resamples from the normalized residual
//! `max(0, p_main - p_draft)`, which keeps the output distribution
//! identical to sampling from the main model alone. Rollback is by cache
//! truncation to the accepted length on both pipelines.

use tracing::debug;

use crate::config::GenerationOptions;
use crate::error::EngineResult;
use crate::kernels::cpu::softmax;
use crate::pipeline::engine::{recent_window, InferencePipeline};
use crate::sampler::{argmax, Sampler};

/// Draft/accept counters and derived diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecStats {
    pub drafted: u64,
    pub accepted: u64,
}

impl SpecStats {
    /// Fraction of drafted tokens the main model accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.drafted == 0 {
            return 0.0;
        }
        self.accepted as f64 / self.drafted as f64
    }

    /// Expected speedup for draft depth `k` given the per-draft-token
    /// overhead relative to a main-model step: `(1 + a*k) / (1 + o*k)`.
    pub fn estimated_speedup(&self, k: usize, overhead: f64) -> f64 {
        (1.0 + self.acceptance_rate() * k as f64) / (1.0 + overhead * k as f64)
    }
}

/// One accept-or-resample decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted,
    Rejected { resampled: usize },
}

/// Rejection-sampling rule for a single draft token.
///
/// `u_accept` and `u_resample` are uniform draws in `[0, 1)`; splitting
/// them out keeps the rule a pure function.
pub fn accept_or_resample(
    p_main: &[f32],
    p_draft: &[f32],
    token: usize,
    u_accept: f32,
    u_resample: f32,
) -> AcceptOutcome {
    let pm = p_main.get(token).copied().unwrap_or(0.0);
    let pd = p_draft.get(token).copied().unwrap_or(0.0);
    let ratio = if pd > 0.0 { (pm / pd).min(1.0) } else { 0.0 };
    if u_accept < ratio {
        return AcceptOutcome::Accepted;
    }

    // Residual distribution: the probability mass the draft under-served.
    let mut residual: Vec<f32> = p_main
        .iter()
        .zip(p_draft)
        .map(|(m, d)| (m - d).max(0.0))
        .collect();
    let sum: f32 = residual.iter().sum();
    let resampled = if sum > 0.0 {
        for r in &mut residual {
            *r /= sum;
        }
        draw_with(&residual, u_resample)
    } else {
        // Draft matches main exactly; any main draw is valid.
        draw_with(p_main, u_resample)
    };
    AcceptOutcome::Rejected { resampled }
}

/// Categorical draw from explicit probabilities at uniform position `u`.
fn draw_with(probs: &[f32], u: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

/// Next-token distribution used on both sides of verification:
/// repetition penalty, temperature, softmax. Near-greedy temperatures
/// collapse to a point mass so draft and main compare argmaxes.
fn distribution(logits: &[f32], history: &[u32], opts: &GenerationOptions) -> Vec<f32> {
    let mut scaled = logits.to_vec();
    Sampler::apply_repetition_penalty(
        &mut scaled,
        &recent_window(history, opts.repetition_window),
        opts.repetition_penalty,
    );

    if opts.temperature <= GenerationOptions::GREEDY_EPSILON {
        let mut point = vec![0.0; scaled.len()];
        point[argmax(&scaled)] = 1.0;
        return point;
    }
    for l in &mut scaled {
        *l /= opts.temperature;
    }
    softmax(&mut scaled);
    scaled
}

/// Drives draft-and-verify steps against a main/draft pipeline pair.
#[derive(Debug)]
pub struct SpeculativeDecoder {
    /// Tokens drafted per step.
    pub draft_tokens: usize,
    stats: SpecStats,
}

impl Default for SpeculativeDecoder {
    fn default() -> Self {
        Self {
            draft_tokens: 4,
            stats: SpecStats::default(),
        }
    }
}

impl SpeculativeDecoder {
    pub fn stats(&self) -> SpecStats {
        self.stats
    }

    /// One speculative step.
    ///
    /// Precondition: both caches hold the same processed prefix and
    /// `prev` is the latest sampled-but-unprocessed token. Returns at
    /// least one token: the accepted draft prefix plus the resampled (or
    /// bonus) token, which becomes the next `prev`.
    pub async fn step(
        &mut self,
        main: &mut InferencePipeline,
        draft: &mut InferencePipeline,
        prev: u32,
        generated: &[u32],
        opts: &GenerationOptions,
        sampler: &mut Sampler,
    ) -> EngineResult<Vec<u32>> {
        let k = self.draft_tokens.max(1);
        let base = main.cache().current_seq_len();
        debug_assert_eq!(base, draft.cache().current_seq_len());

        // Draft phase: k autoregressive proposals with their
        // distributions.
        let mut drafts: Vec<(u32, Vec<f32>)> = Vec::with_capacity(k);
        let mut history = generated.to_vec();
        let mut cur = prev;
        for _ in 0..k {
            let logits = draft.decode_step(cur).await?;
            let p = distribution(&logits, &history, opts);
            let token = sampler.draw(&p) as u32;
            history.push(token);
            drafts.push((token, p));
            cur = token;
        }

        // Verify phase: the main model scores every draft position in
        // one pass.
        let mut verify_tokens = vec![prev];
        verify_tokens.extend(drafts.iter().map(|(t, _)| *t));
        let all_logits = main.forward(&verify_tokens, base).await?;
        let vocab = main.architecture().vocab_size;

        let mut accepted: Vec<u32> = Vec::new();
        let mut history = generated.to_vec();
        let mut rejection: Option<u32> = None;
        for (i, (token, p_draft)) in drafts.iter().enumerate() {
            let row = &all_logits[i * vocab..(i + 1) * vocab];
            let p_main = distribution(row, &history, opts);
            self.stats.drafted += 1;

            match accept_or_resample(
                &p_main,
                p_draft,
                *token as usize,
                sampler.uniform(),
                sampler.uniform(),
            ) {
                AcceptOutcome::Accepted => {
                    self.stats.accepted += 1;
                    accepted.push(*token);
                    history.push(*token);
                }
                AcceptOutcome::Rejected { resampled } => {
                    rejection = Some(resampled as u32);
                    break;
                }
            }
        }

        match rejection {
            Some(resampled) => {
                // Roll both caches back to the accepted prefix; the
                // resampled token stays pending for the next step.
                let keep = base + 1 + accepted.len();
                main.cache_mut().truncate(keep);
                draft.cache_mut().truncate(keep);
                accepted.push(resampled);
            }
            None => {
                // Every draft accepted: bonus token from the position
                // after the last draft, and the draft cache catches up.
                let row = &all_logits[k * vocab..(k + 1) * vocab];
                let p_main = distribution(row, &history, opts);
                let bonus = sampler.draw(&p_main) as u32;
                let last_draft = drafts[k - 1].0;
                draft.decode_step(last_draft).await?;
                accepted.push(bonus);
            }
        }

        debug!(
            drafted = k,
            accepted = accepted.len(),
            acceptance_rate = self.stats.acceptance_rate(),
            "speculative step"
        );
        Ok(accepted)
    }
}
