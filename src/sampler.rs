//! Token sampling.
//!
//! Logits flow through temperature scaling, softmax, top-k, then top-p
//! (nucleus) filtering before a categorical draw. The RNG is seeded per
//! generation, so a fixed seed reproduces the token sequence exactly.
//! Near-zero temperatures short-circuit to argmax.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::GenerationOptions;
use crate::kernels::cpu::softmax;

/// Seeded categorical sampler.
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Sample a token id from raw logits under the given options.
    pub fn sample(&mut self, logits: &[f32], opts: &GenerationOptions) -> usize {
        if opts.temperature <= GenerationOptions::GREEDY_EPSILON {
            return argmax(logits);
        }

        let mut scaled: Vec<f32> = if (opts.temperature - 1.0).abs() > f32::EPSILON {
            logits.iter().map(|l| l / opts.temperature).collect()
        } else {
            logits.to_vec()
        };
        softmax(&mut scaled);

        let mut candidates: Vec<(usize, f32)> =
            scaled.iter().copied().enumerate().collect();
        filter_top_k(&mut candidates, opts.top_k);
        filter_top_p(&mut candidates, opts.top_p);

        let u: f32 = self.rng.gen();
        pick(&candidates, u)
    }

    /// One uniform draw in `[0, 1)` from the session RNG.
    pub fn uniform(&mut self) -> f32 {
        self.rng.gen()
    }

    /// Categorical draw from an explicit probability vector.
    pub fn draw(&mut self, probs: &[f32]) -> usize {
        let u: f32 = self.rng.gen();
        pick_probs(probs, u)
    }

    /// Dampen logits of recently generated tokens: positive logits divide
    /// by the penalty, negative ones multiply.
    pub fn apply_repetition_penalty(logits: &mut [f32], recent: &[usize], penalty: f32) {
        if (penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        for &token in recent {
            if let Some(logit) = logits.get_mut(token) {
                if *logit > 0.0 {
                    *logit /= penalty;
                } else {
                    *logit *= penalty;
                }
            }
        }
    }
}

/// Index of the largest logit.
pub fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Keep the `k` most probable candidates and renormalize. `k == 0`
/// disables the filter.
fn filter_top_k(candidates: &mut Vec<(usize, f32)>, k: usize) {
    if k == 0 || candidates.len() <= k {
        return;
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(k);
    renormalize(candidates);
}

/// Keep the smallest probability-sorted prefix whose cumulative mass
/// reaches `p`, then renormalize.
fn filter_top_p(candidates: &mut Vec<(usize, f32)>, p: f32) {
    if p >= 1.0 || candidates.is_empty() {
        return;
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut cumulative = 0.0f32;
    let mut keep = candidates.len();
    for (i, (_, prob)) in candidates.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep);
    renormalize(candidates);
}

fn renormalize(candidates: &mut [(usize, f32)]) {
    let sum: f32 = candidates.iter().map(|(_, p)| p).sum();
    if sum > 0.0 {
        for (_, p) in candidates.iter_mut() {
            *p /= sum;
        }
    }
}

/// Draw from a dense probability vector at uniform position `u`.
fn pick_probs(probs: &[f32], u: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if u < cumulative {
            return i;
        }
    }
    probs.len().saturating_sub(1)
}

/// Categorical draw: the token at the smallest cumulative bound >= `u`.
/// Rounding that pushes `u` past the total falls back to the last
/// candidate.
fn pick(candidates: &[(usize, f32)], u: f32) -> usize {
    let mut cumulative = 0.0f32;
    for &(token, prob) in candidates {
        cumulative += prob;
        if u < cumulative {
            return token;
        }
    }
    candidates.last().map(|&(token, _)| token).unwrap_or(0)
}
