//! Top-k expert routing.
//!
//! Routing projects hidden states through the learned gate to per-expert
//! logits, keeps the top-k experts per token, and softmaxes the selected
//! logits into routing weights. The execution plan groups token
//! assignments by expert so each active expert runs once per batch;
//! recombination scatters weighted expert outputs back into token order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::EngineResult;
use crate::kernels::cpu::softmax;
use crate::kernels::dispatcher::KernelDispatcher;

/// Per-token expert choices: `indices[t]` and `weights[t]` are the top-k
/// experts of token `t`, weights summing to 1.
#[derive(Debug, Clone)]
pub struct ExpertSelection {
    pub indices: Vec<Vec<usize>>,
    pub weights: Vec<Vec<f32>>,
}

impl ExpertSelection {
    pub fn tokens(&self) -> usize {
        self.indices.len()
    }
}

/// One token's slot in an expert's work list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenAssignment {
    pub token: usize,
    pub weight: f32,
}

/// Expert index → the tokens (and weights) routed to it, in token order.
pub type ExecutionPlan = BTreeMap<usize, Vec<TokenAssignment>>;

/// Router for one MoE model: holds the routing configuration and
/// per-expert utilization counters.
#[derive(Debug)]
pub struct MoeRouter {
    num_experts: usize,
    top_k: usize,
    utilization: Mutex<Vec<u64>>,
}

impl MoeRouter {
    pub fn new(num_experts: usize, top_k: usize) -> Self {
        debug_assert!(top_k <= num_experts);
        Self {
            num_experts,
            top_k,
            utilization: Mutex::new(vec![0; num_experts]),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Route `n` tokens of hidden states `[n, hidden]` through the gate
    /// matrix `[num_experts, hidden]`.
    pub fn route(
        &self,
        hidden: &[f32],
        n: usize,
        gate: &[f32],
        dispatcher: &KernelDispatcher,
    ) -> EngineResult<ExpertSelection> {
        let hidden_size = hidden.len() / n.max(1);
        let logits = dispatcher.matmul(hidden, gate, n, hidden_size, self.num_experts)?;

        let mut indices = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        let mut utilization = self.utilization.lock().expect("utilization poisoned");

        for t in 0..n {
            let row = &logits[t * self.num_experts..(t + 1) * self.num_experts];

            // Top-k indices by descending logit; stable on ties.
            let mut order: Vec<usize> = (0..self.num_experts).collect();
            order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal));
            order.truncate(self.top_k);

            // Softmax over the selected logits, then renormalize to absorb
            // rounding.
            let mut selected: Vec<f32> = order.iter().map(|&e| row[e]).collect();
            softmax(&mut selected);
            let sum: f32 = selected.iter().sum();
            if sum > 0.0 {
                for w in &mut selected {
                    *w /= sum;
                }
            }

            for &e in &order {
                utilization[e] += 1;
            }
            indices.push(order);
            weights.push(selected);
        }

        debug!(tokens = n, top_k = self.top_k, "tokens routed");
        Ok(ExpertSelection { indices, weights })
    }

    /// Group assignments by expert. Every token appears in exactly top-k
    /// entries across the plan.
    pub fn execution_plan(&self, selection: &ExpertSelection) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new();
        for (token, (experts, weights)) in selection
            .indices
            .iter()
            .zip(&selection.weights)
            .enumerate()
        {
            for (&expert, &weight) in experts.iter().zip(weights) {
                plan.entry(expert)
                    .or_default()
                    .push(TokenAssignment { token, weight });
            }
        }
        plan
    }

    /// Scatter weighted expert outputs back into `[n, hidden]` token
    /// order. `outputs[&e]` holds expert `e`'s rows in the same order as
    /// the plan's assignment list for `e`.
    pub fn combine(
        &self,
        outputs: &BTreeMap<usize, Vec<f32>>,
        plan: &ExecutionPlan,
        n: usize,
        hidden_size: usize,
    ) -> Vec<f32> {
        let mut combined = vec![0.0f32; n * hidden_size];
        for (expert, assignments) in plan {
            let Some(rows) = outputs.get(expert) else {
                continue;
            };
            for (i, assignment) in assignments.iter().enumerate() {
                let row = &rows[i * hidden_size..(i + 1) * hidden_size];
                let out = &mut combined
                    [assignment.token * hidden_size..(assignment.token + 1) * hidden_size];
                for (o, r) in out.iter_mut().zip(row) {
                    *o += assignment.weight * r;
                }
            }
        }
        combined
    }

    /// Tokens routed to each expert so far (diagnostics).
    pub fn utilization(&self) -> Vec<u64> {
        self.utilization.lock().expect("utilization poisoned").clone()
    }
}
