//! Sparse Mixture-of-Experts feed-forward.
//!
//! A linear gate scores every routed expert per token, the top-k experts are
//! selected and each selected expert runs once over the batch of tokens routed to
//! it. Results are scattered back weighted by the token's original gate score and
//! added to the output of an always-active shared expert.

use std::cmp::Ordering;

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

use super::config::{MoeConfig, ScoreFunc};
use super::layers::GatedMlp;

/// A single routed expert: `w2(silu(w1(x)) * w3(x))`.
pub struct Expert {
    w1: Linear,
    w2: Linear,
    w3: Linear,
}

impl Expert {
    /// Create a `dim -> hidden_dim -> dim` expert.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w1: candle_nn::linear(dim, hidden_dim, vb.pp("w1"))?,
            w2: candle_nn::linear(hidden_dim, dim, vb.pp("w2"))?,
            w3: candle_nn::linear(dim, hidden_dim, vb.pp("w3"))?,
        })
    }
}

impl Module for Expert {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gated = candle_nn::ops::silu(&self.w1.forward(x)?)?;
        self.w2.forward(&(gated * self.w3.forward(x)?)?)
    }
}

/// Per-token expert selection for one batch of `N` tokens.
#[derive(Debug, Clone)]
pub struct Routing {
    /// Row-major `[N, top_k]` expert ids, best first.
    indices: Vec<u32>,
    /// `[N, top_k]` combination weights.
    weights: Tensor,
    /// Tokens routed to each expert.
    counts: Vec<usize>,
    top_k: usize,
}

impl Routing {
    /// Select experts from a `[N, n_experts]` score matrix.
    ///
    /// `selection_bias` (`[n_experts]`) is added to the scores for ranking only;
    /// the returned weights are always gathered from the unbiased `scores`. Ties
    /// rank the lower expert id first. Weights are multiplied by `route_scale`.
    ///
    /// # Errors
    /// Returns an error if `top_k` exceeds the expert count or tensor operations fail.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_scores(
        scores: &Tensor,
        selection_bias: Option<&Tensor>,
        top_k: usize,
        route_scale: f64,
    ) -> Result<Self> {
        let (n_tokens, n_experts) = scores.dims2()?;
        if top_k == 0 || top_k > n_experts {
            candle_core::bail!("top_k {top_k} must be in 1..={n_experts}");
        }

        let ranked = match selection_bias {
            Some(bias) => scores.broadcast_add(bias)?,
            None => scores.clone(),
        };
        let rows: Vec<Vec<f32>> = ranked.to_dtype(DType::F32)?.to_vec2()?;

        let mut indices = Vec::with_capacity(n_tokens * top_k);
        let mut counts = vec![0usize; n_experts];
        let mut order: Vec<usize> = Vec::with_capacity(n_experts);
        for row in &rows {
            order.clear();
            order.extend(0..n_experts);
            order.sort_by(|&a, &b| {
                row[b]
                    .partial_cmp(&row[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            for &expert in &order[..top_k] {
                counts[expert] += 1;
                indices.push(expert as u32);
            }
        }

        let index_tensor = Tensor::from_vec(indices.clone(), (n_tokens, top_k), scores.device())?;
        let mut weights = scores.contiguous()?.gather(&index_tensor, 1)?;
        if (route_scale - 1.0).abs() > f64::EPSILON {
            weights = (weights * route_scale)?;
        }

        Ok(Self {
            indices,
            weights,
            counts,
            top_k,
        })
    }

    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.indices.len() / self.top_k
    }

    #[must_use]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Experts selected for `token`, best first.
    #[must_use]
    pub fn token_experts(&self, token: usize) -> &[u32] {
        &self.indices[token * self.top_k..(token + 1) * self.top_k]
    }

    /// `[N, top_k]` combination weights aligned with [`Self::token_experts`].
    #[must_use]
    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    /// Number of tokens routed to each expert; sums to `N * top_k`.
    #[must_use]
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Token rows routed to `expert` and their flat `token * top_k + slot`
    /// positions in the weight matrix.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn assignments(&self, expert: usize) -> (Vec<u32>, Vec<u32>) {
        let capacity = self.counts.get(expert).copied().unwrap_or(0);
        let mut tokens = Vec::with_capacity(capacity);
        let mut slots = Vec::with_capacity(capacity);
        for (flat, &e) in self.indices.iter().enumerate() {
            if e as usize == expert {
                tokens.push((flat / self.top_k) as u32);
                slots.push(flat as u32);
            }
        }
        (tokens, slots)
    }
}

/// Gating network: linear `dim -> n_routed_experts` followed by the score function.
pub struct Gate {
    proj: Linear,
    score_func: ScoreFunc,
    top_k: usize,
    route_scale: f64,
    /// Load-balancing offset used for selection only.
    selection_bias: Option<Tensor>,
}

impl Gate {
    /// Create the gate.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, config: &MoeConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj: candle_nn::linear(dim, config.n_routed_experts, vb)?,
            score_func: config.score_func,
            top_k: config.n_activated_experts,
            route_scale: config.route_scale,
            selection_bias: None,
        })
    }

    /// Per-token expert scores, shape `[N, n_routed_experts]`.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn scores(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.proj.forward(x)?;
        match self.score_func {
            ScoreFunc::Softmax => candle_nn::ops::softmax_last_dim(&logits),
            ScoreFunc::Sigmoid => candle_nn::ops::sigmoid(&logits),
        }
    }

    /// Route a `[N, dim]` token batch.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn route(&self, x: &Tensor) -> Result<Routing> {
        let scores = self.scores(x)?;
        Routing::from_scores(
            &scores,
            self.selection_bias.as_ref(),
            self.top_k,
            self.route_scale,
        )
    }
}

/// Mixture-of-Experts layer: routed experts plus a shared expert.
pub struct MoeLayer {
    gate: Gate,
    experts: Vec<Expert>,
    shared_experts: GatedMlp,
    dim: usize,
}

impl MoeLayer {
    /// Create the layer.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, config: &MoeConfig, vb: VarBuilder) -> Result<Self> {
        let gate = Gate::new(dim, config, vb.pp("gate"))?;
        let experts = (0..config.n_routed_experts)
            .map(|i| Expert::new(dim, config.moe_inter_dim, vb.pp(format!("experts.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let shared_experts = GatedMlp::new(
            dim,
            config.moe_inter_dim * config.n_shared_experts,
            vb.pp("shared_experts"),
        )?;

        Ok(Self {
            gate,
            experts,
            shared_experts,
            dim,
        })
    }

    #[must_use]
    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    /// Install (or clear) a `[n_routed_experts]` selection bias.
    ///
    /// # Errors
    /// Returns an error if the bias has the wrong shape.
    pub fn set_selection_bias(&mut self, bias: Option<Tensor>) -> Result<()> {
        if let Some(bias) = &bias {
            let n = bias.dims1()?;
            if n != self.experts.len() {
                candle_core::bail!("selection bias has {n} entries, expected {}", self.experts.len());
            }
        }
        self.gate.selection_bias = bias;
        Ok(())
    }

    /// Routing decision for `x` (any shape ending in `dim`).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn route(&self, x: &Tensor) -> Result<Routing> {
        self.gate.route(&x.reshape(((), self.dim))?)
    }

    fn dispatch(&self, x: &Tensor, routing: &Routing, device: &Device) -> Result<Tensor> {
        let flat_weights = routing.weights().flatten_all()?;
        let mut routed = x.zeros_like()?;
        for (expert_idx, expert) in self.experts.iter().enumerate() {
            if routing.counts()[expert_idx] == 0 {
                continue;
            }
            let (tokens, slots) = routing.assignments(expert_idx);
            let n = tokens.len();
            let tokens = Tensor::from_vec(tokens, n, device)?;
            let slots = Tensor::from_vec(slots, n, device)?;

            let out = expert.forward(&x.index_select(&tokens, 0)?)?;
            let weight = flat_weights.index_select(&slots, 0)?.unsqueeze(1)?;
            routed = routed.index_add(&tokens, &out.broadcast_mul(&weight)?, 0)?;
        }
        Ok(routed)
    }
}

impl Module for MoeLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let shape = x.shape().clone();
        let x = x.reshape(((), self.dim))?;

        let routing = self.gate.route(&x)?;
        tracing::trace!(counts = ?routing.counts(), "moe dispatch");

        let shared = self.shared_experts.forward(&x)?;
        let routed = self.dispatch(&x, &routing, x.device())?;
        (shared + routed)?.reshape(shape)
    }
}
