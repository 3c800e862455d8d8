use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How absolute position enters the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEncoding {
    /// Learned position table added to the token embeddings.
    Learned,
    /// Rotary angles applied to queries and keys inside attention.
    Rotary,
}

/// Normalization used by every block and the final norm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

/// Placement of normalization relative to the residual add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualLayout {
    /// `x + Dropout(f(Norm(x)))`
    PreNorm,
    /// `Dropout(Norm(f(x) + x))`
    PostNorm,
}

/// Dense feed-forward shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FeedForwardConfig {
    /// dim -> hidden_dim -> GELU -> dim
    Plain { hidden_dim: usize },
    /// SwiGLU: down(silu(gate(x)) * up(x))
    Gated { hidden_dim: usize },
    /// Linear + GELU per stage, residual where the stage preserves shape and `use_res` is set.
    Stacked { layer_sizes: Vec<usize>, use_res: bool },
}

/// Score function applied to the gate logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFunc {
    Softmax,
    Sigmoid,
}

/// Mixture-of-Experts hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Leading layers that keep the dense feed-forward.
    pub n_dense_layers: usize,
    pub n_routed_experts: usize,
    /// Width multiplier of the always-active shared expert.
    pub n_shared_experts: usize,
    /// Top-k experts selected per token.
    pub n_activated_experts: usize,
    /// Hidden size of each routed expert.
    pub moe_inter_dim: usize,
    pub score_func: ScoreFunc,
    pub route_scale: f64,
}

/// Model hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    /// Maximum context length; sizes the position, rotary and mask tables.
    pub max_seq_len: usize,
    /// Channel dimension preserved by every block.
    pub dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub drop_rate: f32,
    pub qkv_bias: bool,
    pub out_bias: bool,
    pub position: PositionEncoding,
    pub rope_theta: f64,
    pub norm: NormKind,
    pub norm_eps: f64,
    pub residual: ResidualLayout,
    pub ffn: FeedForwardConfig,
    #[serde(default)]
    pub moe: Option<MoeConfig>,
}

/// Inconsistent hyperparameters, caught before any weight is created.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("dim {dim} must be divisible by n_heads {n_heads}")]
    HeadsDoNotDivide { dim: usize, n_heads: usize },
    #[error("rotary positions need an even head_dim, got {0}")]
    OddRotaryHeadDim(usize),
    #[error("{0} must be positive")]
    Zero(&'static str),
    #[error("stacked feed-forward must map dim {dim} back to dim, got {sizes:?}")]
    StackedShape { dim: usize, sizes: Vec<usize> },
    #[error("top-k {top_k} must be in 1..={n_routed_experts}")]
    TopK { top_k: usize, n_routed_experts: usize },
}

impl ModelConfig {
    /// Dimension per attention head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Whether layer `layer_idx` uses the MoE feed-forward.
    #[must_use]
    pub fn is_moe_layer(&self, layer_idx: usize) -> bool {
        self.moe
            .as_ref()
            .is_some_and(|moe| layer_idx >= moe.n_dense_layers)
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("max_seq_len", self.max_seq_len),
            ("dim", self.dim),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if !self.dim.is_multiple_of(self.n_heads) {
            return Err(ConfigError::HeadsDoNotDivide {
                dim: self.dim,
                n_heads: self.n_heads,
            });
        }
        if self.position == PositionEncoding::Rotary && !self.head_dim().is_multiple_of(2) {
            return Err(ConfigError::OddRotaryHeadDim(self.head_dim()));
        }
        match &self.ffn {
            FeedForwardConfig::Plain { hidden_dim } | FeedForwardConfig::Gated { hidden_dim } => {
                if *hidden_dim == 0 {
                    return Err(ConfigError::Zero("ffn.hidden_dim"));
                }
            }
            FeedForwardConfig::Stacked { layer_sizes, .. } => {
                let ok = layer_sizes.len() >= 2
                    && layer_sizes.first() == Some(&self.dim)
                    && layer_sizes.last() == Some(&self.dim)
                    && layer_sizes.iter().all(|&s| s > 0);
                if !ok {
                    return Err(ConfigError::StackedShape {
                        dim: self.dim,
                        sizes: layer_sizes.clone(),
                    });
                }
            }
        }
        if let Some(moe) = &self.moe {
            if moe.n_routed_experts == 0 {
                return Err(ConfigError::Zero("moe.n_routed_experts"));
            }
            if moe.moe_inter_dim == 0 {
                return Err(ConfigError::Zero("moe.moe_inter_dim"));
            }
            if moe.n_shared_experts == 0 {
                return Err(ConfigError::Zero("moe.n_shared_experts"));
            }
            if moe.n_activated_experts == 0 || moe.n_activated_experts > moe.n_routed_experts {
                return Err(ConfigError::TopK {
                    top_k: moe.n_activated_experts,
                    n_routed_experts: moe.n_routed_experts,
                });
            }
        }
        Ok(())
    }

    /// GPT-2 small layout: learned positions, LayerNorm, post-norm blocks.
    #[must_use]
    pub fn gpt_124m() -> Self {
        Self {
            vocab_size: 50257,
            max_seq_len: 1024,
            dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
            out_bias: true,
            position: PositionEncoding::Learned,
            rope_theta: 10_000.0,
            norm: NormKind::LayerNorm,
            norm_eps: 1e-5,
            residual: ResidualLayout::PostNorm,
            ffn: FeedForwardConfig::Stacked {
                layer_sizes: vec![768, 768 * 4, 768],
                use_res: false,
            },
            moe: None,
        }
    }

    /// Rotary, RMSNorm, pre-norm with MoE on every layer but the first.
    #[must_use]
    pub fn tunx() -> Self {
        Self {
            vocab_size: 50257,
            max_seq_len: 512,
            dim: 512,
            n_heads: 8,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
            out_bias: false,
            position: PositionEncoding::Rotary,
            rope_theta: 10_000.0,
            norm: NormKind::RmsNorm,
            norm_eps: 1e-6,
            residual: ResidualLayout::PreNorm,
            ffn: FeedForwardConfig::Gated { hidden_dim: 1024 },
            moe: Some(MoeConfig {
                n_dense_layers: 1,
                n_routed_experts: 8,
                n_shared_experts: 1,
                n_activated_experts: 2,
                moe_inter_dim: 1024,
                score_func: ScoreFunc::Softmax,
                route_scale: 1.0,
            }),
        }
    }

    /// Small MoE model used by tests and CLI smoke runs.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            max_seq_len: 32,
            dim: 16,
            n_heads: 4,
            n_layers: 2,
            drop_rate: 0.0,
            qkv_bias: false,
            out_bias: false,
            position: PositionEncoding::Rotary,
            rope_theta: 10_000.0,
            norm: NormKind::RmsNorm,
            norm_eps: 1e-6,
            residual: ResidualLayout::PreNorm,
            ffn: FeedForwardConfig::Gated { hidden_dim: 32 },
            moe: Some(MoeConfig {
                n_dense_layers: 1,
                n_routed_experts: 4,
                n_shared_experts: 1,
                n_activated_experts: 2,
                moe_inter_dim: 24,
                score_func: ScoreFunc::Softmax,
                route_scale: 1.0,
            }),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::tunx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        assert!(ModelConfig::gpt_124m().validate().is_ok());
        assert!(ModelConfig::tunx().validate().is_ok());
        assert!(ModelConfig::tiny().validate().is_ok());
    }

    #[test]
    fn gpt_124m_stacks_without_inner_residual() {
        let cfg = ModelConfig::gpt_124m();
        assert_eq!(cfg.vocab_size, 50257);
        assert_eq!(cfg.residual, ResidualLayout::PostNorm);
        assert_eq!(
            cfg.ffn,
            FeedForwardConfig::Stacked {
                layer_sizes: vec![768, 3072, 768],
                use_res: false,
            }
        );
    }

    #[test]
    fn heads_must_divide_dim() {
        let cfg = ModelConfig {
            dim: 100,
            n_heads: 3,
            ..ModelConfig::tiny()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::HeadsDoNotDivide { dim: 100, n_heads: 3 })
        );
    }

    #[test]
    fn rotary_rejects_odd_head_dim() {
        let cfg = ModelConfig {
            dim: 12,
            n_heads: 4,
            ..ModelConfig::tiny()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::OddRotaryHeadDim(3)));
    }

    #[test]
    fn stacked_sizes_must_return_to_dim() {
        let cfg = ModelConfig {
            ffn: FeedForwardConfig::Stacked {
                layer_sizes: vec![16, 64, 32],
                use_res: false,
            },
            ..ModelConfig::tiny()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::StackedShape { .. })
        ));
    }

    #[test]
    fn top_k_bounded_by_expert_count() {
        let mut cfg = ModelConfig::tiny();
        if let Some(moe) = cfg.moe.as_mut() {
            moe.n_activated_experts = 5;
        }
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::TopK {
                top_k: 5,
                n_routed_experts: 4
            })
        );
    }

    #[test]
    fn moe_layers_follow_dense_prefix() {
        let cfg = ModelConfig::tunx();
        assert!(!cfg.is_moe_layer(0));
        assert!(cfg.is_moe_layer(1));
        assert!(cfg.is_moe_layer(11));
        assert!(!ModelConfig::gpt_124m().is_moe_layer(3));
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = ModelConfig::tunx();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"position\":\"rotary\""));
        assert!(json.contains("\"kind\":\"gated\""));
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
