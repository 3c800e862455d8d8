//! Feed-forward networks and the transformer block.

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};

use super::attention::CausalSelfAttention;
use super::config::{FeedForwardConfig, ModelConfig, ResidualLayout};
use super::moe::MoeLayer;
use super::norm::Norm;
use super::rope::RotaryAngles;

/// SwiGLU network: `down(silu(gate(x)) * up(x))`.
pub struct GatedMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GatedMlp {
    /// Create a `dim -> hidden_dim -> dim` gated network without biases.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            gate_proj: candle_nn::linear_no_bias(dim, hidden_dim, vb.pp("gate_proj"))?,
            up_proj: candle_nn::linear_no_bias(dim, hidden_dim, vb.pp("up_proj"))?,
            down_proj: candle_nn::linear_no_bias(hidden_dim, dim, vb.pp("down_proj"))?,
        })
    }
}

impl Module for GatedMlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Dense feed-forward network, shape-preserving over the last dimension.
pub enum FeedForward {
    /// c_fc -> GELU -> c_proj
    Plain { c_fc: Linear, c_proj: Linear },
    Gated(GatedMlp),
    /// Linear + GELU per stage; a stage's output is added to its input when
    /// `use_res` is set and the stage preserves shape, otherwise it replaces it.
    Stacked { stages: Vec<Linear>, use_res: bool },
}

impl FeedForward {
    /// Create the dense network selected by `config.ffn`.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        match &config.ffn {
            FeedForwardConfig::Plain { hidden_dim } => Ok(Self::Plain {
                c_fc: candle_nn::linear(dim, *hidden_dim, vb.pp("c_fc"))?,
                c_proj: candle_nn::linear(*hidden_dim, dim, vb.pp("c_proj"))?,
            }),
            FeedForwardConfig::Gated { hidden_dim } => {
                Ok(Self::Gated(GatedMlp::new(dim, *hidden_dim, vb)?))
            }
            FeedForwardConfig::Stacked {
                layer_sizes,
                use_res,
            } => {
                let stages = layer_sizes
                    .windows(2)
                    .enumerate()
                    .map(|(i, pair)| {
                        candle_nn::linear(pair[0], pair[1], vb.pp(format!("layers.{i}")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Stacked {
                    stages,
                    use_res: *use_res,
                })
            }
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Plain { c_fc, c_proj } => c_proj.forward(&c_fc.forward(x)?.gelu()?),
            Self::Gated(mlp) => mlp.forward(x),
            Self::Stacked { stages, use_res } => {
                let mut x = x.clone();
                for stage in stages {
                    let out = stage.forward(&x)?.gelu()?;
                    x = if *use_res && out.dims() == x.dims() {
                        (out + x)?
                    } else {
                        out
                    };
                }
                Ok(x)
            }
        }
    }
}

/// The block's feed-forward slot: dense or Mixture-of-Experts.
pub enum FeedForwardLayer {
    Dense(FeedForward),
    Moe(MoeLayer),
}

impl Module for FeedForwardLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Dense(ffn) => ffn.forward(x),
            Self::Moe(moe) => moe.forward(x),
        }
    }
}

/// Transformer block: attention + feed-forward with norm/residual wiring fixed
/// by `config.residual`.
pub struct TransformerBlock {
    attn_norm: Norm,
    attn: CausalSelfAttention,
    ffn_norm: Norm,
    ffn: FeedForwardLayer,
    dropout: Dropout,
    layout: ResidualLayout,
}

impl TransformerBlock {
    /// Create block `layer_idx`; it gets the MoE feed-forward when
    /// [`ModelConfig::is_moe_layer`] says so.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let attn_norm = Norm::new(config, vb.pp("attn_norm"))?;
        let attn = CausalSelfAttention::new(config, vb.pp("attn"))?;
        let ffn_norm = Norm::new(config, vb.pp("ffn_norm"))?;
        let ffn = match &config.moe {
            Some(moe) if config.is_moe_layer(layer_idx) => {
                FeedForwardLayer::Moe(MoeLayer::new(config.dim, moe, vb.pp("ffn"))?)
            }
            _ => FeedForwardLayer::Dense(FeedForward::new(config, vb.pp("ffn"))?),
        };

        Ok(Self {
            attn_norm,
            attn,
            ffn_norm,
            ffn,
            dropout: Dropout::new(config.drop_rate),
            layout: config.residual,
        })
    }

    /// Forward pass through the block.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, dim)
    /// * `mask` - Fused attention mask
    /// * `rotary` - Rotary angles when the model uses rotary positions
    /// * `train` - Enables dropout
    ///
    /// # Returns
    /// Output tensor of shape (batch, seq_len, dim)
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn forward_t(
        &self,
        x: &Tensor,
        mask: &Tensor,
        rotary: Option<&RotaryAngles>,
        train: bool,
    ) -> Result<Tensor> {
        match self.layout {
            ResidualLayout::PreNorm => {
                let h = self.attn_norm.forward(x)?;
                let h = self.attn.forward_t(&h, mask, rotary, train)?;
                let x = (x + self.dropout.forward_t(&h, train)?)?;

                let h = self.ffn_norm.forward(&x)?;
                let h = self.ffn.forward(&h)?;
                x + self.dropout.forward_t(&h, train)?
            }
            ResidualLayout::PostNorm => {
                let h = self.attn.forward_t(x, mask, rotary, train)?;
                let x = self.attn_norm.forward(&(h + x)?)?;
                let x = self.dropout.forward_t(&x, train)?;

                let h = self.ffn.forward(&x)?;
                let x = self.ffn_norm.forward(&(h + x)?)?;
                self.dropout.forward_t(&x, train)
            }
        }
    }

    /// Whether this block routes through the MoE layer.
    #[must_use]
    pub fn is_moe(&self) -> bool {
        matches!(self.ffn, FeedForwardLayer::Moe(_))
    }
}
