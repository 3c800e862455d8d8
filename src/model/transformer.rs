//! Decoder-only GPT model.
//!
//! Embeds token ids, runs the transformer blocks in order under one shared causal
//! (optionally padding-fused) mask, normalizes and projects to vocabulary logits.
//! Positions come either from a learned table added to the embeddings or from a
//! rotary table applied inside every attention layer.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, VarMap};

use super::attention::CausalMask;
use super::config::{ModelConfig, PositionEncoding};
use super::embedding::{PositionEmbedding, TokenEmbedding};
use super::layers::TransformerBlock;
use super::norm::Norm;
use super::rope::RotaryTable;

/// GPT-style language model with optional Mixture-of-Experts blocks.
pub struct Gpt {
    /// Token embedding
    token_embedding: TokenEmbedding,
    /// Learned positions, absent for rotary models
    pos_embedding: Option<PositionEmbedding>,
    /// Rotary angles, absent for learned-position models
    rotary: Option<RotaryTable>,
    /// Precomputed causal table
    causal: CausalMask,
    drop_emb: Dropout,
    blocks: Vec<TransformerBlock>,
    /// Final normalization
    norm: Norm,
    /// Vocabulary projection
    head: Linear,
    config: ModelConfig,
    device: Device,
}

impl Gpt {
    /// Create a new model by loading (or initializing) weights.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: ModelConfig, vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let device = vb.device().clone();

        let token_embedding = TokenEmbedding::new(&config, vb.pp("token_embedding"))?;
        let (pos_embedding, rotary) = match config.position {
            PositionEncoding::Learned => (
                Some(PositionEmbedding::new(&config, vb.pp("pos_embedding"))?),
                None,
            ),
            PositionEncoding::Rotary => (
                None,
                Some(RotaryTable::new(
                    config.head_dim(),
                    config.max_seq_len,
                    config.rope_theta,
                    &device,
                )?),
            ),
        };
        let causal = CausalMask::new(config.max_seq_len, &device)?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            blocks.push(TransformerBlock::new(&config, i, vb.pp(format!("blocks.{i}")))?);
        }

        let norm = Norm::new(&config, vb.pp("norm"))?;
        let head = candle_nn::linear_no_bias(config.dim, config.vocab_size, vb.pp("head"))?;

        tracing::debug!(
            n_layers = config.n_layers,
            dim = config.dim,
            moe_blocks = blocks.iter().filter(|b| b.is_moe()).count(),
            position = ?config.position,
            "built model"
        );

        Ok(Self {
            token_embedding,
            pos_embedding,
            rotary,
            causal,
            drop_emb: Dropout::new(config.drop_rate),
            blocks,
            norm,
            head,
            config,
            device,
        })
    }

    /// Inference forward pass without padding.
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs of shape (batch, seq_len)
    ///
    /// # Returns
    /// Logits of shape (batch, seq_len, vocab_size)
    ///
    /// # Errors
    /// Returns an error if `seq_len` is zero or exceeds `max_seq_len`, or tensor operations fail.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_t(input_ids, None, false)
    }

    /// Forward pass with an optional `[batch, seq_len]` padding mask (nonzero = valid)
    /// and an explicit execution mode. Dropout is active only when `train` is set.
    ///
    /// # Errors
    /// Returns an error if `seq_len` is zero or exceeds `max_seq_len`, the padding
    /// mask shape does not match, or tensor operations fail.
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (_, t) = input_ids.dims2()?;
        if t == 0 {
            candle_core::bail!("empty input sequence");
        }
        if t > self.config.max_seq_len {
            candle_core::bail!(
                "Sequence length {t} exceeds max_seq_len {}",
                self.config.max_seq_len
            );
        }

        let mut x = self.token_embedding.forward(input_ids)?;
        if let Some(pos) = &self.pos_embedding {
            x = x.broadcast_add(&pos.forward(t)?)?;
        }
        x = self.drop_emb.forward_t(&x, train)?;

        let mask = self.causal.build(t, padding_mask)?;
        let angles = self.rotary.as_ref().map(|r| r.angles(t)).transpose()?;

        for block in &self.blocks {
            x = block.forward_t(&x, &mask, angles.as_ref(), train)?;
        }

        self.head.forward(&self.norm.forward(&x)?)
    }

    /// Logits for the last position only, shape (batch, vocab_size).
    ///
    /// # Errors
    /// Returns an error if the forward pass fails.
    pub fn forward_last(&self, input_ids: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        let (_, t, _) = logits.dims3()?;
        logits.narrow(1, t - 1, 1)?.squeeze(1)
    }

    /// Get the model configuration.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Get the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn blocks(&self) -> &[TransformerBlock] {
        &self.blocks
    }
}

/// Load a model from in-memory safetensors bytes.
///
/// # Errors
/// Returns an error if the buffer cannot be parsed as safetensors or model construction fails.
pub fn load_model_from_bytes(data: &[u8], config: ModelConfig, device: &Device) -> Result<Gpt> {
    let vb = VarBuilder::from_buffered_safetensors(data.to_vec(), DType::F32, device)?;
    Gpt::new(config, vb)
}

/// Total number of scalar parameters held by `varmap`.
#[must_use]
pub fn num_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{FeedForwardConfig, NormKind, ResidualLayout};

    fn build(config: &ModelConfig) -> (Gpt, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt::new(config.clone(), vb).unwrap();
        (model, varmap)
    }

    fn gpt2_like() -> ModelConfig {
        ModelConfig {
            vocab_size: 64,
            max_seq_len: 16,
            dim: 16,
            n_heads: 2,
            n_layers: 2,
            drop_rate: 0.0,
            qkv_bias: true,
            out_bias: true,
            position: PositionEncoding::Learned,
            rope_theta: 10_000.0,
            norm: NormKind::LayerNorm,
            norm_eps: 1e-5,
            residual: ResidualLayout::PostNorm,
            ffn: FeedForwardConfig::Stacked {
                layer_sizes: vec![16, 64, 16],
                use_res: true,
            },
            moe: None,
        }
    }

    #[test]
    fn test_forward_shapes_with_random_init() {
        let config = ModelConfig::tiny();
        let (model, _) = build(&config);
        let input = Tensor::zeros((2, 8), DType::U32, &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[2, 8, config.vocab_size]);
        assert_eq!(model.blocks().iter().filter(|b| b.is_moe()).count(), 1);
    }

    #[test]
    fn learned_position_model_shapes() {
        let config = gpt2_like();
        let (model, _) = build(&config);
        let input = Tensor::new(&[[1u32, 2, 3, 4, 5]], &Device::Cpu).unwrap();
        assert_eq!(model.forward(&input).unwrap().dims(), &[1, 5, 64]);
        assert_eq!(model.forward_last(&input).unwrap().dims(), &[1, 64]);
    }

    #[test]
    fn invalid_config_rejected_at_build() {
        let config = ModelConfig {
            dim: 18,
            n_heads: 4,
            ..ModelConfig::tiny()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(Gpt::new(config, vb).is_err());
    }

    #[test]
    fn rejects_empty_and_overlong_sequences() {
        let config = ModelConfig::tiny();
        let (model, _) = build(&config);
        let empty = Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&empty).is_err());
        let long = Tensor::zeros((1, config.max_seq_len + 1), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&long).is_err());
        let full = Tensor::zeros((1, config.max_seq_len), DType::U32, &Device::Cpu).unwrap();
        assert!(model.forward(&full).is_ok());
    }

    #[test]
    fn padding_mask_shape_checked() {
        let (model, _) = build(&ModelConfig::tiny());
        let ids = Tensor::zeros((2, 4), DType::U32, &Device::Cpu).unwrap();
        let bad = Tensor::ones((2, 5), DType::U8, &Device::Cpu).unwrap();
        assert!(model.forward_t(&ids, Some(&bad), false).is_err());
        let ok = Tensor::ones((2, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(model.forward_t(&ids, Some(&ok), false).is_ok());
    }

    #[test]
    fn parameter_count_covers_head_and_embeddings() {
        let config = gpt2_like();
        let (_, varmap) = build(&config);
        let n = num_parameters(&varmap);
        // token table + position table + head alone
        assert!(n > 64 * 16 + 16 * 16 + 16 * 64);
    }
}
