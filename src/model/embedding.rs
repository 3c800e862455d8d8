//! Embedding layers for the transformer.
//!
//! Token embedding plus the learned absolute position table used when the model
//! does not rotate queries and keys.

use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use super::config::ModelConfig;

/// Token embedding layer.
pub struct TokenEmbedding {
    /// Embedding weights
    embedding: Embedding,
}

impl TokenEmbedding {
    /// Create a new token embedding layer.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `vb` - Variable builder for loading weights
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.vocab_size, config.dim, vb)?;
        Ok(Self { embedding })
    }

    /// Forward pass through token embedding.
    ///
    /// # Arguments
    /// * `token_ids` - Token IDs of shape (batch, seq_len)
    ///
    /// # Returns
    /// Embeddings of shape (batch, seq_len, dim)
    ///
    /// # Errors
    /// Returns an error if embedding lookup fails.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(token_ids)
    }
}

/// Learned absolute position embedding indexed by `0..seq_len`.
pub struct PositionEmbedding {
    embedding: Embedding,
    max_seq_len: usize,
}

impl PositionEmbedding {
    /// Create a `[max_seq_len, dim]` position table.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = candle_nn::embedding(config.max_seq_len, config.dim, vb)?;
        Ok(Self {
            embedding,
            max_seq_len: config.max_seq_len,
        })
    }

    /// Position signal of shape (1, seq_len, dim), broadcast over the batch.
    ///
    /// # Errors
    /// Returns an error if `seq_len` exceeds the table.
    #[allow(clippy::cast_possible_truncation)]
    pub fn forward(&self, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.max_seq_len {
            candle_core::bail!(
                "sequence length {seq_len} exceeds position table extent {}",
                self.max_seq_len
            );
        }
        let device = self.embedding.embeddings().device();
        let positions = Tensor::arange(0u32, seq_len as u32, device)?;
        self.embedding.forward(&positions)?.unsqueeze(0)
    }
}
