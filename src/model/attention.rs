//! Causal multi-head self-attention.
//!
//! One module covers both position schemes: with rotary angles supplied, queries
//! and keys are rotated before the dot product; without them the scores are plain
//! `QK^T / sqrt(d_k)`. An optional per-token padding mask is fused with the causal
//! mask by [`CausalMask::build`].

use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder};

use super::config::ModelConfig;
use super::rope::RotaryAngles;

/// Score written into masked (query, key) pairs before the softmax.
///
/// Finite, so a row that padding masks completely softmaxes to uniform weights
/// instead of NaN. In f32 `exp(-1e9 - max)` underflows to exactly zero whenever
/// the row has an unmasked key.
pub const MASK_FILL: f32 = -1e9;

/// Upper-triangular "must mask" table, built once per model.
#[derive(Debug, Clone)]
pub struct CausalMask {
    /// `[max_len, max_len]` u8, 1 where key position > query position.
    mask: Tensor,
    max_len: usize,
}

impl CausalMask {
    /// Build the `[max_len, max_len]` table.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn new(max_len: usize, device: &Device) -> Result<Self> {
        let mask: Vec<u8> = (0..max_len)
            .flat_map(|i| (0..max_len).map(move |j| u8::from(j > i)))
            .collect();
        let mask = Tensor::from_vec(mask, (max_len, max_len), device)?;
        Ok(Self { mask, max_len })
    }

    /// Mask for one forward call.
    ///
    /// Returns `[1, 1, L, L]` without a padding mask, or `[B, 1, L, L]` where
    /// `padding_mask` (`[B, L]`, nonzero = valid token) marks invalid keys. A pair
    /// is masked if either condition demands it.
    ///
    /// # Errors
    /// Returns an error if `seq_len` exceeds the table or the padding mask shape
    /// does not match.
    pub fn build(&self, seq_len: usize, padding_mask: Option<&Tensor>) -> Result<Tensor> {
        if seq_len > self.max_len {
            candle_core::bail!(
                "sequence length {seq_len} exceeds causal mask extent {}",
                self.max_len
            );
        }
        let causal = self
            .mask
            .narrow(0, 0, seq_len)?
            .narrow(1, 0, seq_len)?
            .unsqueeze(0)?
            .unsqueeze(0)?;

        let Some(padding_mask) = padding_mask else {
            return Ok(causal);
        };

        let (b, l) = padding_mask.dims2()?;
        if l != seq_len {
            candle_core::bail!("padding mask length {l} does not match sequence length {seq_len}");
        }
        // [B, L] -> [B, 1, 1, L]: mask every query's view of an invalid key.
        let invalid = padding_mask
            .to_device(self.mask.device())?
            .eq(0u8)?
            .reshape((b, 1, 1, l))?;
        causal.broadcast_maximum(&invalid)
    }

    #[must_use]
    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// Multi-head causal self-attention with independent Q/K/V/O projections.
pub struct CausalSelfAttention {
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
    /// Dropout on the attention weights (training only).
    attn_drop: Dropout,
    n_heads: usize,
    dim: usize,
    head_dim: usize,
}

impl CausalSelfAttention {
    /// Create a new attention layer.
    ///
    /// # Errors
    /// Returns an error if `dim` is not divisible by `n_heads` or weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let n_heads = config.n_heads;
        if n_heads == 0 || !dim.is_multiple_of(n_heads) {
            candle_core::bail!("dim {dim} must be divisible by n_heads {n_heads}");
        }

        let w_q = candle_nn::linear_b(dim, dim, config.qkv_bias, vb.pp("w_q"))?;
        let w_k = candle_nn::linear_b(dim, dim, config.qkv_bias, vb.pp("w_k"))?;
        let w_v = candle_nn::linear_b(dim, dim, config.qkv_bias, vb.pp("w_v"))?;
        let w_o = candle_nn::linear_b(dim, dim, config.out_bias, vb.pp("w_o"))?;

        Ok(Self {
            w_q,
            w_k,
            w_v,
            w_o,
            attn_drop: Dropout::new(config.drop_rate),
            n_heads,
            dim,
            head_dim: dim / n_heads,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape (batch, seq_len, dim)
    /// * `mask` - Output of [`CausalMask::build`] for this sequence length
    /// * `rotary` - Rotary angles for this sequence length, if the model uses them
    /// * `train` - Enables attention dropout
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
        let (b, t, _) = x.dims3()?;
        let (q, k, v) = self.project(x, rotary)?;

        let att = self.masked_softmax(&Self::scores(&q, &k, self.head_dim)?, mask)?;
        let att = self.attn_drop.forward_t(&att, train)?;

        // (B, H, T, T) @ (B, H, T, head_dim)
        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, self.dim))?;
        self.w_o.forward(&y)
    }

    /// Scaled scores `QK^T / sqrt(d_k)` before masking, shape (batch, heads, L, L).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn scaled_scores(&self, x: &Tensor, rotary: Option<&RotaryAngles>) -> Result<Tensor> {
        let (q, k, _) = self.project(x, rotary)?;
        Self::scores(&q, &k, self.head_dim)
    }

    /// Attention weights after masking and softmax (no dropout).
    ///
    /// # Errors
    /// Returns an error if tensor operations fail.
    pub fn attention_weights(
        &self,
        x: &Tensor,
        mask: &Tensor,
        rotary: Option<&RotaryAngles>,
    ) -> Result<Tensor> {
        let scores = self.scaled_scores(x, rotary)?;
        self.masked_softmax(&scores, mask)
    }

    fn project(
        &self,
        x: &Tensor,
        rotary: Option<&RotaryAngles>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, t, _) = x.dims3()?;
        let q = self.split_heads(&self.w_q.forward(x)?, b, t)?;
        let k = self.split_heads(&self.w_k.forward(x)?, b, t)?;
        let v = self.split_heads(&self.w_v.forward(x)?, b, t)?;

        match rotary {
            Some(angles) => Ok((angles.apply(&q)?, angles.apply(&k)?, v)),
            None => Ok((q, k, v)),
        }
    }

    /// (B, T, C) -> (B, n_heads, T, head_dim)
    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn scores(q: &Tensor, k: &Tensor, head_dim: usize) -> Result<Tensor> {
        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        q.matmul(&k_t)? * scale
    }

    #[allow(clippy::unused_self)]
    fn masked_softmax(&self, scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let fill = Tensor::new(MASK_FILL, scores.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.shape())?;
        let mask = mask.to_dtype(DType::U8)?.broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&fill, scores)?;
        candle_nn::ops::softmax_last_dim(&scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::PositionEncoding;
    use candle_core::IndexOp;
    use std::collections::HashMap;

    fn identity(n: usize) -> Tensor {
        let data: Vec<f32> = (0..n * n)
            .map(|idx| if idx / n == idx % n { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, (n, n), &Device::Cpu).unwrap()
    }

    fn identity_attention(dim: usize, n_heads: usize) -> CausalSelfAttention {
        let config = ModelConfig {
            dim,
            n_heads,
            position: PositionEncoding::Learned,
            drop_rate: 0.0,
            qkv_bias: false,
            out_bias: false,
            ..ModelConfig::tiny()
        };
        let mut tensors = HashMap::new();
        for name in ["w_q", "w_k", "w_v", "w_o"] {
            tensors.insert(format!("{name}.weight"), identity(dim));
        }
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &Device::Cpu);
        CausalSelfAttention::new(&config, vb).unwrap()
    }

    #[test]
    fn test_causal_mask_shape() {
        let mask = CausalMask::new(8, &Device::Cpu).unwrap();
        assert_eq!(mask.build(4, None).unwrap().dims(), &[1, 1, 4, 4]);
    }

    #[test]
    fn test_causal_mask_values() {
        let mask = CausalMask::new(8, &Device::Cpu).unwrap();
        let values: Vec<Vec<u8>> = mask.build(3, None).unwrap().i((0, 0)).unwrap().to_vec2().unwrap();
        assert_eq!(values, vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]);
    }

    #[test]
    fn padding_is_or_combined_with_causal() {
        let device = Device::Cpu;
        let mask = CausalMask::new(8, &device).unwrap();
        let padding = Tensor::new(&[[1u8, 1, 0], [1, 0, 1]], &device).unwrap();
        let fused = mask.build(3, Some(&padding)).unwrap();
        assert_eq!(fused.dims(), &[2, 1, 3, 3]);

        let first: Vec<Vec<u8>> = fused.i((0, 0)).unwrap().to_vec2().unwrap();
        assert_eq!(first, vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 1]]);
        let second: Vec<Vec<u8>> = fused.i((1, 0)).unwrap().to_vec2().unwrap();
        assert_eq!(second, vec![vec![0, 1, 1], vec![0, 1, 1], vec![0, 1, 0]]);
    }

    #[test]
    fn mask_rejects_mismatched_padding() {
        let device = Device::Cpu;
        let mask = CausalMask::new(8, &device).unwrap();
        let padding = Tensor::ones((1, 4), DType::U8, &device).unwrap();
        assert!(mask.build(3, Some(&padding)).is_err());
        assert!(mask.build(9, None).is_err());
    }

    #[test]
    fn identity_projection_scores_and_weights() {
        // D=8, H=2, L=3, B=1 with identity projections: Q = K = V = x.
        let device = Device::Cpu;
        let attn = identity_attention(8, 2);
        let rows: Vec<Vec<f32>> = vec![
            vec![1.0, 0.5, -0.5, 0.0, 0.2, -0.1, 0.3, 0.8],
            vec![0.0, 1.0, 0.5, -1.0, 0.4, 0.4, -0.2, 0.1],
            vec![-0.3, 0.2, 1.0, 0.6, -0.5, 0.9, 0.0, -0.7],
        ];
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        let x = Tensor::from_vec(flat, (1, 3, 8), &device).unwrap();

        let scores = attn.scaled_scores(&x, None).unwrap();
        assert_eq!(scores.dims(), &[1, 2, 3, 3]);
        for h in 0..2 {
            let got: Vec<Vec<f32>> = scores.i((0, h)).unwrap().to_vec2().unwrap();
            for i in 0..3 {
                for j in 0..3 {
                    let dot: f32 = (0..4).map(|c| rows[i][h * 4 + c] * rows[j][h * 4 + c]).sum();
                    let expected = dot / 2.0;
                    assert!((got[i][j] - expected).abs() < 1e-5, "h={h} i={i} j={j}");
                }
            }
        }

        let mask = CausalMask::new(3, &device).unwrap().build(3, None).unwrap();
        let weights = attn.attention_weights(&x, &mask, None).unwrap();
        for h in 0..2 {
            let w: Vec<Vec<f32>> = weights.i((0, h)).unwrap().to_vec2().unwrap();
            assert_eq!(w[0], vec![1.0, 0.0, 0.0]);
            assert_eq!(w[1][2], 0.0);
            for row in &w {
                assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn output_preserves_shape() {
        let device = Device::Cpu;
        let attn = identity_attention(8, 2);
        let x = Tensor::randn(0.0f32, 1.0, (2, 5, 8), &device).unwrap();
        let mask = CausalMask::new(5, &device).unwrap().build(5, None).unwrap();
        let y = attn.forward_t(&x, &mask, None, false).unwrap();
        assert_eq!(y.dims(), &[2, 5, 8]);
    }

    #[test]
    fn single_position_attends_to_itself() {
        let device = Device::Cpu;
        let attn = identity_attention(8, 2);
        let x = Tensor::randn(0.0f32, 1.0, (1, 1, 8), &device).unwrap();
        let mask = CausalMask::new(4, &device).unwrap().build(1, None).unwrap();
        let w: Vec<f32> = attn
            .attention_weights(&x, &mask, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(w, vec![1.0, 1.0]);
    }

    #[test]
    fn fully_padded_row_stays_finite() {
        let device = Device::Cpu;
        let attn = identity_attention(8, 2);
        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 8), &device).unwrap();
        let padding = Tensor::new(&[[0u8, 1, 1]], &device).unwrap();
        let mask = CausalMask::new(3, &device).unwrap().build(3, Some(&padding)).unwrap();
        let y: Vec<f32> = attn
            .forward_t(&x, &mask, None, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
    }
}
