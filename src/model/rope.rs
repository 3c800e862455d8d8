//! Rotary position embeddings.
//!
//! Adjacent channel pairs `(x[2i], x[2i + 1])` of every query and key head are
//! treated as a complex number and rotated by `pos * theta^(-2i / head_dim)`, so
//! the query/key dot product depends only on the position difference.
//!
//! The angle table is computed once at model construction and sliced to the
//! current sequence length on every call.

use candle_core::{Device, Result, Tensor};

/// Precomputed cos/sin table of shape `[max_seq_len, head_dim / 2]`.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    cos: Tensor,
    sin: Tensor,
    head_dim: usize,
    max_seq_len: usize,
}

/// Table rows for positions `0..seq_len`.
#[derive(Debug, Clone)]
pub struct RotaryAngles {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryTable {
    /// Build the table.
    ///
    /// # Errors
    /// Returns an error if `head_dim` is odd or tensor creation fails.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        if !head_dim.is_multiple_of(2) {
            candle_core::bail!("rotary head_dim must be even, got {head_dim}");
        }
        let half_dim = head_dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| (1.0 / theta.powf(2.0 * i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half_dim), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [max_seq_len, half_dim]
        let freqs = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
            head_dim,
            max_seq_len,
        })
    }

    /// Angles for the first `seq_len` positions.
    ///
    /// # Errors
    /// Returns an error if `seq_len` exceeds the precomputed extent.
    pub fn angles(&self, seq_len: usize) -> Result<RotaryAngles> {
        if seq_len > self.max_seq_len {
            candle_core::bail!(
                "sequence length {seq_len} exceeds rotary table extent {}",
                self.max_seq_len
            );
        }
        Ok(RotaryAngles {
            cos: self.cos.narrow(0, 0, seq_len)?,
            sin: self.sin.narrow(0, 0, seq_len)?,
        })
    }

    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[must_use]
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

impl RotaryAngles {
    /// Rotate a `[batch, heads, seq_len, head_dim]` tensor.
    ///
    /// # Errors
    /// Returns an error if the shapes do not line up with the table slice.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::rotary_emb::rope_i(&x.contiguous()?, &self.cos, &self.sin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;

    #[test]
    fn table_shapes() {
        let table = RotaryTable::new(64, 128, 10_000.0, &Device::Cpu).unwrap();
        assert_eq!(table.cos.dims(), &[128, 32]);
        assert_eq!(table.sin.dims(), &[128, 32]);
        let angles = table.angles(7).unwrap();
        assert_eq!(angles.cos.dims(), &[7, 32]);
    }

    #[test]
    fn angles_reject_overlong_sequence() {
        let table = RotaryTable::new(8, 4, 10_000.0, &Device::Cpu).unwrap();
        assert!(table.angles(5).is_err());
    }

    #[test]
    fn odd_head_dim_rejected() {
        assert!(RotaryTable::new(7, 4, 10_000.0, &Device::Cpu).is_err());
    }

    #[test]
    fn position_zero_is_identity() {
        let table = RotaryTable::new(8, 4, 10_000.0, &Device::Cpu).unwrap();
        let x = Tensor::randn(0.0f32, 1.0, (1, 2, 1, 8), &Device::Cpu).unwrap();
        let y = table.angles(1).unwrap().apply(&x).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn rotated_scores_depend_only_on_offset() {
        let device = Device::Cpu;
        let head_dim = 8;
        let len = 12;
        let theta = 10_000.0_f64;
        let table = RotaryTable::new(head_dim, len, theta, &device).unwrap();
        let angles = table.angles(len).unwrap();

        let qv = [0.3f32, -1.2, 0.7, 0.1, -0.4, 0.9, 1.5, -0.2];
        let kv = [1.1f32, 0.4, -0.6, 0.8, 0.2, -1.3, 0.5, 0.7];
        let q = Tensor::new(&qv, &device)
            .unwrap()
            .broadcast_as((1, 1, len, head_dim))
            .unwrap();
        let k = Tensor::new(&kv, &device)
            .unwrap()
            .broadcast_as((1, 1, len, head_dim))
            .unwrap();

        let q = angles.apply(&q).unwrap();
        let k = angles.apply(&k).unwrap();
        let scores: Vec<Vec<f32>> = q
            .matmul(&k.t().unwrap())
            .unwrap()
            .i((0, 0))
            .unwrap()
            .to_vec2()
            .unwrap();

        // Direct angle-difference computation per channel pair.
        let direct = |offset: i64| -> f32 {
            let mut acc = 0.0f64;
            for i in 0..head_dim / 2 {
                let (a, b) = (f64::from(qv[2 * i]), f64::from(qv[2 * i + 1]));
                let (c, d) = (f64::from(kv[2 * i]), f64::from(kv[2 * i + 1]));
                #[allow(clippy::cast_precision_loss)]
                let phi = offset as f64 / theta.powf(2.0 * i as f64 / head_dim as f64);
                acc += (a * c + b * d) * phi.cos() - (b * c - a * d) * phi.sin();
            }
            #[allow(clippy::cast_possible_truncation)]
            let out = acc as f32;
            out
        };

        for p in 0..len {
            for q_pos in 0..len {
                #[allow(clippy::cast_possible_wrap)]
                let offset = p as i64 - q_pos as i64;
                let expected = direct(offset);
                assert!(
                    (scores[p][q_pos] - expected).abs() < 1e-4,
                    "p={p} q={q_pos}: {} vs {expected}",
                    scores[p][q_pos]
                );
                if p + 1 < len && q_pos + 1 < len {
                    assert!((scores[p][q_pos] - scores[p + 1][q_pos + 1]).abs() < 1e-4);
                }
            }
        }
    }
}
