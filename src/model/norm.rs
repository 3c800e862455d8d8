//! LayerNorm / RMSNorm behind one type.
//!
//! The kind is a model-wide constant: every block and the final norm are built
//! from the same [`NormKind`].

use candle_core::{Result, Tensor};
use candle_nn::{LayerNorm, LayerNormConfig, Module, RmsNorm, VarBuilder};

use super::config::{ModelConfig, NormKind};

/// Normalization over the last dimension.
#[derive(Debug, Clone)]
pub enum Norm {
    /// Learned scale and shift, mean and variance based.
    Layer(LayerNorm),
    /// Learned scale only, root-mean-square based.
    Rms(RmsNorm),
}

impl Norm {
    /// Create the norm selected by `config.norm` with size `config.dim`.
    ///
    /// # Errors
    /// Returns an error if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        match config.norm {
            NormKind::LayerNorm => {
                let cfg = LayerNormConfig {
                    eps: config.norm_eps,
                    ..LayerNormConfig::default()
                };
                Ok(Self::Layer(candle_nn::layer_norm(config.dim, cfg, vb)?))
            }
            NormKind::RmsNorm => Ok(Self::Rms(candle_nn::rms_norm(
                config.dim,
                config.norm_eps,
                vb,
            )?)),
        }
    }
}

impl Module for Norm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Layer(norm) => norm.forward(x),
            Self::Rms(norm) => norm.forward(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{D, DType, Device};
    use candle_nn::VarMap;

    fn build(kind: NormKind) -> Norm {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = ModelConfig {
            norm: kind,
            ..ModelConfig::tiny()
        };
        Norm::new(&config, vb).unwrap()
    }

    #[test]
    fn rms_norm_has_unit_root_mean_square() {
        let norm = build(NormKind::RmsNorm);
        let x = Tensor::randn(0.0f32, 3.0, (2, 5, 16), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let ms: Vec<f32> = y
            .sqr()
            .unwrap()
            .mean(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for v in ms {
            assert!((v - 1.0).abs() < 1e-3, "mean square {v}");
        }
    }

    #[test]
    fn rms_norm_does_not_center() {
        let norm = build(NormKind::RmsNorm);
        let x = Tensor::ones((1, 1, 16), DType::F32, &Device::Cpu).unwrap();
        let y: Vec<f32> = norm.forward(&x).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(y.iter().all(|v| (v - 1.0).abs() < 1e-3));
    }

    #[test]
    fn layer_norm_centers_rows() {
        let norm = build(NormKind::LayerNorm);
        let x = Tensor::randn(2.0f32, 1.0, (3, 16), &Device::Cpu).unwrap();
        let y = norm.forward(&x).unwrap();
        let means: Vec<f32> = y.mean(D::Minus1).unwrap().to_vec1().unwrap();
        for m in means {
            assert!(m.abs() < 1e-4, "row mean {m}");
        }
    }
}
