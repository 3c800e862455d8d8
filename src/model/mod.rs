pub mod attention;
pub mod config;
pub mod embedding;
pub mod layers;
pub mod moe;
pub mod norm;
pub mod rope;
pub mod transformer;

// Re-exports for convenience
pub use attention::{CausalMask, CausalSelfAttention, MASK_FILL};
pub use config::{
    ConfigError, FeedForwardConfig, ModelConfig, MoeConfig, NormKind, PositionEncoding,
    ResidualLayout, ScoreFunc,
};
pub use embedding::{PositionEmbedding, TokenEmbedding};
pub use layers::{FeedForward, FeedForwardLayer, GatedMlp, TransformerBlock};
pub use moe::{Expert, Gate, MoeLayer, Routing};
pub use norm::Norm;
pub use rope::{RotaryAngles, RotaryTable};
pub use transformer::{Gpt, load_model_from_bytes, num_parameters};
