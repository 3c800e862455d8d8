//! Autoregressive decoding.

pub mod generate;
pub mod sampling;

pub use generate::{GenerationConfig, generate, generate_greedy};
pub use sampling::{most_likely, probabilities};
