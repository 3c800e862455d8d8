//! Greedy generation loop.
//!
//! Every step re-runs the full forward pass over the cropped context (no key/value
//! cache), takes the last-position distribution and appends its argmax.

use candle_core::{DType, Result, Tensor};

use crate::inference::sampling::{most_likely, probabilities};
use crate::model::Gpt;

/// Generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Exact number of tokens appended; there is no early stop.
    pub max_new_tokens: usize,
    /// Trailing tokens fed to the model each step.
    pub context_size: usize,
}

impl GenerationConfig {
    /// Use the model's full context window.
    #[must_use]
    pub fn for_model(model: &Gpt, max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            context_size: model.config().max_seq_len,
        }
    }
}

/// Extend a `[batch, seq_len]` id tensor by `max_new_tokens` greedy picks.
///
/// The context is cropped to the last `context_size` tokens before every step
/// (`context_size` is capped at the model's `max_seq_len`). Returns the prompt
/// followed by the generated ids, shape `[batch, seq_len + max_new_tokens]`.
///
/// # Errors
/// Returns an error if `context_size` is zero, the prompt is empty, or inference fails.
pub fn generate_greedy(
    model: &Gpt,
    idx: &Tensor,
    max_new_tokens: usize,
    context_size: usize,
) -> Result<Tensor> {
    if context_size == 0 {
        candle_core::bail!("context_size must be positive");
    }
    let context_size = context_size.min(model.config().max_seq_len);

    let mut idx = idx.to_dtype(DType::U32)?;
    let (batch, _) = idx.dims2()?;
    for _ in 0..max_new_tokens {
        let (_, t) = idx.dims2()?;
        let ctx = if t > context_size {
            idx.narrow(1, t - context_size, context_size)?.contiguous()?
        } else {
            idx.clone()
        };

        let logits = model.forward_last(&ctx)?;
        let rows: Vec<Vec<f32>> = logits.to_dtype(DType::F32)?.to_vec2()?;
        let next: Vec<u32> = rows.iter().map(|row| most_likely(&probabilities(row))).collect();

        let next = Tensor::from_vec(next, (batch, 1), model.device())?;
        idx = Tensor::cat(&[&idx, &next], 1)?;
    }
    Ok(idx)
}

/// Single-sequence convenience over [`generate_greedy`].
///
/// # Errors
/// Returns an error if the prompt is empty or inference fails.
pub fn generate(model: &Gpt, prompt: &[u32], cfg: &GenerationConfig) -> Result<Vec<u32>> {
    tracing::debug!(
        prompt_len = prompt.len(),
        max_new_tokens = cfg.max_new_tokens,
        context_size = cfg.context_size,
        "greedy generation"
    );
    let input = Tensor::new(prompt, model.device())?.unsqueeze(0)?;
    let out = generate_greedy(model, &input, cfg.max_new_tokens, cfg.context_size)?;
    out.squeeze(0)?.to_vec1()
}
