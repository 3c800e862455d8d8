//! Next-token training: loss and the optimization loop.
//!
//! Logits `[batch, seq_len, vocab]` are flattened to `[batch * seq_len, vocab]` and
//! scored against the flattened `[batch * seq_len]` labels. [`train`] drives AdamW
//! over full batches with a cosine learning-rate schedule and writes epoch
//! checkpoints.

use std::f64::consts::PI;
use std::path::PathBuf;

use anyhow::Context;
use candle_core::{D, DType, Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use tracing::info;

use crate::data::{TrainingExample, collate};
use crate::model::Gpt;
use crate::weights::save_checkpoint;

fn flatten(logits: &Tensor, labels: &Tensor) -> Result<(Tensor, Tensor)> {
    let (b, l, v) = logits.dims3()?;
    let (lb, ll) = labels.dims2()?;
    if (lb, ll) != (b, l) {
        candle_core::bail!("labels shape ({lb}, {ll}) does not match logits ({b}, {l}, {v})");
    }
    Ok((
        logits.reshape((b * l, v))?,
        labels.to_dtype(DType::U32)?.flatten_all()?,
    ))
}

/// Mean cross-entropy over every token position.
///
/// # Errors
/// Returns an error if the shapes disagree or tensor operations fail.
pub fn cross_entropy_loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (logits, labels) = flatten(logits, labels)?;
    candle_nn::loss::cross_entropy(&logits, &labels)
}

/// Mean cross-entropy over positions whose `mask` entry is nonzero.
///
/// # Errors
/// Returns an error if the shapes disagree, the mask selects nothing, or tensor
/// operations fail.
pub fn masked_cross_entropy_loss(logits: &Tensor, labels: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (logits, labels) = flatten(logits, labels)?;
    let mask = mask.to_dtype(DType::F32)?.flatten_all()?;
    if mask.dims1()? != labels.dims1()? {
        candle_core::bail!("mask has {} entries, expected {}", mask.dims1()?, labels.dims1()?);
    }
    let valid = mask.sum_all()?.to_scalar::<f32>()?;
    if valid == 0.0 {
        candle_core::bail!("mask selects no positions");
    }

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let picked = log_probs.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?;
    (picked * mask)?.sum_all()?.neg()? / f64::from(valid)
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Floor of the cosine schedule.
    pub min_learning_rate: f64,
    /// Steps from the peak to the floor of the cosine schedule.
    pub schedule_steps: usize,
    /// Log every this many steps; 0 disables step logs.
    pub log_every: usize,
    /// Save after epochs whose index is a multiple of this; 0 disables saving.
    pub checkpoint_every: usize,
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            batch_size: 4,
            learning_rate: 4e-4,
            weight_decay: 0.1,
            min_learning_rate: 1e-5,
            schedule_steps: 200,
            log_every: 10,
            checkpoint_every: 2,
            checkpoint_dir: None,
        }
    }
}

/// What a [`train`] run did.
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Loss of every step, in order.
    pub losses: Vec<f32>,
    /// Checkpoints written, in order.
    pub checkpoints: Vec<PathBuf>,
}

/// Cosine-annealed learning rate after `step` optimizer steps.
///
/// Starts at `base`, reaches `min` at `step == period` and keeps following the
/// cosine afterwards. A zero `period` holds `base`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn cosine_lr(step: usize, base: f64, min: f64, period: usize) -> f64 {
    if period == 0 {
        return base;
    }
    let phase = PI * step as f64 / period as f64;
    min + (base - min) * (1.0 + phase.cos()) / 2.0
}

/// Train `model`, whose parameters live in `varmap`, on `examples`.
///
/// Every epoch walks the examples in order in batches of `config.batch_size`; a
/// trailing partial batch is dropped. Each batch runs the model in training mode
/// with its attention mask as the padding mask and takes one AdamW step on the
/// masked next-token loss.
///
/// # Errors
/// Returns an error if the settings are unusable, there is not one full batch,
/// a step fails, the loss stops being finite, or a checkpoint cannot be written.
pub fn train(
    model: &Gpt,
    varmap: &VarMap,
    examples: &[TrainingExample],
    config: &TrainConfig,
) -> anyhow::Result<TrainReport> {
    if config.epochs == 0 || config.batch_size == 0 {
        anyhow::bail!(
            "epochs ({}) and batch_size ({}) must be positive",
            config.epochs,
            config.batch_size
        );
    }
    let batches_per_epoch = examples.len() / config.batch_size;
    if batches_per_epoch == 0 {
        anyhow::bail!(
            "{} examples do not fill one batch of {}",
            examples.len(),
            config.batch_size
        );
    }

    let params = ParamsAdamW {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..ParamsAdamW::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params).context("create AdamW")?;
    info!(
        examples = examples.len(),
        batches_per_epoch,
        epochs = config.epochs,
        lr = config.learning_rate,
        "starting training"
    );

    let mut report = TrainReport::default();
    for epoch in 0..config.epochs {
        for (batch_idx, chunk) in examples.chunks_exact(config.batch_size).enumerate() {
            let batch = collate(chunk, model.device())?;
            let logits = model.forward_t(&batch.input_ids, Some(&batch.attention_mask), true)?;
            let loss = masked_cross_entropy_loss(&logits, &batch.labels, &batch.attention_mask)?;
            optimizer.backward_step(&loss)?;

            let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            if !value.is_finite() {
                anyhow::bail!("loss became {value} at epoch {epoch}, batch {batch_idx}");
            }
            report.steps += 1;
            report.losses.push(value);

            let lr = cosine_lr(
                report.steps,
                config.learning_rate,
                config.min_learning_rate,
                config.schedule_steps,
            );
            optimizer.set_learning_rate(lr);

            if config.log_every > 0 && batch_idx % config.log_every == 0 {
                info!(
                    epoch = epoch + 1,
                    epochs = config.epochs,
                    step = batch_idx,
                    loss = value,
                    lr,
                    "train step"
                );
            }
        }

        if let Some(dir) = &config.checkpoint_dir {
            if config.checkpoint_every > 0 && epoch % config.checkpoint_every == 0 {
                report
                    .checkpoints
                    .push(save_checkpoint(varmap, model.config(), dir, epoch)?);
            }
        }
    }
    Ok(report)
}
