use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use safetensors::SafeTensors;

use crate::model::{Gpt, ModelConfig, load_model_from_bytes};

/// Configuration file expected beside every weights file.
pub const CONFIG_FILE: &str = "config.json";

/// Weights file for `epoch` inside `dir`.
#[must_use]
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("model_epoch_{epoch}.safetensors"))
}

/// Write the parameters in `varmap` as the snapshot for `epoch`, plus `config.json`.
///
/// Returns the weights path.
///
/// # Errors
/// Returns an error if the directory, weights or config cannot be written.
pub fn save_checkpoint(
    varmap: &VarMap,
    config: &ModelConfig,
    dir: &Path,
    epoch: usize,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let path = checkpoint_path(dir, epoch);
    varmap
        .save(&path)
        .with_context(|| format!("write weights {}", path.display()))?;

    let config_path = dir.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(config).context("serialize ModelConfig")?;
    std::fs::write(&config_path, json)
        .with_context(|| format!("write config {}", config_path.display()))?;

    tracing::info!(epoch, path = %path.display(), "saved checkpoint");
    Ok(path)
}

/// Read and validate `config.json` from the directory holding `model_path`.
///
/// Returns `None` when there is no such file.
///
/// # Errors
/// Returns an error if the file exists but cannot be read, parsed or validated.
pub fn load_config_for_model(model_path: &Path) -> Result<Option<ModelConfig>> {
    let parent = model_path.parent().unwrap_or_else(|| Path::new("."));
    let config_path = parent.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    let cfg: ModelConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))?;
    cfg.validate()
        .map_err(anyhow::Error::msg)
        .context("invalid ModelConfig")?;
    Ok(Some(cfg))
}

/// Restore a model from a weights file and its sibling `config.json`.
///
/// # Errors
/// Returns an error if the config is missing or invalid, or the weights do not
/// match the configuration.
pub fn load_model(path: &Path, device: &Device) -> Result<Gpt> {
    let config = load_config_for_model(path)?.with_context(|| {
        format!(
            "no {CONFIG_FILE} next to {}; use load_model_with_config",
            path.display()
        )
    })?;
    load_model_with_config(path, config, device)
}

/// Restore a model from a weights file using an explicit configuration.
///
/// # Errors
/// Returns an error if the file is not safetensors or does not match `config`.
pub fn load_model_with_config(path: &Path, config: ModelConfig, device: &Device) -> Result<Gpt> {
    let data = std::fs::read(path).with_context(|| format!("read weights {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("parse safetensors {}", path.display()))?;
    tracing::debug!(tensors = tensors.names().len(), path = %path.display(), "loading weights");

    load_model_from_bytes(&data, config, device).context("build model from weights")
}

/// Rebuild a trainable model whose variables are initialised from `path`.
///
/// Unlike [`load_model`], the parameters stay in the returned [`VarMap`] so training
/// can resume and later snapshots can be written with [`save_checkpoint`].
///
/// # Errors
/// Returns an error if the model cannot be built or the weights cannot be loaded.
pub fn restore_varmap(path: &Path, config: ModelConfig, device: &Device) -> Result<(Gpt, VarMap)> {
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Gpt::new(config, vb).context("build model")?;
    varmap
        .load(path)
        .with_context(|| format!("load weights {}", path.display()))?;
    Ok((model, varmap))
}
