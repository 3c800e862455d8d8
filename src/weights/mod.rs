//! Checkpoint persistence.
//!
//! A checkpoint directory holds `model_epoch_{epoch}.safetensors` snapshots next to
//! the `config.json` needed to rebuild the model they belong to.

pub mod checkpoint;

pub use checkpoint::{
    CONFIG_FILE, checkpoint_path, load_config_for_model, load_model, load_model_with_config,
    restore_varmap, save_checkpoint,
};
