//! MoE GPT CLI
//!
//! Greedy text continuation and training for a GPT / Mixture-of-Experts model.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use moe_gpt::data;
use moe_gpt::inference::{GenerationConfig, generate};
use moe_gpt::model::{Gpt, ModelConfig, num_parameters};
use moe_gpt::tokenizer;
use moe_gpt::training::{self, TrainConfig};
use moe_gpt::weights;

/// Architecture used when no checkpoint is given.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Preset {
    /// Small MoE model, fast on CPU
    #[default]
    Tiny,
    /// GPT-2 small layout
    #[value(name = "gpt-124m")]
    Gpt124m,
    /// Rotary / RMSNorm / MoE layout
    Tunx,
}

impl Preset {
    fn config(self) -> ModelConfig {
        match self {
            Self::Tiny => ModelConfig::tiny(),
            Self::Gpt124m => ModelConfig::gpt_124m(),
            Self::Tunx => ModelConfig::tunx(),
        }
    }
}

/// Output format for generated text.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// JSON with metadata
    Json,
}

/// Greedy text generation with a GPT / Mixture-of-Experts transformer.
#[derive(Debug, Parser)]
#[command(
    name = "moe-gpt",
    version,
    about = "Greedy text generation with a GPT / Mixture-of-Experts transformer",
    long_about = "Runs a decoder-only transformer (optionally with sparse MoE feed-forward layers) \
                  and greedily extends the prompt. Models with 256 or fewer ids use byte-level \
                  tokens; 50257-id models use the GPT-2 BPE.\n\n\
                  Without --model a freshly initialised model from --preset is used. \
                  `moe-gpt train` trains a model on a JSON-lines corpus.",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Prompt text to continue
    #[arg(index = 1)]
    prompt: Option<String>,

    /// Path to a model_epoch_N.safetensors checkpoint (config.json must sit beside it)
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Architecture for a fresh model when --model is not given
    #[arg(long, value_enum, default_value = "tiny")]
    preset: Preset,

    /// Number of tokens to append
    #[arg(short = 'n', long, default_value = "32")]
    max_new_tokens: usize,

    /// Context window fed to the model each step (defaults to max_seq_len)
    #[arg(long)]
    context_size: Option<usize>,

    /// Print model info and exit
    #[arg(long)]
    info: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on a JSON-lines corpus and write epoch checkpoints
    Train(TrainArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// JSON-lines corpus: one {"content": ..} object or array of strings per line
    #[arg(long)]
    data: PathBuf,

    /// Architecture for a fresh model when --resume is not given
    #[arg(long, value_enum, default_value = "tiny")]
    preset: Preset,

    /// Continue from a model_epoch_N.safetensors checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Passes over the corpus
    #[arg(long, default_value = "2")]
    epochs: usize,

    /// Windows per optimizer step
    #[arg(long, default_value = "4")]
    batch_size: usize,

    /// Peak learning rate
    #[arg(long, default_value = "4e-4")]
    lr: f64,

    /// AdamW weight decay
    #[arg(long, default_value = "0.1")]
    weight_decay: f64,

    /// Tokens per training window (defaults to max_seq_len)
    #[arg(long)]
    window: Option<usize>,

    /// Tokens between window starts (defaults to the window)
    #[arg(long)]
    stride: Option<usize>,

    /// Save after every N-th epoch, counting from epoch 0
    #[arg(long, default_value = "2")]
    checkpoint_every: usize,

    /// Checkpoint directory
    #[arg(short, long, default_value = "checkpoints")]
    out: PathBuf,
}

#[derive(Debug, Serialize)]
struct JsonOutput {
    prompt: String,
    text: String,
    prompt_tokens: usize,
    generated_tokens: usize,
    context_size: usize,
    generation_time_ms: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let device = Device::Cpu;
    if let Some(Command::Train(args)) = &cli.command {
        return run_train(args, &device);
    }

    let (model, parameters) = load_cli_model(&cli, &device)?;

    if cli.info {
        print_model_info(&cli, &model, parameters);
        return Ok(());
    }

    let prompt = cli.prompt.as_deref().context(
        "No prompt provided. Usage: moe-gpt \"Every effort moves you\"\n\
         Run moe-gpt --help for more options.",
    )?;
    run(&cli, &model, prompt)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

/// Returns the model and, for fresh models, its parameter count.
fn load_cli_model(cli: &Cli, device: &Device) -> Result<(Gpt, Option<usize>)> {
    if let Some(path) = cli.model.as_ref() {
        if !path.exists() {
            anyhow::bail!("Model file not found: {}", path.display());
        }
        tracing::info!(path = %path.display(), "loading checkpoint");
        let model = weights::load_model(path, device).context("Failed to load model")?;
        return Ok((model, None));
    }

    let config = cli.preset.config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Gpt::new(config, vb).context("Failed to build model")?;
    let parameters = num_parameters(&varmap);
    tracing::info!(preset = ?cli.preset, parameters, "initialised fresh model");
    Ok((model, Some(parameters)))
}

fn print_model_info(cli: &Cli, model: &Gpt, parameters: Option<usize>) {
    let config = model.config();

    println!("MoE GPT Model Info");
    println!("==================");
    println!();
    println!("  Vocabulary size: {} tokens", config.vocab_size);
    println!("  Context length:  {} tokens", config.max_seq_len);
    println!("  Layers:          {}", config.n_layers);
    println!("  Attention heads: {}", config.n_heads);
    println!("  Embedding dim:   {}", config.dim);
    println!("  Positions:       {:?}", config.position);
    println!("  Norm:            {:?} ({:?})", config.norm, config.residual);
    match &config.moe {
        Some(moe) => println!(
            "  MoE:             {} routed / {} shared, top-{}, {:?} gate, from layer {}",
            moe.n_routed_experts,
            moe.n_shared_experts,
            moe.n_activated_experts,
            moe.score_func,
            moe.n_dense_layers
        ),
        None => println!("  MoE:             none"),
    }
    if let Some(n) = parameters {
        println!("  Parameters:      {n}");
    }
    println!();

    match &cli.model {
        Some(path) => println!("Checkpoint: {}", path.display()),
        None => println!("Checkpoint: none (fresh {:?} preset)", cli.preset),
    }
}

fn run(cli: &Cli, model: &Gpt, prompt: &str) -> Result<()> {
    let tok = tokenizer::for_vocab_size(model.config().vocab_size)?;
    let prompt_ids = tok.encode(prompt);
    if prompt_ids.is_empty() {
        anyhow::bail!("Prompt must not be empty");
    }
    if let Some(bad) = prompt_ids
        .iter()
        .find(|&&id| id as usize >= model.config().vocab_size)
    {
        anyhow::bail!(
            "Prompt token {bad} is outside the model vocabulary ({})",
            model.config().vocab_size
        );
    }

    let mut cfg = GenerationConfig::for_model(model, cli.max_new_tokens);
    if let Some(context_size) = cli.context_size {
        cfg.context_size = context_size;
    }

    let start = Instant::now();
    let tokens = generate(model, &prompt_ids, &cfg).context("Generation failed")?;
    let generation_time_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
    tracing::debug!(generation_time_ms, "generation finished");

    let text = tok.decode(&tokens);
    match cli.format {
        OutputFormat::Plain => println!("{text}"),
        OutputFormat::Json => {
            let payload = JsonOutput {
                prompt: prompt.to_string(),
                text,
                prompt_tokens: prompt_ids.len(),
                generated_tokens: tokens.len() - prompt_ids.len(),
                context_size: cfg.context_size,
                generation_time_ms,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

fn run_train(args: &TrainArgs, device: &Device) -> Result<()> {
    let (model, varmap) = match &args.resume {
        Some(path) => {
            let config = weights::load_config_for_model(path)?.with_context(|| {
                format!("No {} beside {}", weights::CONFIG_FILE, path.display())
            })?;
            tracing::info!(path = %path.display(), "resuming from checkpoint");
            weights::restore_varmap(path, config, device).context("Failed to resume training")?
        }
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            let model = Gpt::new(args.preset.config(), vb).context("Failed to build model")?;
            tracing::info!(
                preset = ?args.preset,
                parameters = num_parameters(&varmap),
                "initialised fresh model"
            );
            (model, varmap)
        }
    };

    let vocab_size = model.config().vocab_size;
    let max_seq_len = model.config().max_seq_len;
    let window = args.window.unwrap_or(max_seq_len);
    if window > max_seq_len {
        anyhow::bail!("Window {window} exceeds the model context ({max_seq_len})");
    }
    let stride = args.stride.unwrap_or(window);

    let tok = tokenizer::for_vocab_size(vocab_size)?;
    let texts = data::read_jsonl_texts(&args.data)?;
    let examples = data::windows_from_texts(&texts, tok.as_ref(), window, stride)?;
    if let Some(bad) = examples
        .iter()
        .flat_map(|e| e.input_ids.iter().chain(&e.labels))
        .find(|&&id| id as usize >= vocab_size)
    {
        anyhow::bail!("Corpus token {bad} is outside the model vocabulary ({vocab_size})");
    }
    tracing::info!(
        texts = texts.len(),
        examples = examples.len(),
        window,
        stride,
        "prepared corpus"
    );

    let config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.lr,
        weight_decay: args.weight_decay,
        checkpoint_every: args.checkpoint_every,
        checkpoint_dir: Some(args.out.clone()),
        ..TrainConfig::default()
    };
    let start = Instant::now();
    let report = training::train(&model, &varmap, &examples, &config)?;

    let last_epoch = args.epochs.saturating_sub(1);
    if !report
        .checkpoints
        .contains(&weights::checkpoint_path(&args.out, last_epoch))
    {
        weights::save_checkpoint(&varmap, model.config(), &args.out, last_epoch)?;
    }
    tracing::info!(
        steps = report.steps,
        final_loss = ?report.losses.last(),
        elapsed_s = start.elapsed().as_secs(),
        "training finished"
    );
    Ok(())
}
