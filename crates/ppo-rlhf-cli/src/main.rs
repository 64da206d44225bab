//! PPO RLHF CLI
//!
//! Command-line driver for fine-tuning a small causal language model with
//! PPO against a learned reward model.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tch::{Device, Tensor};
use tracing_subscriber::EnvFilter;

use ppo_rlhf::models::{named_parameters, OutputHead};
use ppo_rlhf::prelude::*;

#[derive(Parser)]
#[command(name = "rlhf")]
#[command(version, about = "PPO RLHF fine-tuning for causal language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a policy with PPO
    Train {
        /// JSON configuration file; defaults are used when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSONL file of tokenized prompts
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Number of synthetic prompts when no prompt file is given
        #[arg(long, default_value = "256")]
        num_prompts: usize,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Resume from the latest intermediate checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// Validate a configuration file and print the training schedule
    CheckConfig {
        /// JSON configuration file
        config: PathBuf,
    },

    /// Print the default configuration as JSON
    InitConfig {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            prompts,
            num_prompts,
            output_dir,
            resume,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            if resume {
                config.resume_from_checkpoint = true;
            }
            train(config, prompts.as_deref(), num_prompts)?;
        }
        Commands::CheckConfig { config } => {
            check_config(&config)?;
        }
        Commands::InitConfig { output } => {
            let json = PpoConfig::default().to_json_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PpoConfig> {
    match path {
        Some(path) => PpoConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(PpoConfig::default()),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(Some(path))?;
    config.validate()?;

    println!("Configuration OK");
    println!("  training steps:        {}", config.total_steps());
    println!("  optimizer steps/step:  {}", config.minibatches_per_step());
    println!("  backward batch size:   {}", config.ppo_backward_batch_size());
    println!("  optimizer in backward: {}", config.optimizer_in_bwd);
    Ok(())
}

/// Initial weights for the policy, the critic and the reward model.
///
/// Existing files are kept so that a resumed run sees the same references.
fn write_base_weights(config: &PpoConfig, base: &Path, device: Device) -> Result<()> {
    std::fs::create_dir_all(base)?;
    let files = [
        ("policy.pt", OutputHead::Vocab),
        ("critic.pt", OutputHead::Scalar),
        ("reward.pt", OutputHead::Scalar),
    ];
    for (file, head) in files {
        let path = base.join(file);
        if path.exists() {
            continue;
        }
        let model = TinyCausalLm::new(config.model.clone(), head, device);
        Tensor::save_multi(&named_parameters(model.var_store()), &path)?;
        tracing::info!(path = %path.display(), "Wrote initial weights");
    }
    Ok(())
}

fn checkpointers(base: &Path, output: &Path, resume: bool) -> RecipeCheckpointers {
    let policy = CheckpointConfig::new(base, "policy.pt", output.join("policy"))
        .model_name("policy")
        .resume(resume)
        .load_recipe_state(resume);
    let value = CheckpointConfig::new(base, "critic.pt", output.join("value"))
        .model_name("value")
        .resume(resume);
    let ref_policy = CheckpointConfig::new(base, "policy.pt", output.join("ref_policy"))
        .model_name("ref_policy");
    let reward =
        CheckpointConfig::new(base, "reward.pt", output.join("reward")).model_name("reward");

    RecipeCheckpointers {
        policy: Box::new(FullModelCheckpointer::new(policy)),
        ref_policy: Box::new(FullModelCheckpointer::new(ref_policy)),
        value: Box::new(FullModelCheckpointer::new(value)),
        reward: Box::new(FullModelCheckpointer::new(reward)),
    }
}

fn metric_logger(output: &Path) -> Result<Box<dyn MetricLogger>> {
    let mut logger = CompositeLogger::new(vec![Box::new(ConsoleLogger::new())]);
    logger.add(Box::new(DiskLogger::new(output.join("logs"))?));
    #[cfg(feature = "tensorboard")]
    logger.add(Box::new(TensorBoardLogger::new(output.join("tensorboard"))));
    Ok(Box::new(logger))
}

fn train(config: PpoConfig, prompts: Option<&Path>, num_prompts: usize) -> Result<()> {
    config.validate()?;
    let device = config.device()?;
    let tokens = config.tokenizer.clone();
    let output = config.output_dir.clone();
    let base = output.join("base");

    tracing::info!(
        output = %output.display(),
        device = ?device,
        resume = config.resume_from_checkpoint,
        "Starting PPO training"
    );

    tch::manual_seed(config.seed as i64);
    write_base_weights(&config, &base, device)?;

    let dataset = match prompts {
        Some(path) => PromptDataset::from_jsonl(path)?,
        None => {
            let first_token = tokens.pad_id.max(tokens.eos_id) + 1;
            PromptDataset::synthetic(
                num_prompts,
                4,
                16,
                first_token,
                config.model.vocab_size,
                config.seed,
            )?
        }
    };

    let models = PpoModels {
        policy: TinyCausalLm::new(config.model.clone(), OutputHead::Vocab, device),
        ref_policy: TinyCausalLm::new(config.model.clone(), OutputHead::Vocab, device),
        value: TinyCausalLm::new(config.model.clone(), OutputHead::Scalar, device),
        reward: TinyCausalLm::new(config.model.clone(), OutputHead::Scalar, device),
    };

    let checkpointers = checkpointers(&base, &output, config.resume_from_checkpoint);
    let logger = metric_logger(&output)?;

    let mut recipe = PpoRecipe::setup(config, models, checkpointers, dataset, &tokens, logger)?;
    recipe.train()?;
    recipe.cleanup();

    println!(
        "Training complete: {} steps, {} optimizer steps, checkpoints in {}",
        recipe.state().steps_run,
        recipe.global_step(),
        output.display()
    );
    Ok(())
}
