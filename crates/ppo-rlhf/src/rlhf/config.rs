//! Recipe configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::models::TinyLmConfig;
use crate::tokenizer::SpecialTokens;
use crate::utils::parse_device;
use crate::{Result, RlhfError};

/// Tokenizer section of the configuration.
pub type TokenizerConfig = SpecialTokens;

/// Model section of the configuration, used by the bundled driver.
pub type ModelConfig = TinyLmConfig;

/// PPO loss hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Policy ratio clipping range
    pub epsilon: f64,
    /// Value clipping range
    pub value_clip_range: f64,
    /// Value loss weight
    pub value_coeff: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            value_clip_range: 0.2,
            value_coeff: 0.1,
        }
    }
}

/// AdamW hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Learning rate
    pub lr: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub eps: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Maximum gradient norm before each optimizer step (disabled when `None`)
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr: 1e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: None,
        }
    }
}

/// Cosine learning-rate schedule with linear warmup
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrSchedulerConfig {
    /// Linear warmup steps
    pub num_warmup_steps: usize,
    /// Number of cosine waves over training (0.5 decays to zero once)
    pub num_cycles: f64,
}

impl Default for LrSchedulerConfig {
    fn default() -> Self {
        Self {
            num_warmup_steps: 0,
            num_cycles: 0.5,
        }
    }
}

/// Configuration for the PPO recipe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    // Batching
    /// Prompts per training step
    pub batch_size: usize,
    /// Rows per no-grad generation/forward chunk
    pub forward_batch_size: usize,
    /// Rows per optimizer step
    pub ppo_batch_size: usize,
    /// Microbatches per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Passes over each trajectory
    pub ppo_epochs: usize,
    /// Total prompts to train on; `num_steps / batch_size` training steps
    pub num_steps: usize,

    // Rewards and advantages
    /// KL penalty coefficient
    pub kl_coeff: f64,
    /// Discount factor
    pub gamma: f64,
    /// GAE lambda
    pub lmbda: f64,
    /// Whiten rewards over valid positions before GAE
    pub whiten_rewards: bool,

    // Generation
    /// Sampling temperature
    pub temperature: f64,
    /// Top-k filtering (disabled when `None`)
    pub top_k: Option<i64>,
    /// Tokens generated per prompt
    pub max_generated_tokens: usize,
    /// Use a KV-cache during generation
    pub enable_kv_cache: bool,

    // Reward penalties
    /// Penalise responses shorter than this
    pub min_response_length: Option<usize>,
    /// Penalise responses without a stop token
    pub penalise_no_eos: bool,
    /// Score assigned to penalised responses
    pub reward_penalty: f64,
    /// Stop tokens; falls back to the tokenizer's when `None`
    pub stop_token_ids: Option<Vec<i64>>,

    // Optimization
    /// Step the optimizer right after each backward pass
    pub optimizer_in_bwd: bool,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    /// Learning-rate schedule (constant when `None`)
    pub lr_scheduler: Option<LrSchedulerConfig>,

    // Data
    /// Shuffle prompts every dataset epoch
    pub shuffle: bool,

    // Checkpointing and logging
    /// Resume from the latest intermediate checkpoint
    pub resume_from_checkpoint: bool,
    /// Directory for checkpoints and logs
    pub output_dir: PathBuf,
    /// Log metrics every N training steps
    pub log_every_n_steps: usize,

    // Device
    /// Device to train on ("cpu", "cuda", "cuda:N" or "auto")
    pub device: String,

    // Random seed
    pub seed: u64,

    pub tokenizer: TokenizerConfig,
    pub model: ModelConfig,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            forward_batch_size: 16,
            ppo_batch_size: 32,
            gradient_accumulation_steps: 1,
            ppo_epochs: 2,
            num_steps: 10_000,

            kl_coeff: 0.05,
            gamma: 1.0,
            lmbda: 0.95,
            whiten_rewards: false,

            temperature: 0.7,
            top_k: None,
            max_generated_tokens: 58,
            enable_kv_cache: true,

            min_response_length: Some(18),
            penalise_no_eos: true,
            reward_penalty: -3.0,
            stop_token_ids: None,

            optimizer_in_bwd: false,
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            lr_scheduler: None,

            shuffle: true,

            resume_from_checkpoint: false,
            output_dir: PathBuf::from("output"),
            log_every_n_steps: 1,

            device: "cpu".to_string(),
            seed: 42,

            tokenizer: TokenizerConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl PpoConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Set batch, forward batch and PPO batch sizes
    pub fn with_batch_sizes(mut self, batch: usize, forward: usize, ppo: usize) -> Self {
        self.batch_size = batch;
        self.forward_batch_size = forward;
        self.ppo_batch_size = ppo;
        self
    }

    pub fn with_gradient_accumulation_steps(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps;
        self
    }

    pub fn with_ppo_epochs(mut self, epochs: usize) -> Self {
        self.ppo_epochs = epochs;
        self
    }

    /// Set the total number of prompts to train on
    pub fn with_num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn with_max_generated_tokens(mut self, tokens: usize) -> Self {
        self.max_generated_tokens = tokens;
        self
    }

    pub fn with_optimizer_in_bwd(mut self, enabled: bool) -> Self {
        self.optimizer_in_bwd = enabled;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume_from_checkpoint = resume;
        self
    }

    /// Set learning rate
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.optimizer.lr = lr;
        self
    }

    /// Training steps: whole batches of prompts in `num_steps`
    pub fn total_steps(&self) -> usize {
        self.num_steps / self.batch_size.max(1)
    }

    /// Optimizer steps per training step
    pub fn minibatches_per_step(&self) -> usize {
        self.ppo_epochs * (self.batch_size / self.ppo_batch_size.max(1))
    }

    /// Rows per backward pass
    pub fn ppo_backward_batch_size(&self) -> usize {
        self.ppo_batch_size / self.gradient_accumulation_steps.max(1)
    }

    /// Resolve the configured device
    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }

    /// Check every setting that would make the recipe fail.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("batch_size", self.batch_size),
            ("forward_batch_size", self.forward_batch_size),
            ("ppo_batch_size", self.ppo_batch_size),
            ("gradient_accumulation_steps", self.gradient_accumulation_steps),
            ("ppo_epochs", self.ppo_epochs),
            ("max_generated_tokens", self.max_generated_tokens),
            ("log_every_n_steps", self.log_every_n_steps),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RlhfError::Config(format!("{} must be positive", name)));
            }
        }

        if self.batch_size % self.forward_batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "batch_size ({}) must be divisible by forward_batch_size ({})",
                self.batch_size, self.forward_batch_size
            )));
        }
        if self.batch_size % self.ppo_batch_size != 0 {
            return Err(RlhfError::Config(format!(
                "batch_size ({}) must be divisible by ppo_batch_size ({})",
                self.batch_size, self.ppo_batch_size
            )));
        }
        if self.ppo_batch_size % self.gradient_accumulation_steps != 0 {
            return Err(RlhfError::Config(format!(
                "ppo_batch_size ({}) must be divisible by gradient_accumulation_steps ({})",
                self.ppo_batch_size, self.gradient_accumulation_steps
            )));
        }
        if self.optimizer_in_bwd && self.gradient_accumulation_steps > 1 {
            return Err(RlhfError::Config(
                "gradient accumulation is not supported with optimizer_in_bwd".to_string(),
            ));
        }
        if self.total_steps() == 0 {
            return Err(RlhfError::Config(format!(
                "num_steps ({}) must be at least batch_size ({})",
                self.num_steps, self.batch_size
            )));
        }
        if !(self.temperature > 0.0) {
            return Err(RlhfError::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if let Some(k) = self.top_k {
            if k <= 0 {
                return Err(RlhfError::Config(format!("top_k must be positive, got {}", k)));
            }
        }
        if self.optimizer.lr < 0.0 {
            return Err(RlhfError::Config("learning rate must be non-negative".to_string()));
        }

        self.device()?;
        Ok(())
    }
}
