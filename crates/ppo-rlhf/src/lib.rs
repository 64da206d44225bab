//! # ppo-rlhf
//!
//! RLHF fine-tuning of causal language models with Proximal Policy Optimization.
//!
//! ## Overview
//!
//! ppo-rlhf provides:
//! - Batched autoregressive generation with an optional scoped KV-cache
//! - Trajectory construction from four models (policy, frozen reference policy,
//!   value model, frozen reward model)
//! - KL-shaped rewards, masked GAE and the clipped PPO objective
//! - A recipe driver with gradient accumulation, optimizer-in-backward mode,
//!   cosine learning-rate scheduling and bit-exact resumption
//!
//! ## Features
//!
//! - `download-libtorch` (default) - Fetch a prebuilt libtorch at build time
//! - `tensorboard` - Enable the TensorBoard metric logger
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ppo_rlhf::prelude::*;
//!
//! let config = PpoConfig::default().with_batch_sizes(8, 4, 4);
//! let mut recipe = PpoRecipe::setup(config, models, checkpointers, dataset, &tokens, logger)?;
//! recipe.train()?;
//! recipe.cleanup();
//! ```

pub mod checkpoint;
pub mod data;
pub mod generation;
pub mod log;
pub mod models;
pub mod rlhf;
pub mod tokenizer;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    // Checkpoint exports
    pub use crate::checkpoint::{
        CheckpointConfig, CheckpointDict, Checkpointable, Checkpointer, FullModelCheckpointer,
        OptimizerState, RecipeState,
    };

    // Logging exports
    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::log::{CompositeLogger, ConsoleLogger, DiskLogger, MetricLogger, NoOpLogger};

    pub use crate::data::{PromptDataLoader, PromptDataset};
    pub use crate::generation::{generate, sample};
    pub use crate::models::{
        CausalModel, HasVarStore, KvCacheGuard, KvCacheable, TinyCausalLm, TinyLmConfig,
    };
    pub use crate::rlhf::{
        AdamW, CosineWithWarmup, PpoConfig, PpoLoss, PpoLossFn, PpoModels, PpoRecipe, PpoStats,
        RecipeCheckpointers, RecipeOptimizer, Trajectory, TrajectoryGenerator,
    };
    pub use crate::tokenizer::{SpecialTokens, TokenizerInfo};
    pub use crate::{Result, RlhfError};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum RlhfError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Missing key in recipe state: {0}")]
    MissingStateKey(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, RlhfError>;
