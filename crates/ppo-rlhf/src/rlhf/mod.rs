//! PPO for RLHF.
//!
//! Leaves first:
//! - `sequence` - masks and indices derived from padding
//! - `rewards` - KL-shaped rewards, masked statistics and GAE
//! - `loss` - clipped PPO objective
//! - `trajectory` - rollout bundle and PPO statistics
//! - `generator` - trajectory rollouts over the four models
//! - `optimizer` - AdamW and the learning-rate schedule
//! - `recipe` - setup, training loop and checkpointing

pub mod config;
pub mod generator;
pub mod loss;
pub mod optimizer;
pub mod recipe;
pub mod rewards;
pub mod sequence;
pub mod trajectory;

pub use config::{
    LossConfig, LrSchedulerConfig, ModelConfig, OptimizerConfig, PpoConfig, TokenizerConfig,
};
pub use generator::{GenerationSettings, TrajectoryGenerator};
pub use loss::{approx_policy_kl, PpoLoss, PpoLossFn, PpoLossOutput};
pub use optimizer::{cosine_with_warmup_multiplier, AdamW, CosineWithWarmup, RecipeOptimizer};
pub use recipe::{
    estimate_trajectory_advantages, update_recipe_state, PpoModels, PpoRecipe, RecipeCheckpointers,
    RewardEstimate,
};
pub use rewards::{compute_rewards, estimate_advantages, masked_mean, masked_var, masked_whiten, whiten};
pub use sequence::{
    get_causal_mask_from_padding_mask, get_position_ids_from_padding_mask,
    get_reward_penalty_mask, get_unmasked_sequence_lengths, get_value_padding_masks,
    logits_to_logprobs, truncate_sequence_at_first_stop_token, truncate_sequence_for_logprobs,
};
pub use trajectory::{PpoStats, Trajectory};
