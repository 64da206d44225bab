//! Checkpointing for fault-tolerant training.
//!
//! Weights are stored per model and epoch. Intermediate checkpoints of the
//! policy additionally carry the optimizer moments and the recipe state
//! (progress counters, dataloader position and the shared RNG), which is
//! enough to resume a run bit-for-bit.

mod manager;
mod state;

pub use manager::{
    CheckpointConfig, Checkpointer, FullModelCheckpointer, OPTIMIZER_FILE, RECIPE_STATE_FILE,
};
pub use state::{
    read_optional_state_key, read_state_key, CheckpointDict, Checkpointable, OptimizerMeta,
    OptimizerState, RecipeState, DATALOADER_KEY, EPOCHS_KEY, OPTIMIZER_KEY, RNG_KEY, SEED_KEY,
    STEPS_KEY, TOTAL_EPOCHS_KEY, TOTAL_STEPS_KEY,
};
