//! Checkpoint payloads: model weights, optimizer state and recipe state.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tch::Tensor;

use crate::data::DataLoaderState;
use crate::{Result, RlhfError};

pub const SEED_KEY: &str = "seed";
pub const EPOCHS_KEY: &str = "epochs_run";
pub const TOTAL_EPOCHS_KEY: &str = "total_epochs";
pub const TOTAL_STEPS_KEY: &str = "total_steps";
pub const STEPS_KEY: &str = "steps_run";
pub const RNG_KEY: &str = "rng_state";
pub const DATALOADER_KEY: &str = "dataloader";
pub const OPTIMIZER_KEY: &str = "optimizer";

/// Trait for components whose state can be saved and restored as bytes.
pub trait Checkpointable {
    /// Serialize current state to bytes.
    fn save_state(&self) -> Result<Vec<u8>>;

    /// Restore state from bytes.
    fn load_state(&mut self, data: &[u8]) -> Result<()>;
}

/// Optimizer snapshot.
#[derive(Debug)]
pub struct OptimizerState {
    /// Whether the optimizer was stepping inside the backward pass
    pub in_backward: bool,
    pub step: i64,
    pub lr: f64,
    /// Named moment tensors
    pub tensors: Vec<(String, Tensor)>,
}

/// Scalar part of an [`OptimizerState`], stored alongside the recipe state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerMeta {
    pub in_backward: bool,
    pub step: i64,
    pub lr: f64,
}

impl OptimizerState {
    pub fn meta(&self) -> OptimizerMeta {
        OptimizerMeta {
            in_backward: self.in_backward,
            step: self.step,
            lr: self.lr,
        }
    }

    pub fn from_parts(meta: OptimizerMeta, tensors: Vec<(String, Tensor)>) -> Self {
        Self {
            in_backward: meta.in_backward,
            step: meta.step,
            lr: meta.lr,
            tensors,
        }
    }
}

/// What a checkpointer saves and loads for one model.
#[derive(Debug, Default)]
pub struct CheckpointDict {
    /// Named model weights
    pub model: Vec<(String, Tensor)>,
    /// Optimizer state, present in intermediate policy checkpoints
    pub optimizer: Option<OptimizerState>,
    /// Recipe progress keyed by the `*_KEY` constants
    pub recipe_state: Option<Value>,
}

impl CheckpointDict {
    pub fn new(model: Vec<(String, Tensor)>) -> Self {
        Self {
            model,
            optimizer: None,
            recipe_state: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerState) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_recipe_state(mut self, state: Value) -> Self {
        self.recipe_state = Some(state);
        self
    }
}

/// Progress of a training run, owned by the recipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecipeState {
    pub seed: u64,
    /// Completed training steps
    pub steps_run: u64,
    pub total_steps: u64,
    /// Completed dataset epochs
    pub epochs_run: u64,
    pub total_epochs: u64,
    /// Optimizer steps taken; drives the LR schedule
    pub global_step: u64,
    /// Shared generator for sampling and shuffling
    pub rng: ChaCha8Rng,
}

impl RecipeState {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            steps_run: 0,
            total_steps: 0,
            epochs_run: 0,
            total_epochs: 0,
            global_step: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Recipe-state entries of an intermediate checkpoint.
    pub fn to_checkpoint_value(&self, dataloader: Option<&DataLoaderState>) -> Result<Value> {
        let mut map = Map::new();
        map.insert(SEED_KEY.to_string(), serde_json::to_value(self.seed)?);
        map.insert(EPOCHS_KEY.to_string(), serde_json::to_value(self.epochs_run)?);
        map.insert(TOTAL_EPOCHS_KEY.to_string(), serde_json::to_value(self.total_epochs)?);
        map.insert(TOTAL_STEPS_KEY.to_string(), serde_json::to_value(self.total_steps)?);
        map.insert(STEPS_KEY.to_string(), serde_json::to_value(self.steps_run)?);
        map.insert(RNG_KEY.to_string(), serde_json::to_value(&self.rng)?);
        if let Some(state) = dataloader {
            map.insert(DATALOADER_KEY.to_string(), serde_json::to_value(state)?);
        }
        Ok(Value::Object(map))
    }
}

impl Checkpointable for RecipeState {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        *self = serde_json::from_slice(data)?;
        Ok(())
    }
}

/// Read a required key from a recipe-state value.
pub fn read_state_key<T: DeserializeOwned>(state: &Value, key: &str) -> Result<T> {
    let value = state
        .get(key)
        .ok_or_else(|| RlhfError::MissingStateKey(key.to_string()))?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Read an optional key from a recipe-state value.
pub fn read_optional_state_key<T: DeserializeOwned>(state: &Value, key: &str) -> Result<Option<T>> {
    match state.get(key) {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}
