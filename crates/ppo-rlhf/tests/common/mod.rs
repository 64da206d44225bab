//! Shared fixtures: tiny models, base weights on disk and per-run checkpointers.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ppo_rlhf::models::{named_parameters, OutputHead};
use ppo_rlhf::prelude::*;
use tch::{Device, Tensor};

pub const VOCAB: i64 = 16;
pub const PAD_ID: i64 = 0;
pub const EOS_ID: i64 = 1;

pub type Recipe = PpoRecipe<TinyCausalLm, TinyCausalLm>;

pub fn model_config() -> TinyLmConfig {
    TinyLmConfig {
        vocab_size: VOCAB,
        hidden_size: 16,
        num_layers: 1,
        max_seq_len: 32,
    }
}

pub fn tokens() -> SpecialTokens {
    SpecialTokens::new(PAD_ID, EOS_ID).with_stop_tokens(vec![EOS_ID])
}

/// Small but complete run: 8 prompts per step, two forward chunks, two
/// minibatches of two microbatches each, two PPO epochs.
pub fn base_config() -> PpoConfig {
    let mut config = PpoConfig::default()
        .with_batch_sizes(8, 4, 4)
        .with_gradient_accumulation_steps(2)
        .with_ppo_epochs(2)
        .with_num_steps(8)
        .with_max_generated_tokens(6)
        .with_lr(1e-3)
        .with_seed(7);
    config.temperature = 1.0;
    config.min_response_length = None;
    config.model = model_config();
    config.tokenizer = tokens();
    config
}

pub fn dataset(num_prompts: usize) -> PromptDataset {
    PromptDataset::synthetic(num_prompts, 2, 4, 2, VOCAB, 11).unwrap()
}

pub fn models() -> PpoModels<TinyCausalLm, TinyCausalLm> {
    let config = model_config();
    PpoModels {
        policy: TinyCausalLm::new(config.clone(), OutputHead::Vocab, Device::Cpu),
        ref_policy: TinyCausalLm::new(config.clone(), OutputHead::Vocab, Device::Cpu),
        value: TinyCausalLm::new(config.clone(), OutputHead::Scalar, Device::Cpu),
        reward: TinyCausalLm::new(config, OutputHead::Scalar, Device::Cpu),
    }
}

/// Write initial policy and critic weights to `<root>/base`.
pub fn write_base_weights(root: &Path) -> PathBuf {
    let base = root.join("base");
    std::fs::create_dir_all(&base).unwrap();
    tch::manual_seed(5);
    let m = models();
    Tensor::save_multi(&named_parameters(m.policy.var_store()), base.join("policy.pt")).unwrap();
    Tensor::save_multi(&named_parameters(m.value.var_store()), base.join("critic.pt")).unwrap();
    base
}

/// Checkpointers reading the base weights and writing under `run_dir`.
pub fn checkpointers(base: &Path, run_dir: &Path, resume: bool) -> RecipeCheckpointers {
    let policy = CheckpointConfig::new(base, "policy.pt", run_dir.join("policy"))
        .model_name("policy")
        .resume(resume)
        .load_recipe_state(resume);
    let value = CheckpointConfig::new(base, "critic.pt", run_dir.join("value"))
        .model_name("value")
        .resume(resume);
    RecipeCheckpointers {
        policy: Box::new(FullModelCheckpointer::new(policy)),
        ref_policy: Box::new(FullModelCheckpointer::new(CheckpointConfig::new(
            base,
            "policy.pt",
            run_dir.join("ref_policy"),
        ))),
        value: Box::new(FullModelCheckpointer::new(value)),
        reward: Box::new(FullModelCheckpointer::new(CheckpointConfig::new(
            base,
            "critic.pt",
            run_dir.join("reward"),
        ))),
    }
}

pub fn setup(config: PpoConfig, base: &Path, run_dir: &Path, num_prompts: usize) -> Result<Recipe> {
    setup_with_logger(config, base, run_dir, num_prompts, Box::new(NoOpLogger))
}

pub fn setup_with_logger(
    config: PpoConfig,
    base: &Path,
    run_dir: &Path,
    num_prompts: usize,
    logger: Box<dyn MetricLogger>,
) -> Result<Recipe> {
    let resume = config.resume_from_checkpoint;
    PpoRecipe::setup(
        config,
        models(),
        checkpointers(base, run_dir, resume),
        dataset(num_prompts),
        &tokens(),
        logger,
    )
}

/// Left-padded prompt batch `[8, 3]`.
pub fn prompt_batch() -> Tensor {
    Tensor::from_slice(&[
        0i64, 4, 5, 6, 7, 8, 0, 0, 9, 10, 11, 12, 2, 3, 4, 0, 13, 14, 5, 5, 5, 0, 6, 2,
    ])
    .reshape([8, 3])
}

/// Metric logger keeping every logged dict in memory.
#[derive(Clone, Default)]
pub struct RecordingLogger {
    pub records: Arc<Mutex<Vec<(u64, BTreeMap<String, f64>)>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl MetricLogger for RecordingLogger {
    fn log(&self, name: &str, value: f64, step: u64) {
        let mut metrics = BTreeMap::new();
        metrics.insert(name.to_string(), value);
        self.log_dict(&metrics, step);
    }

    fn log_dict(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        self.records.lock().unwrap().push((step, metrics.clone()));
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

pub fn longs(t: &Tensor) -> Vec<i64> {
    Vec::<i64>::try_from(&t.flatten(0, -1).to_kind(tch::Kind::Int64)).unwrap()
}

pub fn floats(t: &Tensor) -> Vec<f32> {
    Vec::<f32>::try_from(&t.flatten(0, -1).to_kind(tch::Kind::Float)).unwrap()
}
