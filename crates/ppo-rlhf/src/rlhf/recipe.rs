//! PPO recipe: setup, training loop, PPO step and checkpointing.

use std::collections::BTreeMap;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use serde_json::Value;
use tch::{Device, Kind, Tensor};

use super::config::PpoConfig;
use super::generator::{GenerationSettings, TrajectoryGenerator};
use super::loss::{approx_policy_kl, PpoLoss, PpoLossFn};
use super::optimizer::{AdamW, CosineWithWarmup, RecipeOptimizer};
use super::rewards::{compute_rewards, estimate_advantages, masked_whiten};
use super::sequence::{logits_to_logprobs, truncate_sequence_for_logprobs};
use super::trajectory::{PpoStats, Trajectory};
use crate::checkpoint::{
    read_optional_state_key, read_state_key, CheckpointDict, Checkpointer, RecipeState,
    DATALOADER_KEY, EPOCHS_KEY, RNG_KEY, SEED_KEY, STEPS_KEY, TOTAL_EPOCHS_KEY, TOTAL_STEPS_KEY,
};
use crate::data::{DataLoaderState, PromptDataLoader, PromptDataset};
use crate::log::MetricLogger;
use crate::models::{
    load_named_parameters, named_parameters, num_trainable_parameters, CausalModel, KvCacheable,
};
use crate::tokenizer::{resolve_stop_tokens, TokenizerInfo};
use crate::utils::{abbreviate, format_duration, set_seed};
use crate::{Result, RlhfError};

/// The four networks of a PPO run.
///
/// The policy and the reference policy share an architecture, as do the value
/// and the reward model.
pub struct PpoModels<P, C> {
    pub policy: P,
    pub ref_policy: P,
    pub value: C,
    pub reward: C,
}

/// One checkpointer per model. Only the policy checkpointer carries recipe
/// state; the reference and reward checkpointers are read once at setup.
pub struct RecipeCheckpointers {
    pub policy: Box<dyn Checkpointer>,
    pub ref_policy: Box<dyn Checkpointer>,
    pub value: Box<dyn Checkpointer>,
    pub reward: Box<dyn Checkpointer>,
}

/// Single-device PPO fine-tuning recipe.
pub struct PpoRecipe<P, C> {
    config: PpoConfig,
    device: Device,
    models: PpoModels<P, C>,
    policy_checkpointer: Box<dyn Checkpointer>,
    value_checkpointer: Box<dyn Checkpointer>,
    optimizer: Box<dyn RecipeOptimizer>,
    lr_scheduler: Option<CosineWithWarmup>,
    loss_fn: Box<dyn PpoLossFn>,
    dataloader: PromptDataLoader,
    generation: GenerationSettings,
    metric_logger: Box<dyn MetricLogger>,
    state: RecipeState,
    last_loss: f64,
}

impl<P, C> PpoRecipe<P, C>
where
    P: CausalModel + KvCacheable,
    C: CausalModel,
{
    /// Build a recipe ready to train.
    ///
    /// Validates the configuration, loads all four models, freezes the
    /// reference and reward models, sets up the optimizer over the policy and
    /// value parameters and, when resuming, restores optimizer and recipe
    /// state from the policy checkpoint.
    pub fn setup(
        config: PpoConfig,
        mut models: PpoModels<P, C>,
        checkpointers: RecipeCheckpointers,
        dataset: PromptDataset,
        tokenizer: &dyn TokenizerInfo,
        metric_logger: Box<dyn MetricLogger>,
    ) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        let mut state = RecipeState::new(set_seed(config.seed));

        metric_logger.log_config(&serde_json::to_value(&config)?);

        let policy_dict = checkpointers.policy.load_checkpoint()?;
        let ref_dict = checkpointers.ref_policy.load_checkpoint()?;
        let value_dict = checkpointers.value.load_checkpoint()?;
        let reward_dict = checkpointers.reward.load_checkpoint()?;

        load_named_parameters(models.policy.var_store(), &policy_dict.model)?;
        load_named_parameters(models.ref_policy.var_store(), &ref_dict.model)?;
        load_named_parameters(models.value.var_store(), &value_dict.model)?;
        load_named_parameters(models.reward.var_store(), &reward_dict.model)?;

        models.ref_policy.var_store_mut().freeze();
        models.reward.var_store_mut().freeze();
        tracing::info!(
            policy = %abbreviate(num_trainable_parameters(models.policy.var_store()) as u64),
            value = %abbreviate(num_trainable_parameters(models.value.var_store()) as u64),
            "Models are initialized; reference and reward models frozen"
        );

        let mut optimizer = AdamW::from_var_stores(
            &[
                ("policy", models.policy.var_store()),
                ("value", models.value.var_store()),
            ],
            &config.optimizer,
        );
        if config.resume_from_checkpoint {
            let saved = policy_dict.optimizer.as_ref().ok_or_else(|| {
                RlhfError::Checkpoint("policy checkpoint has no optimizer state".to_string())
            })?;
            if saved.in_backward != config.optimizer_in_bwd {
                return Err(RlhfError::Checkpoint(format!(
                    "optimizer state was saved with optimizer_in_bwd={} but the run uses optimizer_in_bwd={}",
                    saved.in_backward, config.optimizer_in_bwd
                )));
            }
            optimizer.load_state(saved)?;
        }
        tracing::info!(
            variables = optimizer.num_variables(),
            in_backward = config.optimizer_in_bwd,
            "Optimizer is initialized"
        );

        let loss_fn = PpoLoss::new(
            config.loss.epsilon,
            config.loss.value_clip_range,
            config.loss.value_coeff,
        );

        let batches_per_epoch = dataset.len() / config.batch_size;
        if batches_per_epoch == 0 {
            return Err(RlhfError::Data(format!(
                "dataset has {} prompts, fewer than batch_size ({})",
                dataset.len(),
                config.batch_size
            )));
        }
        state.total_steps = config.total_steps() as u64;
        state.total_epochs = state.total_steps.div_ceil(batches_per_epoch as u64);
        if state.total_steps < batches_per_epoch as u64 {
            tracing::warn!(
                "There are fewer total steps ({}) than batches in the dataset ({}); \
                 training will stop without saving intermediate checkpoints",
                state.total_steps,
                batches_per_epoch
            );
        }
        if state.total_steps > batches_per_epoch as u64 && state.total_steps % batches_per_epoch as u64 != 0 {
            tracing::warn!(
                "num_steps ({}) does not evenly cover the {} batches of a dataset epoch; \
                 intermediate checkpoints are only saved every {} steps",
                config.num_steps,
                batches_per_epoch,
                batches_per_epoch
            );
        }
        tracing::info!(
            total_steps = state.total_steps,
            total_epochs = state.total_epochs,
            "Training schedule"
        );

        let stop_token_ids = resolve_stop_tokens(config.stop_token_ids.as_deref(), tokenizer);
        if config.stop_token_ids.is_some() && !stop_token_ids.contains(&tokenizer.eos_id()) {
            tracing::warn!(
                "tokenizer eos_id ({}) is not in stop_token_ids ({:?}); this may lead to unexpected behaviour",
                tokenizer.eos_id(),
                stop_token_ids
            );
        }

        let mut loader_state = None;
        if config.resume_from_checkpoint {
            let saved = policy_dict.recipe_state.as_ref().ok_or_else(|| {
                RlhfError::Checkpoint("policy checkpoint has no recipe state to resume from".to_string())
            })?;
            loader_state = update_recipe_state(&mut state, saved)?;
        }

        let mut dataloader = PromptDataLoader::new(
            dataset,
            config.batch_size,
            config.shuffle,
            state.seed,
            tokenizer.pad_id(),
        );
        if let Some(loader_state) = &loader_state {
            dataloader.load_state_dict(loader_state);
        }

        let steps_per_batch = config.minibatches_per_step() as u64;
        state.global_step = state.steps_run * steps_per_batch;

        let mut optimizer: Box<dyn RecipeOptimizer> = Box::new(optimizer);
        let lr_scheduler = match &config.lr_scheduler {
            Some(sched) => {
                let scheduler = CosineWithWarmup::new(
                    optimizer.as_mut(),
                    config.optimizer.lr,
                    sched.num_warmup_steps,
                    (state.total_steps * steps_per_batch) as usize,
                    sched.num_cycles,
                    state.global_step as usize,
                );
                tracing::info!("Learning rate scheduler is initialized");
                Some(scheduler)
            }
            None => {
                tracing::info!("No learning rate scheduler configured; using constant learning rate");
                None
            }
        };

        let generation = GenerationSettings::from_config(&config, tokenizer.pad_id(), stop_token_ids);

        Ok(Self {
            config,
            device,
            models,
            policy_checkpointer: checkpointers.policy,
            value_checkpointer: checkpointers.value,
            optimizer,
            lr_scheduler,
            loss_fn: Box::new(loss_fn),
            dataloader,
            generation,
            metric_logger,
            state,
            last_loss: 0.0,
        })
    }

    /// Run the training loop until `total_steps` training steps are done.
    pub fn train(&mut self) -> Result<()> {
        if !self.config.optimizer_in_bwd {
            self.optimizer.zero_grad();
        }

        let progress = ProgressBar::new(self.state.total_steps);
        progress.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
        );
        progress.set_position(self.state.steps_run);

        let start = Instant::now();
        for epoch in self.state.epochs_run..self.state.total_epochs {
            let completed = self.train_epoch(epoch, Some(&progress))?;
            if completed {
                break;
            }
        }

        progress.finish_with_message("Training complete");
        tracing::info!(
            steps = self.state.steps_run,
            elapsed = %format_duration(start.elapsed().as_secs_f64()),
            "Training finished"
        );
        Ok(())
    }

    /// Run one dataset epoch and save its checkpoint.
    ///
    /// Returns `true` once `total_steps` training steps have been run, in
    /// which case the checkpoint is final rather than intermediate.
    pub fn train_epoch(&mut self, epoch: u64, progress: Option<&ProgressBar>) -> Result<bool> {
        self.dataloader.set_epoch(epoch);
        let mut completed = self.state.steps_run >= self.state.total_steps;

        while !completed {
            let Some(batch) = self.dataloader.next_batch(self.device) else {
                break;
            };
            self.train_step(&batch)?;

            if let Some(pb) = progress {
                pb.inc(1);
                pb.set_message(format!("loss: {:.4}", self.last_loss));
            }
            completed = self.state.steps_run == self.state.total_steps;
        }

        self.state.epochs_run += 1;
        self.save_checkpoint(epoch, !completed)?;
        Ok(completed)
    }

    /// One training step: roll out, score, and run `ppo_epochs` passes of
    /// minibatch updates over the trajectory.
    pub fn train_step(&mut self, batch: &Tensor) -> Result<()> {
        let context_length = batch.size()[1];
        let num_tokens = batch.numel() as f64;

        let t0 = Instant::now();
        let trajectory = self.generate_trajectory_batched(batch)?;
        let traj_time = t0.elapsed().as_secs_f64();

        let RewardEstimate {
            kl,
            kl_rewards,
            advantages,
            returns,
            ..
        } = estimate_trajectory_advantages(&trajectory, &self.config)?;

        let t1 = Instant::now();
        let rows = trajectory.batch_size();
        let backward_batch_size = self.config.ppo_backward_batch_size();
        let mut ppo_stats = Vec::with_capacity(self.config.minibatches_per_step());

        for _ in 0..self.config.ppo_epochs {
            let mut idxs: Vec<i64> = (0..rows).collect();
            idxs.shuffle(&mut self.state.rng);

            for minibatch in idxs.chunks(self.config.ppo_batch_size) {
                let mut micro_stats = Vec::with_capacity(self.config.gradient_accumulation_steps);
                for microbatch in minibatch.chunks(backward_batch_size) {
                    let index = Tensor::from_slice(microbatch).to_device(self.device);
                    let slice = trajectory.index_select(&index);
                    micro_stats.push(self.ppo_step(
                        &slice,
                        &advantages.index_select(0, &index),
                        &returns.index_select(0, &index),
                        context_length,
                    ));
                }
                ppo_stats.push(PpoStats::sum(&micro_stats));

                if !self.config.optimizer_in_bwd {
                    self.optimizer_step();
                }
                if let Some(scheduler) = &mut self.lr_scheduler {
                    scheduler.step(self.optimizer.as_mut());
                }
                self.state.global_step += 1;
            }
        }
        let ppo_time = t1.elapsed().as_secs_f64();

        self.state.steps_run += 1;
        if self.state.steps_run % self.config.log_every_n_steps as u64 == 0 {
            let stats = PpoStats::stack(&ppo_stats);
            self.log_metrics(
                &trajectory,
                &stats,
                &kl,
                &kl_rewards,
                num_tokens / traj_time.max(1e-9),
                num_tokens / ppo_time.max(1e-9),
            );
        }
        Ok(())
    }

    /// Roll out a full batch of prompts with the current policy.
    pub fn generate_trajectory_batched(&mut self, input_ids: &Tensor) -> Result<Trajectory> {
        let mut generator = TrajectoryGenerator::new(
            &mut self.models.policy,
            &self.models.ref_policy,
            &self.models.value,
            &self.models.reward,
            &self.generation,
        );
        generator.generate_trajectory_batched(input_ids, &mut self.state.rng)
    }

    /// Forward and backward pass on one microbatch.
    ///
    /// Every returned statistic is scaled by `1 / gradient_accumulation_steps`
    /// so that summing the microbatches of a minibatch yields its mean.
    pub fn ppo_step(
        &mut self,
        trajectory: &Trajectory,
        advantages: &Tensor,
        returns: &Tensor,
        context_length: i64,
    ) -> PpoStats {
        let gas = self.config.gradient_accumulation_steps as f64;
        let seq_len = trajectory.query_responses.size()[1];
        let responses = trajectory
            .query_responses
            .narrow(1, context_length, seq_len - context_length);

        let pi_logits = self.models.policy.forward(
            &trajectory.query_responses,
            &trajectory.position_ids,
            &trajectory.masks,
        );
        let pi_logits = truncate_sequence_for_logprobs(&pi_logits, context_length);
        let pi_logprobs = logits_to_logprobs(&pi_logits, &responses, self.config.temperature)
            .masked_fill(&trajectory.response_padding_masks, 1.0);

        let phi_values = self.models.value.forward(
            &trajectory.query_responses,
            &trajectory.position_ids,
            &trajectory.masks,
        );
        let phi_values = truncate_sequence_for_logprobs(&phi_values, context_length)
            .squeeze_dim(-1)
            .masked_fill(&trajectory.value_padding_masks, 0.0);

        let out = self.loss_fn.compute(
            &trajectory.logprobs,
            &pi_logprobs,
            advantages,
            &trajectory.values,
            &phi_values,
            returns,
            Some(&trajectory.response_padding_masks.logical_not()),
            Some(&trajectory.value_padding_masks.logical_not()),
        );

        let loss = out.loss / gas;
        loss.backward();
        if self.config.optimizer_in_bwd {
            self.optimizer_step();
        }

        let approx_policy_kls = approx_policy_kl(&pi_logprobs.detach(), &trajectory.logprobs);
        self.last_loss = loss.double_value(&[]);

        PpoStats {
            loss: loss.detach(),
            policy_loss: out.policy_loss / gas,
            value_loss: out.value_loss / gas,
            ratios: out.ratios / gas,
            clipfrac: out.clipfrac / gas,
            approx_policy_kls: approx_policy_kls / gas,
        }
    }

    fn optimizer_step(&mut self) {
        if let Some(max_norm) = self.config.optimizer.max_grad_norm {
            let norm = self.optimizer.clip_grad_norm(max_norm);
            tracing::trace!(grad_norm = norm, "Clipped gradients");
        }
        self.optimizer.step();
        self.optimizer.zero_grad();
    }

    fn log_metrics(
        &self,
        trajectory: &Trajectory,
        stats: &PpoStats,
        kl: &Tensor,
        kl_rewards: &Tensor,
        tokens_per_second_trajectory: f64,
        tokens_per_second_ppo: f64,
    ) {
        let row_sum_mean = |t: &Tensor| {
            t.sum_dim_intlist([1i64].as_slice(), false, Kind::Float)
                .mean(Kind::Float)
                .double_value(&[])
        };
        let scores = trajectory.scores.mean(Kind::Float).double_value(&[]);
        let kl_reward = row_sum_mean(kl_rewards);

        let mut metrics: BTreeMap<String, f64> = stats.means();
        metrics.insert("scores".to_string(), scores);
        metrics.insert(
            "num_stop_tokens".to_string(),
            trajectory
                .response_padding_masks
                .any_dim(-1, false)
                .sum(Kind::Float)
                .double_value(&[]),
        );
        metrics.insert("rlhf_reward".to_string(), scores + kl_reward);
        metrics.insert("kl".to_string(), row_sum_mean(kl));
        metrics.insert("kl_reward".to_string(), kl_reward);
        metrics.insert("lr".to_string(), self.optimizer.lr());
        metrics.insert(
            "response_lengths".to_string(),
            trajectory.seq_lens.to_kind(Kind::Float).mean(Kind::Float).double_value(&[]),
        );
        metrics.insert("tokens_per_second_trajectory".to_string(), tokens_per_second_trajectory);
        metrics.insert("tokens_per_second_ppo".to_string(), tokens_per_second_ppo);

        self.metric_logger.log_dict(&metrics, self.state.global_step);
    }

    /// Save policy and value weights for `epoch`.
    ///
    /// Intermediate policy checkpoints also carry the optimizer, the recipe
    /// state and the dataloader position.
    pub fn save_checkpoint(&mut self, epoch: u64, intermediate: bool) -> Result<()> {
        let mut policy_dict = CheckpointDict::new(named_parameters(self.models.policy.var_store()));
        if intermediate {
            let dataloader = self.dataloader.state_dict();
            policy_dict = policy_dict
                .with_recipe_state(self.state.to_checkpoint_value(Some(&dataloader))?)
                .with_optimizer(self.optimizer.state(self.config.optimizer_in_bwd));
        }
        self.policy_checkpointer
            .save_checkpoint(&policy_dict, epoch, intermediate)?;

        let value_dict = CheckpointDict::new(named_parameters(self.models.value.var_store()));
        self.value_checkpointer.save_checkpoint(&value_dict, epoch, false)?;
        Ok(())
    }

    /// Flush and close the metric logger.
    pub fn cleanup(&self) {
        self.metric_logger.close();
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }

    pub fn state(&self) -> &RecipeState {
        &self.state
    }

    pub fn models(&self) -> &PpoModels<P, C> {
        &self.models
    }

    pub fn policy(&self) -> &P {
        &self.models.policy
    }

    pub fn value(&self) -> &C {
        &self.models.value
    }

    pub fn stop_token_ids(&self) -> &[i64] {
        &self.generation.stop_token_ids
    }

    /// Optimizer steps taken, including those restored on resume.
    pub fn optimizer_step_count(&self) -> i64 {
        self.optimizer.step_count()
    }

    pub fn current_lr(&self) -> f64 {
        self.optimizer.lr()
    }

    pub fn global_step(&self) -> u64 {
        self.state.global_step
    }
}

/// Shaped rewards and advantages of one trajectory.
pub struct RewardEstimate {
    pub rewards: Tensor,
    pub kl: Tensor,
    pub kl_rewards: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}

/// KL-shaped rewards followed by GAE over a trajectory.
///
/// The score sits at `value_seq_idxs`, one past the last valid token for rows
/// that stopped early, so the value padding mask (not the response padding
/// mask) bounds both reward whitening and the advantage recursion.
pub fn estimate_trajectory_advantages(trajectory: &Trajectory, config: &PpoConfig) -> Result<RewardEstimate> {
    let (rewards, kl, kl_rewards) = compute_rewards(
        &trajectory.scores,
        &trajectory.logprobs,
        &trajectory.ref_logprobs,
        config.kl_coeff,
        Some(&trajectory.value_seq_idxs),
    );
    let value_valid = trajectory.value_padding_masks.logical_not();
    let rewards = if config.whiten_rewards {
        masked_whiten(&rewards, &value_valid, false)?
    } else {
        rewards
    };
    let (advantages, returns) = estimate_advantages(
        &trajectory.values,
        &rewards,
        config.gamma,
        config.lmbda,
        Some(&value_valid),
    )?;
    Ok(RewardEstimate {
        rewards,
        kl,
        kl_rewards,
        advantages,
        returns,
    })
}

/// Restore progress counters and the RNG from a recipe-state checkpoint.
///
/// Seed, total steps and total epochs that differ from the configured run
/// are overwritten with the checkpointed values after a warning. Returns the
/// saved dataloader position, if present.
pub fn update_recipe_state(state: &mut RecipeState, saved: &Value) -> Result<Option<DataLoaderState>> {
    let seed: u64 = read_state_key(saved, SEED_KEY)?;
    let total_steps: u64 = read_state_key(saved, TOTAL_STEPS_KEY)?;
    let total_epochs: u64 = read_state_key(saved, TOTAL_EPOCHS_KEY)?;
    let steps_run: u64 = read_state_key(saved, STEPS_KEY)?;
    let epochs_run: u64 = read_state_key(saved, EPOCHS_KEY)?;
    let rng = read_state_key(saved, RNG_KEY)?;

    if state.seed != seed || state.total_steps != total_steps || state.total_epochs != total_epochs {
        tracing::warn!(
            configured_seed = state.seed,
            checkpoint_seed = seed,
            configured_total_steps = state.total_steps,
            checkpoint_total_steps = total_steps,
            configured_total_epochs = state.total_epochs,
            checkpoint_total_epochs = total_epochs,
            "Configured seed, total_steps or total_epochs does not match the checkpoint; using checkpoint values"
        );
    }

    state.seed = set_seed(seed);
    state.rng = rng;
    state.steps_run = steps_run;
    state.total_steps = total_steps;
    state.total_epochs = total_epochs;
    state.epochs_run = epochs_run;

    tracing::info!(steps_run, epochs_run, "Recipe state restored");
    read_optional_state_key(saved, DATALOADER_KEY)
}
