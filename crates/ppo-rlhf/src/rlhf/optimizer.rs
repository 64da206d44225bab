//! Optimizer interface, AdamW and learning-rate schedules.
//!
//! AdamW keeps its moment estimates as plain tensors so the full optimizer
//! state can be written into intermediate checkpoints and restored exactly.

use std::f64::consts::PI;

use tch::{nn, Kind, Tensor};

use super::config::OptimizerConfig;
use crate::checkpoint::OptimizerState;
use crate::{Result, RlhfError};

/// Optimizer used by the PPO recipe.
pub trait RecipeOptimizer {
    /// Zero out gradients.
    fn zero_grad(&mut self);

    /// Perform an optimization step.
    fn step(&mut self);

    /// Current learning rate.
    fn lr(&self) -> f64;

    fn set_lr(&mut self, lr: f64);

    /// Number of steps taken so far.
    fn step_count(&self) -> i64;

    /// Rescale gradients so their global norm is at most `max_norm`.
    ///
    /// Returns the norm before clipping.
    fn clip_grad_norm(&mut self, max_norm: f64) -> f64;

    /// Snapshot the optimizer state for checkpointing.
    fn state(&self, in_backward: bool) -> OptimizerState;

    /// Restore a snapshot taken with [`RecipeOptimizer::state`].
    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Adam with decoupled weight decay.
pub struct AdamW {
    variables: Vec<(String, Tensor)>,
    exp_avg: Vec<Tensor>,
    exp_avg_sq: Vec<Tensor>,
    step: i64,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
}

impl AdamW {
    /// Create an optimizer over the named variables that require gradients.
    pub fn new(variables: Vec<(String, Tensor)>, config: &OptimizerConfig) -> Self {
        let variables: Vec<(String, Tensor)> = variables
            .into_iter()
            .filter(|(_, v)| v.requires_grad())
            .collect();
        let exp_avg = variables.iter().map(|(_, v)| v.zeros_like()).collect();
        let exp_avg_sq = variables.iter().map(|(_, v)| v.zeros_like()).collect();

        Self {
            variables,
            exp_avg,
            exp_avg_sq,
            step: 0,
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        }
    }

    /// Optimize the trainable variables of several stores.
    ///
    /// Variable names are prefixed with the given group name so that stores
    /// sharing layer names stay distinguishable in checkpoints.
    pub fn from_var_stores(stores: &[(&str, &nn::VarStore)], config: &OptimizerConfig) -> Self {
        let mut variables = Vec::new();
        for (prefix, vs) in stores {
            let mut named: Vec<(String, Tensor)> = vs
                .variables()
                .into_iter()
                .map(|(name, var)| (format!("{}.{}", prefix, name), var))
                .collect();
            named.sort_by(|a, b| a.0.cmp(&b.0));
            variables.extend(named);
        }
        Self::new(variables, config)
    }

    pub fn num_variables(&self) -> usize {
        self.variables.len()
    }
}

impl RecipeOptimizer for AdamW {
    fn zero_grad(&mut self) {
        for (_, var) in &self.variables {
            let mut var = var.shallow_clone();
            var.zero_grad();
        }
    }

    fn step(&mut self) {
        let _guard = tch::no_grad_guard();
        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);

        for (i, (_, var)) in self.variables.iter().enumerate() {
            let grad = var.grad();
            if !grad.defined() {
                continue;
            }

            let exp_avg = &self.exp_avg[i] * self.beta1 + &grad * (1.0 - self.beta1);
            let exp_avg_sq = &self.exp_avg_sq[i] * self.beta2 + grad.square() * (1.0 - self.beta2);

            let denom = (&exp_avg_sq / bias_correction2).sqrt() + self.eps;
            let update = (&exp_avg / bias_correction1) / denom * self.lr;

            let mut var = var.shallow_clone();
            if self.weight_decay > 0.0 {
                let _ = var.f_mul_scalar_(1.0 - self.lr * self.weight_decay);
            }
            let _ = var.f_sub_(&update);

            self.exp_avg[i] = exp_avg;
            self.exp_avg_sq[i] = exp_avg_sq;
        }
    }

    fn lr(&self) -> f64 {
        self.lr
    }

    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step_count(&self) -> i64 {
        self.step
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let mut global_norm = 0.0f64;
        for (_, var) in &self.variables {
            let grad = var.grad();
            if grad.defined() {
                global_norm += grad
                    .pow_tensor_scalar(2.0)
                    .sum(Kind::Float)
                    .double_value(&[]);
            }
        }
        global_norm = global_norm.sqrt();

        if global_norm > max_norm {
            let clip_coef = max_norm / (global_norm + 1e-6);
            for (_, var) in &self.variables {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.f_mul_scalar_(clip_coef);
                }
            }
        }
        global_norm
    }

    fn state(&self, in_backward: bool) -> OptimizerState {
        let mut tensors = Vec::with_capacity(self.variables.len() * 2);
        for (i, (name, _)) in self.variables.iter().enumerate() {
            tensors.push((format!("exp_avg.{}", name), self.exp_avg[i].copy()));
            tensors.push((format!("exp_avg_sq.{}", name), self.exp_avg_sq[i].copy()));
        }
        OptimizerState {
            in_backward,
            step: self.step,
            lr: self.lr,
            tensors,
        }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        let lookup = |key: String| -> Result<Tensor> {
            state
                .tensors
                .iter()
                .find(|(n, _)| *n == key)
                .map(|(_, t)| t.shallow_clone())
                .ok_or_else(|| RlhfError::Checkpoint(format!("optimizer state is missing '{}'", key)))
        };

        let mut exp_avg = Vec::with_capacity(self.variables.len());
        let mut exp_avg_sq = Vec::with_capacity(self.variables.len());
        for (name, var) in &self.variables {
            let m = lookup(format!("exp_avg.{}", name))?;
            let v = lookup(format!("exp_avg_sq.{}", name))?;
            if m.size() != var.size() || v.size() != var.size() {
                return Err(RlhfError::Checkpoint(format!(
                    "optimizer state for '{}' has the wrong shape",
                    name
                )));
            }
            exp_avg.push(m.to_device(var.device()));
            exp_avg_sq.push(v.to_device(var.device()));
        }

        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        self.step = state.step;
        self.lr = state.lr;
        Ok(())
    }
}

/// Multiplier of the cosine schedule with linear warmup at `step`.
///
/// Rises linearly from 0 to 1 over `num_warmup_steps`, then follows
/// `num_cycles` cosine waves down to 0 at `num_training_steps`.
pub fn cosine_with_warmup_multiplier(
    step: usize,
    num_warmup_steps: usize,
    num_training_steps: usize,
    num_cycles: f64,
) -> f64 {
    if step < num_warmup_steps {
        return step as f64 / num_warmup_steps.max(1) as f64;
    }
    let decay_steps = num_training_steps.saturating_sub(num_warmup_steps).max(1);
    let progress = (step - num_warmup_steps) as f64 / decay_steps as f64;
    let cosine = 0.5 * (1.0 + (PI * num_cycles * 2.0 * progress).cos());
    cosine.max(0.0)
}

/// Cosine learning-rate schedule with warmup, applied to a [`RecipeOptimizer`].
#[derive(Clone, Debug)]
pub struct CosineWithWarmup {
    base_lr: f64,
    num_warmup_steps: usize,
    num_training_steps: usize,
    num_cycles: f64,
    current_step: usize,
}

impl CosineWithWarmup {
    /// Create the schedule positioned at `start_step` and apply its rate.
    pub fn new(
        optimizer: &mut dyn RecipeOptimizer,
        base_lr: f64,
        num_warmup_steps: usize,
        num_training_steps: usize,
        num_cycles: f64,
        start_step: usize,
    ) -> Self {
        let schedule = Self {
            base_lr,
            num_warmup_steps,
            num_training_steps,
            num_cycles,
            current_step: start_step,
        };
        optimizer.set_lr(schedule.current_lr());
        schedule
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr
            * cosine_with_warmup_multiplier(
                self.current_step,
                self.num_warmup_steps,
                self.num_training_steps,
                self.num_cycles,
            )
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Advance one optimizer step.
    pub fn step(&mut self, optimizer: &mut dyn RecipeOptimizer) {
        self.current_step += 1;
        optimizer.set_lr(self.current_lr());
    }
}
