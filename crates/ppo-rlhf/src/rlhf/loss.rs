//! Clipped PPO objective for the policy and value models.

use tch::{Kind, Tensor};

use super::rewards::masked_mean;

/// Outputs of a PPO loss evaluation.
///
/// `loss` carries the autograd graph; the remaining fields are detached.
pub struct PpoLossOutput {
    pub loss: Tensor,
    pub policy_loss: Tensor,
    pub value_loss: Tensor,
    pub ratios: Tensor,
    pub clipfrac: Tensor,
}

/// Loss collaborator used by the PPO optimizer step.
pub trait PpoLossFn {
    /// Evaluate the loss on one microbatch.
    ///
    /// `padding_masks` and `value_padding_masks` are `true` at valid positions.
    #[allow(clippy::too_many_arguments)]
    fn compute(
        &self,
        pi_old_logprobs: &Tensor,
        pi_logprobs: &Tensor,
        advantages: &Tensor,
        phi_old_values: &Tensor,
        phi_values: &Tensor,
        returns: &Tensor,
        padding_masks: Option<&Tensor>,
        value_padding_masks: Option<&Tensor>,
    ) -> PpoLossOutput;
}

/// Proximal Policy Optimization loss with a clipped value objective.
#[derive(Clone, Debug)]
pub struct PpoLoss {
    /// Policy ratio clipping range
    pub epsilon: f64,
    /// Value clipping range around the old value estimates
    pub value_clip_range: f64,
    /// Weight of the value loss in the total loss
    pub value_coeff: f64,
}

impl Default for PpoLoss {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            value_clip_range: 0.2,
            value_coeff: 0.1,
        }
    }
}

impl PpoLoss {
    pub fn new(epsilon: f64, value_clip_range: f64, value_coeff: f64) -> Self {
        Self {
            epsilon,
            value_clip_range,
            value_coeff,
        }
    }
}

fn reduce(x: &Tensor, mask: Option<&Tensor>) -> Tensor {
    match mask {
        Some(m) => masked_mean(x, m, None),
        None => x.mean(Kind::Float),
    }
}

impl PpoLossFn for PpoLoss {
    fn compute(
        &self,
        pi_old_logprobs: &Tensor,
        pi_logprobs: &Tensor,
        advantages: &Tensor,
        phi_old_values: &Tensor,
        phi_values: &Tensor,
        returns: &Tensor,
        padding_masks: Option<&Tensor>,
        value_padding_masks: Option<&Tensor>,
    ) -> PpoLossOutput {
        let ratios = (pi_logprobs - pi_old_logprobs).exp();
        let clipped_ratios = ratios.clamp(1.0 - self.epsilon, 1.0 + self.epsilon);

        let policy_losses_clipped = -advantages * &clipped_ratios;
        let policy_losses_unclipped = -advantages * &ratios;

        let clipfrac = policy_losses_clipped
            .gt_tensor(&policy_losses_unclipped)
            .to_kind(Kind::Float);
        let clipfrac = reduce(&clipfrac, padding_masks);

        let policy_loss = reduce(
            &policy_losses_clipped.maximum(&policy_losses_unclipped),
            padding_masks,
        );

        let values_clipped = phi_values.clamp_tensor(
            Some(phi_old_values - self.value_clip_range),
            Some(phi_old_values + self.value_clip_range),
        );
        let value_losses = (phi_values - returns).square();
        let value_losses_clipped = (&values_clipped - returns).square();
        let value_loss: Tensor = 0.5
            * reduce(
                &value_losses.maximum(&value_losses_clipped),
                value_padding_masks,
            );

        let loss = &policy_loss + self.value_coeff * &value_loss;

        PpoLossOutput {
            loss,
            policy_loss: policy_loss.detach(),
            value_loss: value_loss.detach(),
            ratios: ratios.mean(Kind::Float).detach(),
            clipfrac: clipfrac.detach(),
        }
    }
}

/// Approximate KL between the current and the rollout policy,
/// `0.5 * mean((new - old)^2)`.
pub fn approx_policy_kl(pi_logprobs: &Tensor, pi_old_logprobs: &Tensor) -> Tensor {
    0.5 * (pi_logprobs - pi_old_logprobs).square().mean(Kind::Float)
}
