//! KL-shaped rewards, masked statistics and Generalized Advantage Estimation.

use tch::{Kind, Tensor};

use crate::{Result, RlhfError};

/// Shape per-token rewards with a KL penalty against the reference policy.
///
/// # Arguments
/// * `scores` - Scalar reward model scores [b]
/// * `logprobs` - Policy log-probabilities of the generated tokens [b, T]
/// * `ref_logprobs` - Reference policy log-probabilities [b, T]
/// * `kl_coeff` - KL penalty coefficient
/// * `value_seq_idxs` - Position receiving the score per row [b]; the last
///   position when `None`
///
/// # Returns
/// `(rewards, kl, kl_rewards)`, each [b, T]
pub fn compute_rewards(
    scores: &Tensor,
    logprobs: &Tensor,
    ref_logprobs: &Tensor,
    kl_coeff: f64,
    value_seq_idxs: Option<&Tensor>,
) -> (Tensor, Tensor, Tensor) {
    let kl = logprobs - ref_logprobs;
    let kl_rewards = &kl * (-kl_coeff);

    let size = kl_rewards.size();
    let (bsz, response_length) = (size[0], size[1]);
    let idxs = match value_seq_idxs {
        Some(idxs) => idxs.unsqueeze(-1),
        None => Tensor::full(
            [bsz, 1],
            response_length - 1,
            (Kind::Int64, kl_rewards.device()),
        ),
    };

    let rewards = kl_rewards.scatter_add(
        1,
        &idxs,
        &scores.unsqueeze(-1).to_kind(kl_rewards.kind()),
    );
    (rewards, kl, kl_rewards)
}

/// Mean of `x` over positions where `mask` is true, globally or along `dim`.
pub fn masked_mean(x: &Tensor, mask: &Tensor, dim: Option<i64>) -> Tensor {
    let kind = x.kind();
    let mask = mask.to_kind(kind);
    match dim {
        Some(d) => {
            (x * &mask).sum_dim_intlist([d].as_slice(), false, kind)
                / (mask.sum_dim_intlist([d].as_slice(), false, kind) + 1e-8)
        }
        None => (x * &mask).sum(kind) / (mask.sum(kind) + 1e-8),
    }
}

/// Variance of `x` over positions where `mask` is true.
///
/// With `unbiased` the Bessel correction is applied, which needs at least two
/// unmasked elements.
pub fn masked_var(x: &Tensor, mask: &Tensor, unbiased: bool) -> Result<Tensor> {
    let mean = masked_mean(x, mask, None);
    let centered = x - &mean;
    let var = masked_mean(&centered.square(), mask, None);

    let count = mask.to_kind(Kind::Float).sum(Kind::Float).double_value(&[]);
    if count == 0.0 {
        return Err(RlhfError::Data(
            "masked variance over an empty mask".to_string(),
        ));
    }
    if !unbiased {
        return Ok(var);
    }
    if count == 1.0 {
        return Err(RlhfError::Data(
            "unbiased masked variance needs at least two elements".to_string(),
        ));
    }
    Ok(var * (count / (count - 1.0)))
}

/// Normalise `x` to unit variance, optionally shifting it to zero mean.
pub fn whiten(x: &Tensor, shift_mean: bool) -> Tensor {
    let mean = x.mean(Kind::Float);
    let var = x.var(true);
    let whitened = (x - &mean) * (var + 1e-8).rsqrt();
    if shift_mean {
        whitened
    } else {
        whitened + mean
    }
}

/// [`whiten`] using statistics over the unmasked positions only.
pub fn masked_whiten(x: &Tensor, mask: &Tensor, shift_mean: bool) -> Result<Tensor> {
    let mean = masked_mean(x, mask, None);
    let var = masked_var(x, mask, true)?;
    let whitened = (x - &mean) * (var + 1e-8).rsqrt();
    Ok(if shift_mean { whitened } else { whitened + mean })
}

/// Generalized Advantage Estimation over the generated span.
///
/// Runs the backward recursion `delta_t = r_t + gamma * V_{t+1} - V_t` with
/// `V_T = 0`. When `masks` (true = valid) are given the running advantage is
/// zeroed at invalid positions, so nothing flows back across the end of a
/// response, and whitening uses only the valid positions.
///
/// # Returns
/// `(advantages, returns)` with `returns = advantages + values` computed
/// before whitening
pub fn estimate_advantages(
    values: &Tensor,
    rewards: &Tensor,
    gamma: f64,
    lmbda: f64,
    masks: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let device = values.device();
    let size = values.size();
    let (bsz, response_length) = (size[0], size[1]);
    let masks_f = masks.map(|m| m.to_kind(Kind::Float));

    let mut last_gae = Tensor::zeros([bsz], (Kind::Float, device));
    let mut reversed = Vec::with_capacity(response_length as usize);

    for t in (0..response_length).rev() {
        let next_values = if t == response_length - 1 {
            Tensor::zeros([bsz], (Kind::Float, device))
        } else {
            values.select(1, t + 1)
        };

        let delta = rewards.select(1, t) + gamma * &next_values - values.select(1, t);
        last_gae = &delta + gamma * lmbda * &last_gae;
        if let Some(m) = &masks_f {
            last_gae = last_gae * m.select(1, t);
        }
        reversed.push(last_gae.shallow_clone());
    }
    reversed.reverse();

    let advantages = Tensor::stack(&reversed, 1);
    let returns = &advantages + values;
    let advantages = match masks {
        Some(m) => masked_whiten(&advantages, m, true)?,
        None => whiten(&advantages, true),
    };

    Ok((advantages, returns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn floats(values: &[f32], rows: i64) -> Tensor {
        Tensor::from_slice(values).reshape([rows, -1])
    }

    #[test]
    fn test_compute_rewards_adds_score_at_index() {
        let scores = Tensor::from_slice(&[2.0f32, -1.0]);
        let logprobs = floats(&[-1.0, -1.0, -1.0, -2.0, -2.0, -2.0], 2);
        let ref_logprobs = floats(&[-1.5, -1.0, -1.0, -2.0, -2.0, -2.0], 2);
        let idxs = Tensor::from_slice(&[1i64, 2]);

        let (rewards, kl, kl_rewards) =
            compute_rewards(&scores, &logprobs, &ref_logprobs, 0.1, Some(&idxs));

        assert!((kl.double_value(&[0, 0]) - 0.5).abs() < 1e-6);
        assert!((kl_rewards.double_value(&[0, 0]) + 0.05).abs() < 1e-6);
        assert!((rewards.double_value(&[0, 1]) - 2.0).abs() < 1e-6);
        assert!((rewards.double_value(&[1, 2]) + 1.0).abs() < 1e-6);
        assert!(rewards.double_value(&[1, 0]).abs() < 1e-6);
    }

    #[test]
    fn test_compute_rewards_defaults_to_last_position() {
        let scores = Tensor::from_slice(&[3.0f32]);
        let lp = floats(&[0.0, 0.0, 0.0], 1);
        let (rewards, _, _) = compute_rewards(&scores, &lp, &lp, 0.1, None);
        assert!((rewards.double_value(&[0, 2]) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_masked_mean() {
        let x = floats(&[1.0, 2.0, 3.0, 100.0], 1);
        let mask = floats(&[1.0, 1.0, 1.0, 0.0], 1).to_kind(Kind::Bool);
        assert!((masked_mean(&x, &mask, None).double_value(&[]) - 2.0).abs() < 1e-5);

        let per_row = masked_mean(&x, &mask, Some(1));
        assert_eq!(per_row.size(), vec![1]);
    }

    #[test]
    fn test_masked_var_requires_elements() {
        let x = floats(&[1.0, 2.0], 1);
        let empty = Tensor::zeros([1, 2], (Kind::Bool, Device::Cpu));
        assert!(masked_var(&x, &empty, false).is_err());

        let single = floats(&[1.0, 0.0], 1).to_kind(Kind::Bool);
        assert!(masked_var(&x, &single, true).is_err());
        assert!(masked_var(&x, &single, false).is_ok());
    }

    #[test]
    fn test_whiten_zero_mean_unit_variance() {
        let x = floats(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2);
        let w = whiten(&x, true);
        assert!(w.mean(Kind::Float).double_value(&[]).abs() < 1e-5);
        assert!((w.var(true).double_value(&[]) - 1.0).abs() < 1e-3);

        let kept = whiten(&x, false);
        assert!((kept.mean(Kind::Float).double_value(&[]) - 3.5).abs() < 1e-5);
    }

    #[test]
    fn test_gae_single_step() {
        // One step: A = r - V, so returns = r.
        let values = floats(&[0.5], 1);
        let rewards = floats(&[1.0], 1);
        let (_, returns) = estimate_advantages(&values, &rewards, 0.99, 0.95, None).unwrap();
        assert!((returns.double_value(&[0, 0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_gae_stops_after_score_position() {
        // Row 0 stopped early: the score sits at index 2, the last valid
        // position, and the reward at index 3 is padding.
        let values = floats(&[0.1, 0.2, 0.3, 0.0, 0.4, 0.3, 0.2, 0.1], 2);
        let rewards = floats(&[0.0, 0.0, 5.0, 50.0, 0.0, 0.0, 0.0, 1.0], 2);
        let masks = floats(&[1.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0, 1.0], 2).to_kind(Kind::Bool);

        let (_, returns) = estimate_advantages(&values, &rewards, 1.0, 1.0, Some(&masks)).unwrap();

        let row0 = Vec::<f32>::try_from(returns.get(0)).unwrap();
        let expected = [5.0f32, 5.0, 5.0, 0.0];
        for (got, want) in row0.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }

        // Row 1 is fully valid: plain undiscounted return-to-go.
        assert!((returns.double_value(&[1, 0]) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_gae_whitened_advantages() {
        let values = floats(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 2);
        let rewards = floats(&[1.0, 0.0, 2.0, 0.0, 1.0, 3.0], 2);
        let masks = Tensor::ones([2, 3], (Kind::Bool, Device::Cpu));

        let (advantages, returns) =
            estimate_advantages(&values, &rewards, 0.9, 0.8, Some(&masks)).unwrap();
        assert_eq!(advantages.size(), vec![2, 3]);
        assert_eq!(returns.size(), vec![2, 3]);
        assert!(advantages.mean(Kind::Float).double_value(&[]).abs() < 1e-5);
    }
}
