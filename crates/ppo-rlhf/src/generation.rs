//! Batched autoregressive generation with temperature and top-k sampling.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Exp1;
use tch::{Kind, Tensor};

use crate::models::{CausalModel, KvCacheable};
use crate::rlhf::sequence::{
    get_causal_mask_from_padding_mask, get_position_ids_from_padding_mask,
};
use crate::{Result, RlhfError};

/// Sample one token per row from `logits` [b, V].
///
/// Uses the exponential race `argmax(probs / q)` with `q ~ Exp(1)` drawn from
/// `rng`, which is equivalent to sampling from `probs` and keeps the draw
/// sequence independent of the tensor backend.
///
/// # Returns
/// Token ids [b, 1]
pub fn sample(logits: &Tensor, temperature: f64, top_k: Option<i64>, rng: &mut ChaCha8Rng) -> Tensor {
    let size = logits.size();
    let (bsz, vocab) = (size[0], size[1]);

    let mut logits = logits.to_kind(Kind::Float) / temperature.max(1e-5);
    if let Some(k) = top_k {
        let k = k.clamp(1, vocab);
        let (top_values, _) = logits.topk(k, -1, true, true);
        let pivot = top_values.select(-1, k - 1).unsqueeze(-1);
        logits = logits.masked_fill(&logits.lt_tensor(&pivot), f64::NEG_INFINITY);
    }
    let probs = logits.softmax(-1, Kind::Float);

    let q: Vec<f32> = (0..bsz * vocab).map(|_| rng.sample::<f32, _>(Exp1)).collect();
    let q = Tensor::from_slice(&q)
        .reshape([bsz, vocab])
        .to_device(probs.device());

    (probs / q).argmax(-1, true)
}

/// Generate exactly `max_generated_tokens` tokens for every prompt row.
///
/// Prompts are left-padded with `pad_id`; padding is excluded from attention
/// and position ids. When the model has caches enabled only the newest token
/// is fed at every step.
///
/// # Returns
/// `(tokens [b, ctx + max_generated_tokens], logits [b, max_generated_tokens, V])`
/// where the logits are the raw (untempered) next-token outputs.
pub fn generate<M>(
    model: &M,
    prompt: &Tensor,
    max_generated_tokens: i64,
    temperature: f64,
    top_k: Option<i64>,
    pad_id: i64,
    rng: &mut ChaCha8Rng,
) -> Result<(Tensor, Tensor)>
where
    M: CausalModel + KvCacheable + ?Sized,
{
    let prompt = if prompt.dim() == 1 {
        prompt.view([1, -1])
    } else {
        prompt.shallow_clone()
    };
    let size = prompt.size();
    let (bsz, prompt_length) = (size[0], size[1]);
    if max_generated_tokens <= 0 {
        return Err(RlhfError::Config(
            "max_generated_tokens must be positive".to_string(),
        ));
    }
    let total_length = prompt_length + max_generated_tokens;

    let incremental = model.caches_are_enabled();
    let max_seq_len = match model.cache_max_seq_len() {
        Some(capacity) if incremental => {
            if capacity < total_length {
                return Err(RlhfError::Config(format!(
                    "KV-cache holds {} positions but generation needs {}",
                    capacity, total_length
                )));
            }
            capacity
        }
        _ => total_length,
    };

    let padding_masks = Tensor::cat(
        &[
            prompt.ne(pad_id),
            Tensor::ones([bsz, max_generated_tokens], (Kind::Bool, prompt.device())),
        ],
        1,
    );
    let masks = get_causal_mask_from_padding_mask(&padding_masks, Some(max_seq_len));
    let input_pos = get_position_ids_from_padding_mask(&padding_masks);

    let curr_masks = if incremental {
        masks.narrow(1, 0, prompt_length)
    } else {
        masks.narrow(1, 0, prompt_length).narrow(2, 0, prompt_length)
    };
    let logits = model.forward(&prompt, &input_pos.narrow(1, 0, prompt_length), &curr_masks);
    let last_logits = logits.select(1, prompt_length - 1);
    let mut tokens = sample(&last_logits, temperature, top_k, rng);

    let mut generated = vec![prompt.shallow_clone(), tokens.shallow_clone()];
    let mut generated_logits = vec![last_logits.unsqueeze(1)];

    for curr_pos in prompt_length..total_length - 1 {
        let logits = if incremental {
            model.forward(
                &tokens,
                &input_pos.narrow(1, curr_pos, 1),
                &masks.narrow(1, curr_pos, 1),
            )
        } else {
            let so_far = Tensor::cat(&generated, 1);
            model.forward(
                &so_far,
                &input_pos.narrow(1, 0, curr_pos + 1),
                &masks.narrow(1, 0, curr_pos + 1).narrow(2, 0, curr_pos + 1),
            )
        };
        let next_logits = logits.select(1, logits.size()[1] - 1);
        tokens = sample(&next_logits, temperature, top_k, rng);
        generated.push(tokens.shallow_clone());
        generated_logits.push(next_logits.unsqueeze(1));
    }

    Ok((Tensor::cat(&generated, 1), Tensor::cat(&generated_logits, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KvCacheGuard, OutputHead, TinyCausalLm, TinyLmConfig};
    use rand::SeedableRng;
    use tch::Device;

    #[test]
    fn test_top_k_one_is_greedy() {
        let logits = Tensor::from_slice(&[0.1f32, 2.0, 0.3, 1.0, 0.0, -1.0]).reshape([2, 3]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..10 {
            let tokens = sample(&logits, 1.0, Some(1), &mut rng);
            assert_eq!(Vec::<i64>::try_from(tokens.view([-1])).unwrap(), vec![1, 0]);
        }
    }

    #[test]
    fn test_top_k_restricts_support() {
        let logits = Tensor::from_slice(&[5.0f32, 4.9, -10.0, -10.0]).reshape([1, 4]);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..50 {
            let token = sample(&logits, 1.0, Some(2), &mut rng).int64_value(&[0, 0]);
            assert!(token == 0 || token == 1);
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let logits = Tensor::zeros([4, 16], (Kind::Float, Device::Cpu));
        let a = sample(&logits, 1.0, None, &mut ChaCha8Rng::seed_from_u64(3));
        let b = sample(&logits, 1.0, None, &mut ChaCha8Rng::seed_from_u64(3));
        assert!(a.equal(&b));
    }

    #[test]
    fn test_generate_shapes() {
        let config = TinyLmConfig::default();
        let model = TinyCausalLm::new(config.clone(), OutputHead::Vocab, Device::Cpu);
        let prompt = Tensor::from_slice(&[0i64, 5, 6, 7, 8, 9]).reshape([2, 3]);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let _guard = tch::no_grad_guard();
        let (tokens, logits) = generate(&model, &prompt, 4, 0.7, None, 0, &mut rng).unwrap();

        assert_eq!(tokens.size(), vec![2, 7]);
        assert_eq!(logits.size(), vec![2, 4, config.vocab_size]);
        assert!(tokens.narrow(1, 0, 3).equal(&prompt));
    }

    #[test]
    fn test_cached_generation_matches_uncached() {
        let mut model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Vocab, Device::Cpu);
        let prompt = Tensor::from_slice(&[0i64, 5, 6, 7, 8, 9]).reshape([2, 3]);
        let _no_grad = tch::no_grad_guard();

        let (plain_tokens, plain_logits) = generate(
            &model,
            &prompt,
            5,
            1.0,
            Some(8),
            0,
            &mut ChaCha8Rng::seed_from_u64(11),
        )
        .unwrap();

        let guard = KvCacheGuard::new(&mut model, 2, 8);
        let (cached_tokens, cached_logits) = generate(
            &*guard,
            &prompt,
            5,
            1.0,
            Some(8),
            0,
            &mut ChaCha8Rng::seed_from_u64(11),
        )
        .unwrap();
        drop(guard);

        assert!(plain_tokens.equal(&cached_tokens));
        assert!(plain_logits.allclose(&cached_logits, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_generate_rejects_small_cache() {
        let mut model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Vocab, Device::Cpu);
        let prompt = Tensor::from_slice(&[5i64, 6, 7]).reshape([1, 3]);
        let guard = KvCacheGuard::new(&mut model, 1, 4);
        let result = generate(&*guard, &prompt, 4, 1.0, None, 0, &mut ChaCha8Rng::seed_from_u64(0));
        assert!(matches!(result, Err(RlhfError::Config(_))));
    }
}
