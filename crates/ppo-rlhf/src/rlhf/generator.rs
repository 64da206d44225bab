//! Trajectory generation: roll out the policy and score it with the frozen models.

use rand_chacha::ChaCha8Rng;
use tch::Tensor;

use super::config::PpoConfig;
use super::sequence::{
    get_causal_mask_from_padding_mask, get_position_ids_from_padding_mask,
    get_reward_penalty_mask, get_unmasked_sequence_lengths, get_value_padding_masks,
    logits_to_logprobs, truncate_sequence_at_first_stop_token, truncate_sequence_for_logprobs,
};
use super::trajectory::Trajectory;
use crate::generation::generate;
use crate::models::{CausalModel, KvCacheGuard, KvCacheable};
use crate::{Result, RlhfError};

/// Generation and reward-shaping settings of a trajectory rollout.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationSettings {
    pub max_generated_tokens: i64,
    pub temperature: f64,
    pub top_k: Option<i64>,
    pub pad_id: i64,
    pub stop_token_ids: Vec<i64>,
    pub enable_kv_cache: bool,
    /// Rows per no-grad rollout chunk
    pub forward_batch_size: i64,
    pub penalise_no_eos: bool,
    pub min_response_length: Option<usize>,
    pub reward_penalty: f64,
}

impl GenerationSettings {
    pub fn from_config(config: &PpoConfig, pad_id: i64, stop_token_ids: Vec<i64>) -> Self {
        Self {
            max_generated_tokens: config.max_generated_tokens as i64,
            temperature: config.temperature,
            top_k: config.top_k,
            pad_id,
            stop_token_ids,
            enable_kv_cache: config.enable_kv_cache,
            forward_batch_size: config.forward_batch_size as i64,
            penalise_no_eos: config.penalise_no_eos,
            min_response_length: config.min_response_length,
            reward_penalty: config.reward_penalty,
        }
    }

    fn applies_penalty(&self) -> bool {
        self.penalise_no_eos || self.min_response_length.is_some()
    }
}

/// Builds trajectories from a policy, a reference policy, a value model and a
/// reward model.
///
/// The policy is borrowed mutably so its KV-cache can be set up for the
/// duration of each rollout.
pub struct TrajectoryGenerator<'m, P: ?Sized, C: ?Sized> {
    policy: &'m mut P,
    ref_policy: &'m P,
    value: &'m C,
    reward: &'m C,
    settings: &'m GenerationSettings,
}

impl<'m, P, C> TrajectoryGenerator<'m, P, C>
where
    P: CausalModel + KvCacheable + ?Sized,
    C: CausalModel + ?Sized,
{
    pub fn new(
        policy: &'m mut P,
        ref_policy: &'m P,
        value: &'m C,
        reward: &'m C,
        settings: &'m GenerationSettings,
    ) -> Self {
        Self {
            policy,
            ref_policy,
            value,
            reward,
            settings,
        }
    }

    /// Roll out one chunk of prompts `[b, ctx]`.
    pub fn generate_trajectory(&mut self, input_ids: &Tensor, rng: &mut ChaCha8Rng) -> Result<Trajectory> {
        let s = self.settings;
        let size = input_ids.size();
        let (bsz, context_length) = (size[0], size[1]);

        // 1. sample responses from the policy
        let (query_responses, logits) = if s.enable_kv_cache {
            let guard = KvCacheGuard::new(&mut *self.policy, bsz, context_length + s.max_generated_tokens);
            generate(
                &*guard,
                input_ids,
                s.max_generated_tokens,
                s.temperature,
                s.top_k,
                s.pad_id,
                rng,
            )?
        } else {
            generate(
                &*self.policy,
                input_ids,
                s.max_generated_tokens,
                s.temperature,
                s.top_k,
                s.pad_id,
                rng,
            )?
        };
        let responses = query_responses.narrow(1, context_length, s.max_generated_tokens);

        let padding = query_responses.ne(s.pad_id);
        let masks = get_causal_mask_from_padding_mask(&padding, None);
        let position_ids = get_position_ids_from_padding_mask(&padding);

        // 2. policy and reference log-probs of the sampled tokens
        let logprobs = logits_to_logprobs(&logits, &responses, s.temperature);
        let ref_logits = self.ref_policy.forward(&query_responses, &position_ids, &masks);
        let ref_logits = truncate_sequence_for_logprobs(&ref_logits, context_length);
        let ref_logprobs = logits_to_logprobs(&ref_logits, &responses, s.temperature);

        // 3. value estimates
        let values = self.value.forward(&query_responses, &position_ids, &masks);
        let values = truncate_sequence_for_logprobs(&values, context_length).squeeze_dim(-1);

        // 4. drop everything after the first stop token
        let (response_padding_masks, responses) =
            truncate_sequence_at_first_stop_token(&responses, &s.stop_token_ids, s.pad_id);

        // 5. score (prompt, truncated response) at the last valid token
        let reward_outputs = self.reward.forward(
            &Tensor::cat(&[input_ids, &responses], 1),
            &position_ids,
            &masks,
        );
        let seq_lens = get_unmasked_sequence_lengths(&response_padding_masks);
        let score_idxs = (&seq_lens + context_length).view([bsz, 1, 1]);
        let mut scores = reward_outputs.gather(1, &score_idxs, false).view([bsz]);

        if s.applies_penalty() {
            let penalty_mask = get_reward_penalty_mask(
                &response_padding_masks,
                &seq_lens,
                s.penalise_no_eos,
                s.min_response_length,
            );
            scores = scores.masked_fill(&penalty_mask, s.reward_penalty);
        }

        // 6. sentinel-mask invalid positions
        let logprobs = logprobs.masked_fill(&response_padding_masks, 1.0);
        let ref_logprobs = ref_logprobs.masked_fill(&response_padding_masks, 1.0);
        let (value_padding_masks, value_seq_idxs) =
            get_value_padding_masks(&response_padding_masks, &seq_lens, s.max_generated_tokens);
        let values = values.masked_fill(&value_padding_masks, 0.0);

        Ok(Trajectory {
            query_responses,
            logprobs,
            ref_logprobs,
            values,
            masks,
            position_ids,
            response_padding_masks,
            value_padding_masks,
            value_seq_idxs,
            scores,
            seq_lens,
        })
    }

    /// Roll out a full batch in `forward_batch_size` chunks without gradients.
    pub fn generate_trajectory_batched(&mut self, input_ids: &Tensor, rng: &mut ChaCha8Rng) -> Result<Trajectory> {
        let _guard = tch::no_grad_guard();
        let batch_size = input_ids.size()[0];
        let chunk = self.settings.forward_batch_size.max(1);

        let mut trajectories = Vec::new();
        let mut start = 0;
        while start < batch_size {
            let len = chunk.min(batch_size - start);
            trajectories.push(self.generate_trajectory(&input_ids.narrow(0, start, len), rng)?);
            start += len;
        }

        Trajectory::cat(&trajectories)
            .ok_or_else(|| RlhfError::Data("cannot generate a trajectory for an empty batch".to_string()))
    }
}
