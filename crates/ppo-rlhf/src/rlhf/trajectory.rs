//! Trajectory bundle and per-minibatch PPO statistics.

use std::collections::BTreeMap;

use tch::{Device, Kind, Tensor};

/// One batch of generated experience, one row per sequence.
///
/// Shapes use `b` for rows, `T` for `max_generated_tokens` and `s` for
/// `context_length + T`.
#[derive(Debug)]
pub struct Trajectory {
    /// Prompt followed by the generated response [b, s]
    pub query_responses: Tensor,
    /// Policy log-probs of the generated tokens, 1.0 at invalid positions [b, T]
    pub logprobs: Tensor,
    /// Reference policy log-probs, 1.0 at invalid positions [b, T]
    pub ref_logprobs: Tensor,
    /// Value estimates, 0.0 at value padding [b, T]
    pub values: Tensor,
    /// Causal attention masks [b, s, s]
    pub masks: Tensor,
    /// Position ids [b, s]
    pub position_ids: Tensor,
    /// True after the first stop token [b, T]
    pub response_padding_masks: Tensor,
    /// Response padding with the value cutoff shifted one position later [b, T]
    pub value_padding_masks: Tensor,
    /// Index of the value position receiving the score [b]
    pub value_seq_idxs: Tensor,
    /// Reward model scores after penalties [b]
    pub scores: Tensor,
    /// Index of the last valid generated token [b]
    pub seq_lens: Tensor,
}

impl Trajectory {
    fn fields(&self) -> [&Tensor; 11] {
        [
            &self.query_responses,
            &self.logprobs,
            &self.ref_logprobs,
            &self.values,
            &self.masks,
            &self.position_ids,
            &self.response_padding_masks,
            &self.value_padding_masks,
            &self.value_seq_idxs,
            &self.scores,
            &self.seq_lens,
        ]
    }

    fn from_fields(mut fields: impl Iterator<Item = Tensor>) -> Option<Self> {
        Some(Self {
            query_responses: fields.next()?,
            logprobs: fields.next()?,
            ref_logprobs: fields.next()?,
            values: fields.next()?,
            masks: fields.next()?,
            position_ids: fields.next()?,
            response_padding_masks: fields.next()?,
            value_padding_masks: fields.next()?,
            value_seq_idxs: fields.next()?,
            scores: fields.next()?,
            seq_lens: fields.next()?,
        })
    }

    /// Concatenate trajectories row-wise. Returns `None` for an empty slice.
    pub fn cat(trajectories: &[Trajectory]) -> Option<Trajectory> {
        if trajectories.is_empty() {
            return None;
        }
        let per_field: Vec<Vec<&Tensor>> = (0..11)
            .map(|i| trajectories.iter().map(|t| t.fields()[i]).collect())
            .collect();
        Self::from_fields(per_field.iter().map(|parts| Tensor::cat(parts, 0)))
    }

    /// Select rows by index in every field.
    pub fn index_select(&self, index: &Tensor) -> Trajectory {
        let [
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
        ] = self.fields().map(|t| t.index_select(0, index));
        Self {
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
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.query_responses.size()[0]
    }
}

/// Statistics from PPO optimizer steps, each a 0-dim tensor
/// (or a 1-dim tensor once stacked across minibatches).
#[derive(Debug)]
pub struct PpoStats {
    pub loss: Tensor,
    pub policy_loss: Tensor,
    pub value_loss: Tensor,
    pub ratios: Tensor,
    pub clipfrac: Tensor,
    pub approx_policy_kls: Tensor,
}

impl PpoStats {
    pub const NAMES: [&'static str; 6] = [
        "loss",
        "policy_loss",
        "value_loss",
        "ratios",
        "clipfrac",
        "approx_policy_kl",
    ];

    pub fn zeros(device: Device) -> Self {
        let z = || Tensor::zeros([0i64; 0], (Kind::Float, device));
        Self {
            loss: z(),
            policy_loss: z(),
            value_loss: z(),
            ratios: z(),
            clipfrac: z(),
            approx_policy_kls: z(),
        }
    }

    fn fields(&self) -> [&Tensor; 6] {
        [
            &self.loss,
            &self.policy_loss,
            &self.value_loss,
            &self.ratios,
            &self.clipfrac,
            &self.approx_policy_kls,
        ]
    }

    fn from_array(fields: [Tensor; 6]) -> Self {
        let [loss, policy_loss, value_loss, ratios, clipfrac, approx_policy_kls] = fields;
        Self {
            loss,
            policy_loss,
            value_loss,
            ratios,
            clipfrac,
            approx_policy_kls,
        }
    }

    /// Element-wise sum across microbatches.
    pub fn sum(stats: &[PpoStats]) -> PpoStats {
        let Some(first) = stats.first() else {
            return Self::zeros(Device::Cpu);
        };
        let mut acc = first.fields().map(|t| t.detach().copy());
        for s in &stats[1..] {
            for (a, t) in acc.iter_mut().zip(s.fields()) {
                *a += t.detach();
            }
        }
        Self::from_array(acc)
    }

    /// Stack per-minibatch stats into 1-dim tensors for logging.
    pub fn stack(stats: &[PpoStats]) -> PpoStats {
        if stats.is_empty() {
            return Self::zeros(Device::Cpu);
        }
        let fields: [Tensor; 6] = std::array::from_fn(|i| {
            let parts: Vec<&Tensor> = stats.iter().map(|s| s.fields()[i]).collect();
            Tensor::stack(&parts, 0)
        });
        Self::from_array(fields)
    }

    /// Mean of every statistic, keyed by its logging name.
    pub fn means(&self) -> BTreeMap<String, f64> {
        Self::NAMES
            .iter()
            .zip(self.fields())
            .map(|(name, t)| (name.to_string(), t.mean(Kind::Float).double_value(&[])))
            .collect()
    }
}
