//! Mask and index helpers derived from the padding structure of sequences.
//!
//! Conventions: a *padding mask* passed to the attention helpers is `true` for
//! real tokens, while a *response padding mask* is `true` for positions that
//! are invalid (after the first stop token).

use tch::{Kind, Tensor};

/// Build a boolean attention mask `[b, target, target]` from a padding mask `[b, s]`.
///
/// Each query may attend to itself and to earlier non-padding keys. Columns
/// past `s` (when `target_seq_len > s`) stay causal so the mask can be reused
/// for incremental decoding against a larger cache.
pub fn get_causal_mask_from_padding_mask(padding_mask: &Tensor, target_seq_len: Option<i64>) -> Tensor {
    let size = padding_mask.size();
    let (bsz, seq_len) = (size[0], size[1]);
    let target = target_seq_len.unwrap_or(seq_len);
    let device = padding_mask.device();
    let padding_mask = padding_mask.to_kind(Kind::Bool);

    let causal = Tensor::ones([target, target], (Kind::Bool, device))
        .tril(0)
        .unsqueeze(0)
        .repeat([bsz, 1, 1]);

    let key_mask = padding_mask.unsqueeze(1).expand([bsz, target, seq_len], false);
    let valid_cols = causal.narrow(2, 0, seq_len).logical_and(&key_mask);
    let mask = if target > seq_len {
        Tensor::cat(&[valid_cols, causal.narrow(2, seq_len, target - seq_len)], 2)
    } else {
        valid_cols
    };

    mask.logical_or(&Tensor::eye(target, (Kind::Bool, device)).unsqueeze(0))
}

/// Position ids `[b, s]` counting only real tokens; padding positions get 0.
pub fn get_position_ids_from_padding_mask(padding_mask: &Tensor) -> Tensor {
    let m = padding_mask.to_kind(Kind::Int64);
    (m.cumsum(-1, Kind::Int64) - 1i64) * &m
}

/// Truncate every row after its first stop token.
///
/// Returns `(response_padding_mask, truncated)` where the mask is `true` at
/// positions strictly after the first stop token and those positions are
/// replaced by `fill_value`. The stop token itself stays valid.
pub fn truncate_sequence_at_first_stop_token(
    sequences: &Tensor,
    stop_tokens: &[i64],
    fill_value: i64,
) -> (Tensor, Tensor) {
    let mut stop_mask = Tensor::zeros_like(sequences).to_kind(Kind::Bool);
    for &token in stop_tokens {
        stop_mask = stop_mask.logical_or(&sequences.eq(token));
    }

    let stops_seen = stop_mask.to_kind(Kind::Int64).cumsum(1, Kind::Int64);
    // After the first stop: either a second stop was seen, or one was seen and this is not it.
    let padding_mask = stops_seen
        .gt(1)
        .logical_or(&stops_seen.eq(1).logical_and(&stop_mask.logical_not()));
    let truncated = sequences.masked_fill(&padding_mask, fill_value);
    (padding_mask, truncated)
}

/// Index of the last unmasked position of every row of a response padding mask.
///
/// Rows without any masked position yield `len - 1`.
pub fn get_unmasked_sequence_lengths(mask: &Tensor) -> Tensor {
    mask.logical_not()
        .to_kind(Kind::Int64)
        .cumsum(-1, Kind::Int64)
        .argmax(-1, false)
}

/// Log-probabilities of `sequences` `[b, t]` under `logits` `[b, t, V]`.
pub fn logits_to_logprobs(logits: &Tensor, sequences: &Tensor, temperature: f64) -> Tensor {
    (logits / temperature)
        .log_softmax(-1, Kind::Float)
        .gather(2, &sequences.unsqueeze(-1), false)
        .squeeze_dim(-1)
}

/// Slice model outputs `[b, ctx + gen, ...]` to the `gen` positions that
/// predict the generated tokens (`[:, ctx - 1 : -1]`).
pub fn truncate_sequence_for_logprobs(outputs: &Tensor, context_length: i64) -> Tensor {
    let seq_len = outputs.size()[1];
    outputs.narrow(1, context_length - 1, seq_len - context_length)
}

/// Rows that should receive the reward penalty.
///
/// A row is penalised when `penalise_no_eos` is set and its response padding
/// mask has no `true` entry, or when it is shorter than `min_response_length`.
pub fn get_reward_penalty_mask(
    response_padding_masks: &Tensor,
    seq_lens: &Tensor,
    penalise_no_eos: bool,
    min_response_length: Option<usize>,
) -> Tensor {
    let mut mask = Tensor::zeros_like(seq_lens).to_kind(Kind::Bool);
    if penalise_no_eos {
        mask = response_padding_masks.any_dim(-1, false).logical_not();
    }
    if let Some(min_len) = min_response_length {
        mask = mask.logical_or(&seq_lens.lt(min_len as i64));
    }
    mask
}

/// Value-head padding: the value at the position right after the last valid
/// token is kept, unless the response is empty or runs to the end.
///
/// Returns `(value_padding_masks, value_seq_idxs)`.
pub fn get_value_padding_masks(
    response_padding_masks: &Tensor,
    seq_lens: &Tensor,
    max_generated_tokens: i64,
) -> (Tensor, Tensor) {
    let shift = seq_lens.gt(0).logical_and(&seq_lens.lt(max_generated_tokens - 1));
    let value_seq_idxs = (seq_lens + 1i64).where_self(&shift, seq_lens);
    let value_padding_masks = response_padding_masks
        .to_kind(Kind::Int64)
        .scatter_value(1, &value_seq_idxs.unsqueeze(-1), 0i64)
        .to_kind(Kind::Bool);
    (value_padding_masks, value_seq_idxs)
}
