mod common;

use common::*;
use ppo_rlhf::prelude::*;
use ppo_rlhf::rlhf::{
    compute_rewards, estimate_advantages, estimate_trajectory_advantages,
    get_unmasked_sequence_lengths, get_value_padding_masks,
};
use tch::{Device, Kind, Tensor};
use tempfile::tempdir;

fn recipe(config: PpoConfig) -> (tempfile::TempDir, Recipe) {
    let dir = tempdir().unwrap();
    let base = write_base_weights(dir.path());
    let recipe = setup(config, &base, &dir.path().join("run"), 8).unwrap();
    (dir, recipe)
}

#[test]
fn test_trajectory_shapes() {
    let (_dir, mut recipe) = recipe(base_config());
    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();

    assert_eq!(traj.batch_size(), 8);
    assert_eq!(traj.query_responses.size(), vec![8, 9]);
    assert_eq!(traj.masks.size(), vec![8, 9, 9]);
    assert_eq!(traj.position_ids.size(), vec![8, 9]);
    for t in [
        &traj.logprobs,
        &traj.ref_logprobs,
        &traj.values,
        &traj.response_padding_masks,
        &traj.value_padding_masks,
    ] {
        assert_eq!(t.size(), vec![8, 6]);
    }
    assert_eq!(traj.scores.size(), vec![8]);
    assert_eq!(traj.seq_lens.size(), vec![8]);
    // prompts are kept verbatim
    assert!(traj.query_responses.narrow(1, 0, 3).equal(&prompt_batch()));
}

#[test]
fn test_mask_invariants() {
    let (_dir, mut recipe) = recipe(base_config());
    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();
    let gen = 6usize;

    let rpad = longs(&traj.response_padding_masks);
    let vpad = longs(&traj.value_padding_masks);
    let logprobs = floats(&traj.logprobs);
    let ref_logprobs = floats(&traj.ref_logprobs);
    let values = floats(&traj.values);
    let seq_lens = longs(&traj.seq_lens);
    let value_idxs = longs(&traj.value_seq_idxs);

    for row in 0..8 {
        let r = &rpad[row * gen..(row + 1) * gen];
        // once invalid, always invalid
        assert!(r.windows(2).all(|w| w[0] <= w[1]), "row {} padding not monotone", row);

        let first_invalid = r.iter().position(|&x| x == 1).unwrap_or(gen);
        let expected_len = if first_invalid == gen { gen - 1 } else { first_invalid - 1 };
        assert_eq!(seq_lens[row] as usize, expected_len);

        let idx = value_idxs[row];
        assert!(idx == seq_lens[row] || idx == seq_lens[row] + 1);
        assert_eq!(vpad[row * gen + idx as usize], 0);

        for t in 0..gen {
            let i = row * gen + t;
            if r[t] == 1 {
                assert_eq!(logprobs[i], 1.0);
                assert_eq!(ref_logprobs[i], 1.0);
            } else {
                assert!(logprobs[i] <= 0.0);
            }
            assert!(vpad[i] <= r[t]);
            if vpad[i] == 1 {
                assert_eq!(values[i], 0.0);
            }
        }
    }
}

#[test]
fn test_rows_without_stop_token() {
    let mut config = base_config();
    config.stop_token_ids = Some(vec![99]);
    config.penalise_no_eos = true;
    config.reward_penalty = -3.0;
    let (_dir, mut recipe) = recipe(config);
    assert_eq!(recipe.stop_token_ids(), &[99]);

    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();

    assert_eq!(traj.response_padding_masks.sum(Kind::Int64).int64_value(&[]), 0);
    assert_eq!(longs(&traj.seq_lens), vec![5; 8]);
    assert!(traj.value_seq_idxs.equal(&traj.seq_lens));
    assert_eq!(floats(&traj.scores), vec![-3.0; 8]);
}

#[test]
fn test_penalty_disabled_keeps_reward_model_scores() {
    let mut config = base_config();
    config.stop_token_ids = Some(vec![99]);
    config.penalise_no_eos = false;
    config.min_response_length = None;
    let (_dir, mut recipe) = recipe(config);

    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();
    assert!(floats(&traj.scores).iter().all(|s| *s != -3.0));
}

#[test]
fn test_min_response_length_penalty() {
    let mut config = base_config();
    config.stop_token_ids = Some(vec![99]);
    config.penalise_no_eos = false;
    // every response is 6 tokens long, i.e. seq_lens == 5
    config.min_response_length = Some(6);
    let (_dir, mut recipe) = recipe(config);

    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();
    assert_eq!(floats(&traj.scores), vec![-3.0; 8]);
}

#[test]
fn test_sampling_is_reproducible_per_seed() {
    let rollout = |seed: u64| {
        let (_dir, mut recipe) = recipe(base_config().with_seed(seed));
        recipe
            .generate_trajectory_batched(&prompt_batch())
            .unwrap()
            .query_responses
    };
    assert!(rollout(3).equal(&rollout(3)));
}

#[test]
fn test_rewards_and_advantages_on_trajectory() {
    let (_dir, mut recipe) = recipe(base_config());
    let traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();

    let (rewards, kl, kl_rewards) = compute_rewards(
        &traj.scores,
        &traj.logprobs,
        &traj.ref_logprobs,
        0.05,
        Some(&traj.value_seq_idxs),
    );
    assert_eq!(rewards.size(), vec![8, 6]);
    // policy and reference start from the same weights
    assert!(kl.abs().max().double_value(&[]) < 1e-4);

    let score_mass = (&rewards - &kl_rewards).sum(Kind::Float).double_value(&[]);
    let scores = traj.scores.sum(Kind::Float).double_value(&[]);
    assert!((score_mass - scores).abs() < 1e-3);

    let valid = traj.value_padding_masks.logical_not();
    let (advantages, returns) =
        estimate_advantages(&traj.values, &rewards, 1.0, 0.95, Some(&valid)).unwrap();
    assert_eq!(advantages.size(), vec![8, 6]);
    assert_eq!(returns.size(), vec![8, 6]);

    // every row, early stop or not, sees its score at the first position
    let mut boosted = traj.index_select(&Tensor::arange(8, (Kind::Int64, Device::Cpu)));
    boosted.scores = &traj.scores + 100.0;
    let estimate = estimate_trajectory_advantages(&boosted, &base_config()).unwrap();
    let base = estimate_trajectory_advantages(&traj, &base_config()).unwrap();
    let first = |t: &Tensor| floats(&t.select(1, 0));
    for (row, (hi, lo)) in first(&estimate.returns).iter().zip(first(&base.returns)).enumerate() {
        assert!(hi - lo > 1.0, "row {} return unchanged by its score", row);
    }
}

#[test]
fn test_score_reaches_returns_after_early_stop() {
    let (_dir, mut recipe) = recipe(base_config());
    let mut traj = recipe.generate_trajectory_batched(&prompt_batch()).unwrap();

    // row 0 stops after two tokens, the other rows keep their padding
    let stop = Tensor::from_slice(&[0i64, 0, 1, 1, 1, 1]).to_kind(Kind::Bool);
    let rpad = traj.response_padding_masks.copy();
    rpad.get(0).copy_(&stop);
    let seq_lens = get_unmasked_sequence_lengths(&rpad);
    let (vpad, value_seq_idxs) = get_value_padding_masks(&rpad, &seq_lens, 6);
    traj.logprobs = traj.logprobs.masked_fill(&rpad, 1.0);
    traj.ref_logprobs = traj.ref_logprobs.masked_fill(&rpad, 1.0);
    traj.values = traj.values.masked_fill(&vpad, 0.0);
    traj.response_padding_masks = rpad;
    traj.value_padding_masks = vpad;
    traj.value_seq_idxs = value_seq_idxs;
    traj.seq_lens = seq_lens;
    assert_eq!(longs(&traj.value_seq_idxs)[0], 2);

    let returns = |score: f32| {
        let mut t = traj.index_select(&Tensor::arange(8, (Kind::Int64, Device::Cpu)));
        t.scores = t.scores.index_fill(0, &Tensor::from_slice(&[0i64]), score as f64);
        floats(&estimate_trajectory_advantages(&t, &base_config()).unwrap().returns.get(0))
    };
    let (low, high) = (returns(0.0), returns(100.0));
    for t in 0..=2 {
        assert!(high[t] - low[t] > 1.0, "score did not reach position {}", t);
    }
    for t in 3..6 {
        assert_eq!(high[t], low[t]);
    }
}
