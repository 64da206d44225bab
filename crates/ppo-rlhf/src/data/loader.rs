//! Batching of prompts into left-padded tensors.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};

use super::PromptDataset;
use crate::checkpoint::Checkpointable;
use crate::Result;

/// Position of a loader within its epochs, stored in intermediate checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataLoaderState {
    pub epoch: u64,
    pub batches_yielded: usize,
}

/// Yields `[batch_size, max_len]` prompt batches, left-padded with `pad_id`.
///
/// Incomplete trailing batches are dropped. With shuffling enabled the order
/// of every epoch is a permutation seeded by `seed + epoch`, so any epoch can
/// be replayed without the preceding ones.
pub struct PromptDataLoader {
    dataset: PromptDataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    pad_id: i64,
    epoch: u64,
    order: Vec<usize>,
    batches_yielded: usize,
    resume_pending: bool,
}

impl PromptDataLoader {
    pub fn new(dataset: PromptDataset, batch_size: usize, shuffle: bool, seed: u64, pad_id: i64) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            pad_id,
            epoch: 0,
            order: Vec::new(),
            batches_yielded: 0,
            resume_pending: false,
        };
        loader.order = loader.epoch_order(0);
        loader
    }

    /// Number of full batches per epoch.
    pub fn len(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start `epoch`. A position restored with `load_state_dict` for the same
    /// epoch is kept; otherwise iteration restarts at the first batch.
    pub fn set_epoch(&mut self, epoch: u64) {
        let keep_position = self.resume_pending && epoch == self.epoch;
        self.resume_pending = false;
        self.epoch = epoch;
        self.order = self.epoch_order(epoch);
        if !keep_position {
            self.batches_yielded = 0;
        }
    }

    /// Next batch of the current epoch on `device`, or `None` when exhausted.
    pub fn next_batch(&mut self, device: Device) -> Option<Tensor> {
        let start = self.batches_yielded * self.batch_size;
        let end = start + self.batch_size;
        if end > self.order.len() {
            return None;
        }

        let prompts: Vec<&[i64]> = self.order[start..end]
            .iter()
            .filter_map(|&idx| self.dataset.get(idx))
            .collect();
        let max_len = prompts.iter().map(|p| p.len()).max().unwrap_or(0);

        let mut flat = Vec::with_capacity(prompts.len() * max_len);
        for prompt in &prompts {
            flat.extend(std::iter::repeat(self.pad_id).take(max_len - prompt.len()));
            flat.extend_from_slice(prompt);
        }

        self.batches_yielded += 1;
        Some(
            Tensor::from_slice(&flat)
                .reshape([prompts.len() as i64, max_len as i64])
                .to_device(device),
        )
    }

    pub fn state_dict(&self) -> DataLoaderState {
        DataLoaderState {
            epoch: self.epoch,
            batches_yielded: self.batches_yielded,
        }
    }

    pub fn load_state_dict(&mut self, state: &DataLoaderState) {
        self.epoch = state.epoch;
        self.order = self.epoch_order(state.epoch);
        self.batches_yielded = state.batches_yielded;
        self.resume_pending = true;
    }
}

impl Checkpointable for PromptDataLoader {
    fn save_state(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state_dict())?)
    }

    fn load_state(&mut self, data: &[u8]) -> Result<()> {
        let state: DataLoaderState = serde_json::from_slice(data)?;
        self.load_state_dict(&state);
        Ok(())
    }
}
