//! Minimal causal language model.
//!
//! Token and position embeddings are mixed with a mask-weighted average of the
//! attended positions (uniform attention), followed by an MLP and an output
//! head. Small enough to train on CPU in tests, but it honours the full
//! `CausalModel` contract: padding, positions, attention masks and an
//! incremental KV-cache.

use std::cell::Cell;

use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, Device, Kind, Tensor};

use super::{CausalModel, HasVarStore, KvCacheable};

/// Configuration for the tiny causal model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TinyLmConfig {
    /// Vocabulary size
    pub vocab_size: i64,
    /// Embedding and hidden size
    pub hidden_size: i64,
    /// Number of hidden MLP layers
    pub num_layers: usize,
    /// Number of learned position embeddings
    pub max_seq_len: i64,
}

impl Default for TinyLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32,
            hidden_size: 32,
            num_layers: 1,
            max_seq_len: 128,
        }
    }
}

/// Output head of a `TinyCausalLm`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputHead {
    /// Logits over the vocabulary (policies)
    Vocab,
    /// One scalar per position (value and reward models)
    Scalar,
}

struct KvCache {
    keys: Tensor,
    pos: Cell<i64>,
    capacity: i64,
}

/// Tiny causal language model
pub struct TinyCausalLm {
    /// Variable store for parameters
    vs: nn::VarStore,
    tok_embeddings: nn::Embedding,
    pos_embeddings: nn::Embedding,
    encoder: nn::Sequential,
    output: nn::Linear,
    config: TinyLmConfig,
    cache: Option<KvCache>,
    device: Device,
}

impl TinyCausalLm {
    pub fn new(config: TinyLmConfig, head: OutputHead, device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let tok_embeddings = nn::embedding(
            &root / "tok_embeddings",
            config.vocab_size,
            config.hidden_size,
            Default::default(),
        );
        let pos_embeddings = nn::embedding(
            &root / "pos_embeddings",
            config.max_seq_len,
            config.hidden_size,
            Default::default(),
        );

        let mut encoder = nn::seq();
        for i in 0..config.num_layers {
            encoder = encoder
                .add(nn::linear(
                    &root / format!("encoder_{}", i),
                    config.hidden_size,
                    config.hidden_size,
                    Default::default(),
                ))
                .add_fn(|x| x.gelu("none"));
        }

        let out_dim = match head {
            OutputHead::Vocab => config.vocab_size,
            OutputHead::Scalar => 1,
        };
        let output = nn::linear(&root / "output", config.hidden_size, out_dim, Default::default());

        Self::init_weights(&vs);

        Self {
            vs,
            tok_embeddings,
            pos_embeddings,
            encoder,
            output,
            config,
            cache: None,
            device,
        }
    }

    fn init_weights(vs: &nn::VarStore) {
        for (name, mut var) in vs.variables() {
            if name.contains("weight") {
                tch::no_grad(|| {
                    var.copy_(&(Tensor::randn_like(&var) * 0.02));
                });
            } else if name.contains("bias") {
                tch::no_grad(|| {
                    let _ = var.zero_();
                });
            }
        }
    }

    pub fn config(&self) -> &TinyLmConfig {
        &self.config
    }
}

impl HasVarStore for TinyCausalLm {
    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

impl CausalModel for TinyCausalLm {
    fn forward(&self, tokens: &Tensor, input_pos: &Tensor, mask: &Tensor) -> Tensor {
        let positions = input_pos.clamp(0, self.config.max_seq_len - 1);
        let x = self.tok_embeddings.forward(tokens) + self.pos_embeddings.forward(&positions);

        let keys = match &self.cache {
            Some(cache) => {
                let q_len = tokens.size()[1];
                let start = cache.pos.get();
                let mut slot = cache.keys.narrow(1, start, q_len);
                slot.copy_(&x.detach());
                cache.pos.set(start + q_len);
                cache.keys.shallow_clone()
            }
            None => x.shallow_clone(),
        };

        let weights = mask.to_kind(Kind::Float);
        let norm = weights
            .sum_dim_intlist([-1i64].as_slice(), true, Kind::Float)
            .clamp_min(1.0);
        let context = (&weights / norm).matmul(&keys);

        let hidden = self.encoder.forward(&(x + context));
        self.output.forward(&hidden)
    }
}

impl KvCacheable for TinyCausalLm {
    fn setup_caches(&mut self, batch_size: i64, max_seq_len: i64) {
        let keys = Tensor::zeros(
            [batch_size, max_seq_len, self.config.hidden_size],
            (Kind::Float, self.device),
        );
        self.cache = Some(KvCache {
            keys,
            pos: Cell::new(0),
            capacity: max_seq_len,
        });
    }

    fn teardown_caches(&mut self) {
        self.cache = None;
    }

    fn caches_are_enabled(&self) -> bool {
        self.cache.is_some()
    }

    fn cache_max_seq_len(&self) -> Option<i64> {
        self.cache.as_ref().map(|c| c.capacity)
    }
}
