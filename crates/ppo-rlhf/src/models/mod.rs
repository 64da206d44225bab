//! Causal language model collaborators.
//!
//! The recipe drives four models through these traits:
//! - `CausalModel` - forward pass over tokens with explicit positions and mask
//! - `KvCacheable` - incremental decoding caches for the policy
//! - `HasVarStore` - parameter access for optimisation and checkpointing
//!
//! `TinyCausalLm` is a small self-contained implementation used by the CLI
//! driver and the tests.

mod tiny;

pub use tiny::{OutputHead, TinyCausalLm, TinyLmConfig};

use std::ops::{Deref, DerefMut};

use tch::{nn, Tensor};

use crate::{Result, RlhfError};

/// Trait for models that have a VarStore for optimization
pub trait HasVarStore {
    /// Get mutable reference to the VarStore
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Get reference to the VarStore
    fn var_store(&self) -> &nn::VarStore;
}

/// A decoder-only model returning per-position outputs.
///
/// Policies return vocabulary logits `[b, s, V]`; value and reward models
/// return a scalar head `[b, s, 1]`.
pub trait CausalModel: HasVarStore {
    /// Forward pass.
    ///
    /// # Arguments
    /// * `tokens` - Token ids [b, s]
    /// * `input_pos` - Position ids [b, s]
    /// * `mask` - Boolean attention mask [b, s, kv_len]; `true` means attend
    fn forward(&self, tokens: &Tensor, input_pos: &Tensor, mask: &Tensor) -> Tensor;
}

/// Models supporting a key/value cache for incremental decoding.
pub trait KvCacheable {
    /// Allocate caches for `batch_size` rows of up to `max_seq_len` positions.
    fn setup_caches(&mut self, batch_size: i64, max_seq_len: i64);

    /// Release caches and return to full-sequence mode.
    fn teardown_caches(&mut self);

    fn caches_are_enabled(&self) -> bool;

    /// Capacity of the active cache, if any.
    fn cache_max_seq_len(&self) -> Option<i64>;
}

/// Scoped KV-cache: caches exist exactly as long as the guard.
///
/// The caches are torn down when the guard is dropped, including when the
/// generation that used it returns early with an error.
pub struct KvCacheGuard<'a, M: KvCacheable + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: KvCacheable + ?Sized> KvCacheGuard<'a, M> {
    pub fn new(model: &'a mut M, batch_size: i64, max_seq_len: i64) -> Self {
        model.setup_caches(batch_size, max_seq_len);
        tracing::debug!(batch_size, max_seq_len, "KV-cache enabled");
        Self { model }
    }
}

impl<M: KvCacheable + ?Sized> Deref for KvCacheGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: KvCacheable + ?Sized> DerefMut for KvCacheGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

impl<M: KvCacheable + ?Sized> Drop for KvCacheGuard<'_, M> {
    fn drop(&mut self) {
        self.model.teardown_caches();
        tracing::debug!("KV-cache released");
    }
}

/// Detached copies of every variable, sorted by name.
pub fn named_parameters(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    let mut params: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .map(|(name, var)| (name, var.detach().copy()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

/// Copy named tensors into the variables of `vs`.
///
/// Every variable must be present with a matching shape.
pub fn load_named_parameters(vs: &nn::VarStore, tensors: &[(String, Tensor)]) -> Result<()> {
    let _guard = tch::no_grad_guard();
    for (name, mut var) in vs.variables() {
        let (_, src) = tensors
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| RlhfError::Checkpoint(format!("missing parameter '{}'", name)))?;
        if src.size() != var.size() {
            return Err(RlhfError::Checkpoint(format!(
                "shape mismatch for '{}': expected {:?}, got {:?}",
                name,
                var.size(),
                src.size()
            )));
        }
        var.f_copy_(&src.to_device(var.device()))?;
    }
    Ok(())
}

/// Total number of scalar parameters in a VarStore.
pub fn num_parameters(vs: &nn::VarStore) -> i64 {
    vs.variables().values().map(|v| v.numel() as i64).sum()
}

/// Number of parameters still receiving gradients.
pub fn num_trainable_parameters(vs: &nn::VarStore) -> i64 {
    vs.trainable_variables()
        .iter()
        .filter(|v| v.requires_grad())
        .map(|v| v.numel() as i64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_kv_cache_guard_releases_on_drop() {
        let mut model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Vocab, Device::Cpu);
        {
            let guard = KvCacheGuard::new(&mut model, 2, 16);
            assert!(guard.caches_are_enabled());
            assert_eq!(guard.cache_max_seq_len(), Some(16));
        }
        assert!(!model.caches_are_enabled());
    }

    #[test]
    fn test_kv_cache_guard_releases_on_error_path() {
        fn fails(model: &mut TinyCausalLm) -> Result<()> {
            let _guard = KvCacheGuard::new(model, 1, 8);
            Err(RlhfError::Data("boom".to_string()))
        }

        let mut model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Vocab, Device::Cpu);
        assert!(fails(&mut model).is_err());
        assert!(!model.caches_are_enabled());
    }

    #[test]
    fn test_named_parameters_roundtrip() {
        let config = TinyLmConfig::default();
        let a = TinyCausalLm::new(config.clone(), OutputHead::Scalar, Device::Cpu);
        let b = TinyCausalLm::new(config, OutputHead::Scalar, Device::Cpu);

        let params = named_parameters(a.var_store());
        load_named_parameters(b.var_store(), &params).unwrap();

        for (name, tensor) in named_parameters(b.var_store()) {
            let (_, expected) = params.iter().find(|(n, _)| *n == name).unwrap();
            assert!(tensor.equal(expected), "parameter {name} differs");
        }
    }

    #[test]
    fn test_load_rejects_missing_parameters() {
        let model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Scalar, Device::Cpu);
        let mut params = named_parameters(model.var_store());
        params.pop();
        assert!(matches!(
            load_named_parameters(model.var_store(), &params),
            Err(RlhfError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_freezing_removes_trainable_parameters() {
        let mut model = TinyCausalLm::new(TinyLmConfig::default(), OutputHead::Vocab, Device::Cpu);
        assert_eq!(
            num_trainable_parameters(model.var_store()),
            num_parameters(model.var_store())
        );
        model.var_store_mut().freeze();
        assert_eq!(num_trainable_parameters(model.var_store()), 0);
    }
}
