//! Tokenizer collaborator.
//!
//! Tokenization itself happens upstream of the recipe. The recipe only needs
//! the padding id, the end-of-sequence id and optionally a list of stop tokens.

use serde::{Deserialize, Serialize};

/// Special token ids consumed by generation and trajectory masking.
pub trait TokenizerInfo {
    fn pad_id(&self) -> i64;

    fn eos_id(&self) -> i64;

    /// Extra stop tokens the tokenizer knows about, if any.
    fn stop_tokens(&self) -> Option<Vec<i64>> {
        None
    }
}

/// Plain set of special token ids, loadable from configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Padding token id
    pub pad_id: i64,
    /// End-of-sequence token id
    pub eos_id: i64,
    /// Additional stop tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_tokens: Option<Vec<i64>>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad_id: 0,
            eos_id: 1,
            stop_tokens: None,
        }
    }
}

impl SpecialTokens {
    pub fn new(pad_id: i64, eos_id: i64) -> Self {
        Self {
            pad_id,
            eos_id,
            stop_tokens: None,
        }
    }

    pub fn with_stop_tokens(mut self, stop_tokens: Vec<i64>) -> Self {
        self.stop_tokens = Some(stop_tokens);
        self
    }
}

impl TokenizerInfo for SpecialTokens {
    fn pad_id(&self) -> i64 {
        self.pad_id
    }

    fn eos_id(&self) -> i64 {
        self.eos_id
    }

    /// Configured stop tokens, or just `eos_id` when none are set.
    fn stop_tokens(&self) -> Option<Vec<i64>> {
        Some(
            self.stop_tokens
                .clone()
                .unwrap_or_else(|| vec![self.eos_id]),
        )
    }
}

/// Resolve the stop token ids used to truncate responses.
///
/// Explicitly configured ids win; otherwise the tokenizer's stop tokens are
/// used. An empty result means no response is ever truncated.
pub fn resolve_stop_tokens(configured: Option<&[i64]>, tokenizer: &dyn TokenizerInfo) -> Vec<i64> {
    if let Some(ids) = configured {
        return ids.to_vec();
    }
    match tokenizer.stop_tokens() {
        Some(ids) => ids,
        None => {
            tracing::warn!(
                "No stop tokens configured and the tokenizer defines none; \
                 responses will not be truncated"
            );
            Vec::new()
        }
    }
}
