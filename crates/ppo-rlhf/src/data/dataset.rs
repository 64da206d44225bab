//! Tokenized prompt datasets.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::{Result, RlhfError};

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptRecord {
    Tokens(Vec<i64>),
    Object { tokens: Vec<i64> },
}

/// Prompts as token-id sequences.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptDataset {
    prompts: Vec<Vec<i64>>,
}

impl PromptDataset {
    pub fn new(prompts: Vec<Vec<i64>>) -> Result<Self> {
        if let Some(idx) = prompts.iter().position(|p| p.is_empty()) {
            return Err(RlhfError::Data(format!("prompt {} is empty", idx)));
        }
        Ok(Self { prompts })
    }

    /// Load a JSONL file with one prompt per line, either a bare array of token
    /// ids or an object with a `tokens` array. Blank lines are skipped.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut prompts = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PromptRecord = serde_json::from_str(&line).map_err(|e| {
                RlhfError::Data(format!("line {}: {}", line_no + 1, e))
            })?;
            prompts.push(match record {
                PromptRecord::Tokens(tokens) => tokens,
                PromptRecord::Object { tokens } => tokens,
            });
        }
        tracing::info!(path = %path.as_ref().display(), prompts = prompts.len(), "Loaded prompts");
        Self::new(prompts)
    }

    /// Seeded random prompts for smoke tests and demos.
    ///
    /// Token ids are drawn from `[first_token, vocab_size)` so special tokens
    /// below `first_token` never appear in prompts.
    pub fn synthetic(
        num_prompts: usize,
        min_len: usize,
        max_len: usize,
        first_token: i64,
        vocab_size: i64,
        seed: u64,
    ) -> Result<Self> {
        if min_len == 0 || min_len > max_len {
            return Err(RlhfError::Data(format!(
                "invalid prompt length range {}..={}",
                min_len, max_len
            )));
        }
        if first_token >= vocab_size {
            return Err(RlhfError::Data(
                "no regular tokens left in the vocabulary".to_string(),
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let prompts = (0..num_prompts)
            .map(|_| {
                let len = rng.gen_range(min_len..=max_len);
                (0..len).map(|_| rng.gen_range(first_token..vocab_size)).collect()
            })
            .collect();
        Self::new(prompts)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&[i64]> {
        self.prompts.get(idx).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_jsonl_accepts_both_forms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.jsonl");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "[5, 6, 7]").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"tokens": [8, 9]}}"#).unwrap();

        let ds = PromptDataset::from_jsonl(&path).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.get(1), Some(&[8i64, 9][..]));
    }

    #[test]
    fn test_from_jsonl_reports_bad_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.jsonl");
        std::fs::write(&path, "[1, 2]\n\"oops\"\n").unwrap();

        match PromptDataset::from_jsonl(&path) {
            Err(RlhfError::Data(msg)) => assert!(msg.starts_with("line 2")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_prompt_rejected() {
        assert!(PromptDataset::new(vec![vec![1], vec![]]).is_err());
    }

    #[test]
    fn test_synthetic_is_seeded_and_in_range() {
        let a = PromptDataset::synthetic(16, 2, 5, 3, 20, 9).unwrap();
        let b = PromptDataset::synthetic(16, 2, 5, 3, 20, 9).unwrap();
        assert_eq!(a, b);
        for i in 0..a.len() {
            let p = a.get(i).unwrap();
            assert!((2..=5).contains(&p.len()));
            assert!(p.iter().all(|&t| (3..20).contains(&t)));
        }
    }
}
