//! File-based checkpointer with epoch rotation.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tch::Tensor;

use super::state::{CheckpointDict, OptimizerMeta, OptimizerState, OPTIMIZER_KEY};
use crate::{Result, RlhfError};

/// Recipe state file written next to intermediate weights
pub const RECIPE_STATE_FILE: &str = "recipe_state.json";
/// Optimizer moments written next to intermediate weights
pub const OPTIMIZER_FILE: &str = "optimizer.pt";

/// Loads and saves the checkpoint of one model.
pub trait Checkpointer {
    /// Load weights, plus optimizer and recipe state when resuming.
    fn load_checkpoint(&self) -> Result<CheckpointDict>;

    /// Save the checkpoint for `epoch`.
    ///
    /// Intermediate checkpoints also carry optimizer and recipe state so that
    /// training can resume; final ones hold weights only.
    fn save_checkpoint(&mut self, dict: &CheckpointDict, epoch: u64, intermediate: bool) -> Result<PathBuf>;
}

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory holding the initial weights
    pub checkpoint_dir: PathBuf,
    /// File name of the initial weights in `checkpoint_dir`
    pub checkpoint_file: String,
    /// Directory receiving epoch checkpoints
    pub output_dir: PathBuf,
    /// Prefix of epoch checkpoint files
    pub model_name: String,
    /// Keep only the last N epoch checkpoints (0 = keep all)
    pub keep_last: usize,
    /// Load the latest epoch checkpoint instead of the initial weights
    pub resume_from_checkpoint: bool,
    /// Also load optimizer and recipe state when resuming
    pub load_recipe_state: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_file: "model.pt".to_string(),
            output_dir: PathBuf::from("output"),
            model_name: "model".to_string(),
            keep_last: 0,
            resume_from_checkpoint: false,
            load_recipe_state: false,
        }
    }
}

impl CheckpointConfig {
    /// Create a config reading `checkpoint_dir/checkpoint_file` and writing to `output_dir`.
    pub fn new(
        checkpoint_dir: impl Into<PathBuf>,
        checkpoint_file: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            checkpoint_file: checkpoint_file.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Set number of checkpoints to keep.
    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }

    pub fn resume(mut self, enabled: bool) -> Self {
        self.resume_from_checkpoint = enabled;
        self
    }

    pub fn load_recipe_state(mut self, enabled: bool) -> Self {
        self.load_recipe_state = enabled;
        self
    }
}

/// Checkpointer storing complete models with `Tensor::save_multi`.
///
/// Layout of `output_dir`:
/// - `<model_name>_epoch_<NNNNNN>.pt` - weights of every saved epoch
/// - `recipe_state.json` - recipe and optimizer metadata (intermediate only)
/// - `optimizer.pt` - optimizer moments (intermediate only)
///
/// Each model needs its own `output_dir`, since saving a final checkpoint
/// removes the resumption files.
pub struct FullModelCheckpointer {
    config: CheckpointConfig,
}

impl FullModelCheckpointer {
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn epoch_prefix(&self) -> String {
        format!("{}_epoch_", self.config.model_name)
    }

    /// List all epoch checkpoint files, ordered by epoch.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.config.output_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("pt"))
            .filter_map(|p| self.extract_epoch_from_path(&p).map(|epoch| (epoch, p)))
            .collect();

        checkpoints.sort();
        Ok(checkpoints.into_iter().map(|(_, p)| p).collect())
    }

    /// Most recent epoch checkpoint, if any.
    pub fn latest_weights(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop())
    }

    /// Extract epoch number from checkpoint filename.
    pub fn extract_epoch_from_path(&self, path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&self.epoch_prefix()))
            .and_then(|s| s.parse().ok())
    }

    /// Remove old checkpoints, keeping only the last N.
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;

        while checkpoints.len() > self.config.keep_last {
            let old = checkpoints.remove(0);
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }

        Ok(())
    }

    fn load_resume_state(&self, dict: &mut CheckpointDict) -> Result<()> {
        let state_path = self.config.output_dir.join(RECIPE_STATE_FILE);
        if !state_path.exists() {
            return Err(RlhfError::Checkpoint(format!(
                "no recipe state at {}; was the last checkpoint intermediate?",
                state_path.display()
            )));
        }
        let state: Value = serde_json::from_str(&fs::read_to_string(&state_path)?)?;

        if let Some(meta) = state.get(OPTIMIZER_KEY) {
            let meta: OptimizerMeta = serde_json::from_value(meta.clone())?;
            let opt_path = self.config.output_dir.join(OPTIMIZER_FILE);
            let tensors = if opt_path.exists() {
                Tensor::load_multi(&opt_path)?
            } else {
                Vec::new()
            };
            dict.optimizer = Some(OptimizerState::from_parts(meta, tensors));
        }
        dict.recipe_state = Some(state);
        Ok(())
    }
}

impl Checkpointer for FullModelCheckpointer {
    fn load_checkpoint(&self) -> Result<CheckpointDict> {
        let weights_path = if self.config.resume_from_checkpoint {
            self.latest_weights()?.ok_or_else(|| {
                RlhfError::Checkpoint(format!(
                    "no '{}*' checkpoint in {} to resume from",
                    self.epoch_prefix(),
                    self.config.output_dir.display()
                ))
            })?
        } else {
            self.config.checkpoint_dir.join(&self.config.checkpoint_file)
        };

        let model = Tensor::load_multi(&weights_path)?;
        tracing::info!(path = %weights_path.display(), tensors = model.len(), "Loaded checkpoint");
        if self.config.resume_from_checkpoint {
            if let Some(epoch) = self.extract_epoch_from_path(&weights_path) {
                tracing::info!(epoch, "Resuming after epoch");
            }
        }
        let mut dict = CheckpointDict::new(model);

        if self.config.resume_from_checkpoint && self.config.load_recipe_state {
            self.load_resume_state(&mut dict)?;
        }
        Ok(dict)
    }

    fn save_checkpoint(&mut self, dict: &CheckpointDict, epoch: u64, intermediate: bool) -> Result<PathBuf> {
        fs::create_dir_all(&self.config.output_dir)?;

        let filename = format!("{}{:06}.pt", self.epoch_prefix(), epoch);
        let path = self.config.output_dir.join(&filename);
        Tensor::save_multi(&dict.model, &path)?;
        tracing::info!(path = %path.display(), epoch, intermediate, "Saved checkpoint");

        let state_path = self.config.output_dir.join(RECIPE_STATE_FILE);
        let opt_path = self.config.output_dir.join(OPTIMIZER_FILE);
        let has_state = dict.recipe_state.is_some() || dict.optimizer.is_some();

        if intermediate && has_state {
            let mut state = match &dict.recipe_state {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(RlhfError::Checkpoint(
                        "recipe state must be a JSON object".to_string(),
                    ))
                }
                None => serde_json::Map::new(),
            };
            if let Some(optimizer) = &dict.optimizer {
                state.insert(OPTIMIZER_KEY.to_string(), serde_json::to_value(optimizer.meta())?);
                Tensor::save_multi(&optimizer.tensors, &opt_path)?;
            }
            fs::write(&state_path, serde_json::to_string_pretty(&Value::Object(state))?)?;
            tracing::debug!(path = %state_path.display(), "Saved recipe state");
        } else if !intermediate {
            for stale in [&state_path, &opt_path] {
                if stale.exists() {
                    fs::remove_file(stale)?;
                }
            }
        }

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }

        Ok(path)
    }
}
