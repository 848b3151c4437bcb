use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tch::Tensor;

use playground_core::safetensors_util;

use crate::config::ExperimentConfig;

pub const CONFIG_FILE: &str = "config.json";
pub const STATE_FILE: &str = "state.json";
pub const BEST_FILE: &str = "best_model.safetensors";

/// Progress needed to resume a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch, starting at 1.
    pub epoch: usize,
    /// Optimizer steps taken so far.
    pub step: usize,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    Epoch(usize),
    Best,
}

impl CheckpointKind {
    pub fn file_name(&self) -> String {
        match self {
            CheckpointKind::Epoch(epoch) => format!("checkpoint_epoch_{}.safetensors", epoch),
            CheckpointKind::Best => BEST_FILE.to_string(),
        }
    }
}

fn epoch_of(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("checkpoint_epoch_")?
        .strip_suffix(".safetensors")?
        .parse()
        .ok()
}

/// Owns the layout of a checkpoint directory:
///
/// ```text
/// checkpoints/
///   config.json                        experiment config used to rebuild the model
///   state.json                         latest TrainingState
///   checkpoint_epoch_{n}.safetensors   periodic weights
///   best_model.safetensors             weights with the lowest validation loss
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint dir {:?}", dir))?;
        Ok(Self { dir })
    }

    /// Opens an existing directory without creating it.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            bail!("Checkpoint dir {:?} does not exist", dir);
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_config(&self, config: &ExperimentConfig) -> Result<()> {
        config.save_json(self.dir.join(CONFIG_FILE))
    }

    pub fn load_config(&self) -> Result<ExperimentConfig> {
        let path = self.dir.join(CONFIG_FILE);
        ExperimentConfig::from_file(&path)
            .with_context(|| format!("No usable {} next to the checkpoint in {:?}", CONFIG_FILE, self.dir))
    }

    /// Writes the weights and updates `state.json`. Returns the weights path.
    pub fn save(
        &self,
        tensors: &HashMap<String, Tensor>,
        state: &TrainingState,
        kind: CheckpointKind,
    ) -> Result<PathBuf> {
        let path = self.dir.join(kind.file_name());
        let mut metadata = HashMap::from([
            ("epoch".to_string(), state.epoch.to_string()),
            ("step".to_string(), state.step.to_string()),
        ]);
        if let Some(loss) = state.best_val_loss {
            metadata.insert("best_val_loss".to_string(), loss.to_string());
        }

        safetensors_util::save_tensors(tensors, &path, &metadata)
            .with_context(|| format!("Failed to save checkpoint to {:?}", path))?;
        self.save_state(state)?;

        log::info!("Saved checkpoint {:?}", path);
        Ok(path)
    }

    pub fn save_state(&self, state: &TrainingState) -> Result<()> {
        let path = self.dir.join(STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Failed to write {:?}", path))
    }

    pub fn load_state(&self) -> Result<TrainingState> {
        let path = self.dir.join(STATE_FILE);
        let content = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn best_checkpoint(&self) -> Option<PathBuf> {
        let path = self.dir.join(BEST_FILE);
        path.is_file().then_some(path)
    }

    /// The periodic checkpoint with the highest epoch number.
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        let mut latest: Option<(usize, PathBuf)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(epoch) = epoch_of(&path) {
                if latest.as_ref().map_or(true, |(best, _)| epoch > *best) {
                    latest = Some((epoch, path));
                }
            }
        }
        Ok(latest.map(|(_, path)| path))
    }

    /// Turns a weights file or a checkpoint directory into
    /// `(weights file, manager for its directory)`. Directories prefer the
    /// best model, then the latest periodic checkpoint.
    pub fn resolve<P: AsRef<Path>>(path: P) -> Result<(PathBuf, CheckpointManager)> {
        let path = path.as_ref();
        if path.is_file() {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            return Ok((path.to_path_buf(), CheckpointManager::open(dir)?));
        }

        let manager = CheckpointManager::open(path)?;
        let weights = match manager.best_checkpoint() {
            Some(best) => best,
            None => match manager.latest_checkpoint()? {
                Some(latest) => latest,
                None => bail!("No checkpoint found in {:?}", path),
            },
        };
        Ok((weights, manager))
    }
}
