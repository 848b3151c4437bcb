pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod metrics;
pub mod network;
pub mod schedule;
pub mod train;

pub use checkpoint::{CheckpointManager, TrainingState};
pub use config::ExperimentConfig;
pub use dataset::ImageDataset;
pub use evaluate::{EvalReport, Evaluator};
pub use network::Network;
pub use train::{TrainSummary, Trainer};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Image classification with cross-entropy on labels.
    Supervised,
    /// EsViT self-distillation; labels are ignored.
    SelfSupervised,
}

impl std::fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingMode::Supervised => write!(f, "supervised"),
            TrainingMode::SelfSupervised => write!(f, "self_supervised"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub mode: TrainingMode,
    pub learning_rate: f64,
    /// Floor of the cosine decay.
    pub min_learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Save `checkpoint_epoch_{n}` every this many epochs (and after the last one).
    pub save_every: usize,
    /// Run validation every this many epochs (and after the last one).
    pub eval_every: usize,
    /// Log the running loss every this many optimizer steps.
    pub log_every: usize,
    pub checkpoint_dir: String,
    pub warmup_steps: Option<usize>,
    pub weight_decay: Option<f64>,
    /// Maximum global gradient norm.
    pub grad_clip: Option<f64>,
    /// Self-supervised checkpoint whose student backbone initialises a
    /// supervised run.
    pub pretrained: Option<String>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            mode: TrainingMode::Supervised,
            learning_rate: 3e-4,
            min_learning_rate: 0.0,
            batch_size: 32,
            epochs: 10,
            save_every: 1,
            eval_every: 1,
            log_every: 10,
            checkpoint_dir: "./checkpoints".to_string(),
            warmup_steps: Some(0),
            weight_decay: Some(0.01),
            grad_clip: None,
            pretrained: None,
        }
    }
}
