use anyhow::{bail, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use playground_core::{Augment, AugmentOp, EsVitConfig, MaxVitConfig};

use crate::{TrainerConfig, TrainingMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataSource {
    /// CIFAR-10 binary batches (`data_batch_*.bin`, `test_batch.bin`).
    Cifar10 { path: String },
    /// MNIST idx files.
    Mnist { path: String },
    /// `path/train/<class>/*.png` and optionally `path/val/<class>/*.png`.
    ImageFolder { path: String },
    /// Generated class-dependent patterns, for smoke tests and demos.
    Synthetic {
        num_classes: i64,
        train_size: i64,
        val_size: i64,
        channels: i64,
    },
}

impl DataSource {
    pub fn channels(&self) -> i64 {
        match self {
            DataSource::Cifar10 { .. } | DataSource::ImageFolder { .. } => 3,
            DataSource::Mnist { .. } => 1,
            DataSource::Synthetic { channels, .. } => *channels,
        }
    }

    /// Class count when it is known without reading the data.
    pub fn known_num_classes(&self) -> Option<i64> {
        match self {
            DataSource::Cifar10 { .. } | DataSource::Mnist { .. } => Some(10),
            DataSource::Synthetic { num_classes, .. } => Some(*num_classes),
            DataSource::ImageFolder { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub source: DataSource,
    /// Images are resized to `image_size x image_size`.
    pub image_size: i64,
    /// Share of the training set held out when the source has no validation split.
    pub val_fraction: f64,
    /// Train-time augmentation for supervised runs.
    pub augment: Vec<AugmentOp>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSource::Synthetic {
                num_classes: 10,
                train_size: 512,
                val_size: 128,
                channels: 3,
            },
            image_size: 32,
            val_fraction: 0.1,
            augment: Vec::new(),
        }
    }
}

impl DataConfig {
    pub fn augmentation(&self) -> Augment {
        Augment::new(self.augment.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Append epoch metrics to `metrics.csv`.
    pub csv: bool,
    /// Append step and epoch events to `events.jsonl`.
    pub jsonl: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            csv: true,
            jsonl: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub seed: u64,
    pub data: DataConfig,
    pub model: MaxVitConfig,
    pub trainer: TrainerConfig,
    pub es_vit: Option<EsVitConfig>,
    pub tracking: TrackingConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "playground".to_string(),
            seed: 42,
            data: DataConfig::default(),
            model: MaxVitConfig {
                window_size: 4,
                ..Default::default()
            },
            trainer: TrainerConfig::default(),
            es_vit: None,
            tracking: TrackingConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Loads YAML (`.yaml`, `.yml`) or JSON (`.json`) by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config {:?}", path)),
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config {:?}", path)),
            _ => bail!("Unsupported config format {:?}: expected .yaml, .yml or .json", path),
        }
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config to {:?}", path.as_ref()))
    }

    pub fn mode(&self) -> TrainingMode {
        self.trainer.mode
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate().context("Invalid model section")?;
        self.model
            .validate_image_size(self.data.image_size)
            .context("Invalid data.image_size for this model")?;

        let channels = self.data.source.channels();
        ensure!(
            self.model.channels == channels,
            "model.channels is {} but the {:?} source has {} channels",
            self.model.channels,
            self.data.source,
            channels
        );
        if let Some(num_classes) = self.data.source.known_num_classes() {
            ensure!(
                self.model.num_classes == num_classes,
                "model.num_classes is {} but the data has {} classes",
                self.model.num_classes,
                num_classes
            );
        }
        if let DataSource::Synthetic {
            num_classes,
            train_size,
            val_size,
            ..
        } = &self.data.source
        {
            ensure!(*num_classes > 0 && *train_size > 0 && *val_size >= 0, "synthetic data needs positive sizes");
        }
        ensure!(
            (0.0..1.0).contains(&self.data.val_fraction),
            "data.val_fraction must lie in [0, 1), got {}",
            self.data.val_fraction
        );
        self.data
            .augmentation()
            .validate(channels)
            .context("Invalid data.augment section")?;
        ensure!(
            !self.data.augment.iter().any(|op| matches!(op, AugmentOp::Normalize { .. })),
            "data.augment only runs during training and must not normalize"
        );

        let t = &self.trainer;
        ensure!(t.batch_size > 0, "trainer.batch_size must be positive");
        ensure!(t.epochs > 0, "trainer.epochs must be positive");
        ensure!(t.learning_rate > 0.0, "trainer.learning_rate must be positive");
        ensure!(
            t.min_learning_rate >= 0.0 && t.min_learning_rate <= t.learning_rate,
            "trainer.min_learning_rate must lie in [0, learning_rate]"
        );
        ensure!(t.save_every > 0 && t.eval_every > 0 && t.log_every > 0, "trainer intervals must be positive");
        if let Some(clip) = t.grad_clip {
            ensure!(clip > 0.0, "trainer.grad_clip must be positive");
        }

        match (t.mode, &self.es_vit) {
            (TrainingMode::SelfSupervised, None) => {
                bail!("self_supervised mode needs an es_vit section")
            }
            (TrainingMode::SelfSupervised, Some(es_vit)) => {
                es_vit.validate().context("Invalid es_vit section")?;
                ensure!(
                    es_vit.image_size == self.data.image_size,
                    "es_vit.image_size ({}) must equal data.image_size ({})",
                    es_vit.image_size,
                    self.data.image_size
                );
                ensure!(channels == 3, "es_vit view augmentations need RGB images");
                ensure!(t.pretrained.is_none(), "trainer.pretrained only applies to supervised runs");
            }
            (TrainingMode::Supervised, _) => {}
        }
        Ok(())
    }
}
