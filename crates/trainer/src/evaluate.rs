use anyhow::{ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind};

use crate::checkpoint::CheckpointManager;
use crate::config::ExperimentConfig;
use crate::dataset::ImageDataset;
use crate::network::Network;
use crate::TrainingMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub name: String,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub mode: TrainingMode,
    pub checkpoint: Option<String>,
    pub samples: usize,
    /// Cross-entropy for classifiers, EsViT loss for self-supervised runs.
    pub loss: f64,
    pub top1: Option<f64>,
    pub top5: Option<f64>,
    /// The k actually used for `top5`, clamped to the class count.
    pub top_k: usize,
    pub per_class: Vec<ClassAccuracy>,
}

impl EvalReport {
    pub fn to_markdown(&self) -> String {
        let percent = |v: Option<f64>| v.map(|v| format!("{:.2}%", v * 100.0)).unwrap_or_else(|| "-".to_string());

        let mut out = String::new();
        let _ = writeln!(out, "| Metric | Value |");
        let _ = writeln!(out, "|---|---|");
        if let Some(checkpoint) = &self.checkpoint {
            let _ = writeln!(out, "| Checkpoint | `{}` |", checkpoint);
        }
        let _ = writeln!(out, "| Mode | {} |", self.mode);
        let _ = writeln!(out, "| Samples | {} |", self.samples);
        let _ = writeln!(out, "| Loss | {:.4} |", self.loss);
        if self.mode == TrainingMode::Supervised {
            let _ = writeln!(out, "| Top-1 | {} |", percent(self.top1));
            let _ = writeln!(out, "| Top-{} | {} |", self.top_k, percent(self.top5));
        }

        if !self.per_class.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "| Class | Correct | Total | Accuracy |");
            let _ = writeln!(out, "|---|---|---|---|");
            for class in &self.per_class {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {:.2}% |",
                    class.name,
                    class.correct,
                    class.total,
                    class.accuracy * 100.0
                );
            }
        }
        out
    }
}

/// Runs `network` over the validation split without gradients.
pub fn evaluate_network(
    network: &mut Network,
    dataset: &ImageDataset,
    batch_size: i64,
    device: Device,
    rng: &mut dyn RngCore,
) -> Result<EvalReport> {
    ensure!(batch_size > 0, "Batch size must be positive, got {}", batch_size);
    ensure!(dataset.val_len() > 0, "The validation split is empty");
    let mode = network.mode();
    let num_classes = dataset.num_classes;
    let top_k = 5.min(num_classes);

    let mut loss_sum = 0.0;
    let mut samples = 0usize;
    let mut top1 = 0i64;
    let mut topk = 0i64;
    let mut correct = vec![0usize; num_classes as usize];
    let mut total = vec![0usize; num_classes as usize];

    for (images, labels) in dataset.val_iter(batch_size, device) {
        let batch = images.size()[0] as usize;
        let out = tch::no_grad(|| network.forward_loss(&images, &labels, &mut *rng, false));
        loss_sum += out.loss.double_value(&[]) * batch as f64;
        samples += batch;

        if let Some(logits) = out.logits {
            let predictions = logits.argmax(-1, false);
            let hits = predictions.eq_tensor(&labels);
            top1 += hits.sum(Kind::Int64).int64_value(&[]);

            let (_, indices) = logits.topk(top_k, -1, true, true);
            topk += indices.eq_tensor(&labels.unsqueeze(-1)).sum(Kind::Int64).int64_value(&[]);

            let labels = Vec::<i64>::try_from(&labels.to_device(Device::Cpu))?;
            let hits = Vec::<bool>::try_from(&hits.to_device(Device::Cpu))?;
            for (label, hit) in labels.into_iter().zip(hits) {
                let label = label as usize;
                total[label] += 1;
                if hit {
                    correct[label] += 1;
                }
            }
        }
    }

    let supervised = mode == TrainingMode::Supervised;
    let fraction = |hits: i64| supervised.then(|| hits as f64 / samples as f64);
    let per_class = if supervised {
        dataset
            .class_names
            .iter()
            .zip(correct.iter().zip(&total))
            .map(|(name, (&correct, &total))| ClassAccuracy {
                name: name.clone(),
                correct,
                total,
                accuracy: if total > 0 { correct as f64 / total as f64 } else { 0.0 },
            })
            .collect()
    } else {
        Vec::new()
    };

    Ok(EvalReport {
        mode,
        checkpoint: None,
        samples,
        loss: loss_sum / samples as f64,
        top1: fraction(top1),
        top5: fraction(topk),
        top_k: top_k as usize,
        per_class,
    })
}

/// A model restored from a checkpoint, ready for evaluation.
pub struct Evaluator {
    config: ExperimentConfig,
    network: Network,
    weights: PathBuf,
    device: Device,
    // Owns the variables the network reads from.
    _vs: nn::VarStore,
}

impl Evaluator {
    /// `path` is a weights file or a checkpoint directory; `config.json`
    /// must sit next to the weights.
    pub fn from_checkpoint<P: AsRef<Path>>(path: P, device: Device) -> Result<Self> {
        let (weights, manager) = CheckpointManager::resolve(path)?;
        let config = manager.load_config()?;

        let vs = nn::VarStore::new(device);
        let mut network = Network::build(&vs, &config)?;
        let report = network.load_weights(&vs, &weights)?;
        log::info!("Loaded {} tensors from {:?}", report.loaded.len(), weights);

        Ok(Self {
            config,
            network,
            weights,
            device,
            _vs: vs,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn weights(&self) -> &Path {
        &self.weights
    }

    pub fn evaluate(&mut self, dataset: &ImageDataset, batch_size: i64) -> Result<EvalReport> {
        let model = &self.config.model;
        ensure!(
            dataset.channels() == model.channels,
            "The checkpoint expects {} channels but the data has {}",
            model.channels,
            dataset.channels()
        );
        if self.network.mode() == TrainingMode::Supervised {
            model
                .validate_image_size(dataset.image_size())
                .with_context(|| format!("{}px images do not fit the checkpoint's model", dataset.image_size()))?;
            ensure!(
                dataset.num_classes == self.config.model.num_classes,
                "The checkpoint predicts {} classes but the data has {}",
                self.config.model.num_classes,
                dataset.num_classes
            );
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut report = evaluate_network(&mut self.network, dataset, batch_size, self.device, &mut rng)?;
        report.checkpoint = Some(self.weights.display().to_string());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_lists_metrics_and_classes() {
        let report = EvalReport {
            mode: TrainingMode::Supervised,
            checkpoint: Some("best_model.safetensors".to_string()),
            samples: 4,
            loss: 0.6931,
            top1: Some(0.5),
            top5: Some(1.0),
            top_k: 2,
            per_class: vec![
                ClassAccuracy {
                    name: "cat".to_string(),
                    correct: 2,
                    total: 2,
                    accuracy: 1.0,
                },
                ClassAccuracy {
                    name: "dog".to_string(),
                    correct: 0,
                    total: 2,
                    accuracy: 0.0,
                },
            ],
        };
        let markdown = report.to_markdown();
        assert!(markdown.contains("| Top-1 | 50.00% |"));
        assert!(markdown.contains("| Top-2 | 100.00% |"));
        assert!(markdown.contains("| cat | 2 | 2 | 100.00% |"));
        assert!(markdown.contains("| Loss | 0.6931 |"));
    }

    #[test]
    fn self_supervised_report_has_no_accuracy_rows() {
        let report = EvalReport {
            mode: TrainingMode::SelfSupervised,
            checkpoint: None,
            samples: 8,
            loss: 3.2,
            top1: None,
            top5: None,
            top_k: 5,
            per_class: Vec::new(),
        };
        let markdown = report.to_markdown();
        assert!(markdown.contains("| Mode | self_supervised |"));
        assert!(!markdown.contains("Top-"));
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Evaluator::from_checkpoint(dir.path(), Device::Cpu).is_err());
        assert!(Evaluator::from_checkpoint(dir.path().join("nope"), Device::Cpu).is_err());
    }
}
