use anyhow::{bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tch::{nn, nn::OptimizerConfig, Device, Tensor};

use playground_core::{safetensors_util, Augment};

use crate::checkpoint::{CheckpointKind, CheckpointManager, TrainingState};
use crate::config::ExperimentConfig;
use crate::dataset::ImageDataset;
use crate::evaluate::evaluate_network;
use crate::metrics::{EpochMetrics, MultiTracker, Tracker};
use crate::network::Network;
use crate::schedule::LrSchedule;
use crate::TrainingMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub steps: usize,
    pub best_val_loss: Option<f64>,
    pub best_epoch: Option<usize>,
    pub final_metrics: Option<EpochMetrics>,
}

pub struct Trainer {
    config: ExperimentConfig,
    network: Network,
    optimizer: nn::Optimizer,
    device: Device,
    vs: nn::VarStore,
    checkpoints: CheckpointManager,
    tracker: MultiTracker,
    augment: Augment,
    rng: StdRng,
    state: TrainingState,
}

/// Rescales the defined gradients so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
fn clip_grad_norm(vs: &nn::VarStore, max_norm: f64) -> f64 {
    tch::no_grad(|| {
        let grads: Vec<Tensor> = vs
            .trainable_variables()
            .iter()
            .map(|var| var.grad())
            .filter(|grad| grad.defined())
            .collect();
        if grads.is_empty() {
            return 0.0;
        }
        let norms: Vec<Tensor> = grads.iter().map(|grad| grad.norm()).collect();
        let total = Tensor::stack(&norms, 0).norm().double_value(&[]);
        if total > max_norm {
            let scale = max_norm / (total + 1e-6);
            for mut grad in grads {
                let _ = grad.g_mul_scalar_(scale);
            }
        }
        total
    })
}

impl Trainer {
    pub fn new(config: ExperimentConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let vs = nn::VarStore::new(device);
        let mut network = Network::build(&vs, &config)?;
        if let Some(pretrained) = &config.trainer.pretrained {
            network.load_pretrained(&vs, pretrained)?;
        }

        let optimizer = nn::AdamW {
            wd: config.trainer.weight_decay.unwrap_or(0.0),
            ..Default::default()
        }
        .build(&vs, config.trainer.learning_rate)?;

        let checkpoints = CheckpointManager::new(&config.trainer.checkpoint_dir)?;
        checkpoints.save_config(&config)?;
        let tracker = MultiTracker::from_config(&config.tracking, checkpoints.dir())?;

        log::info!(
            "Built {} network with {} trainable tensors on {:?}",
            network.mode(),
            vs.trainable_variables().len(),
            device
        );

        Ok(Self {
            augment: config.data.augmentation(),
            rng: StdRng::seed_from_u64(config.seed),
            config,
            network,
            optimizer,
            device,
            vs,
            checkpoints,
            tracker,
            state: TrainingState::default(),
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Restores weights and progress from a weights file or checkpoint
    /// directory; training continues after the restored epoch. Optimizer
    /// moments are not checkpointed and restart from zero.
    pub fn resume<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let (weights, manager) = CheckpointManager::resolve(path)?;
        self.network.load_weights(&self.vs, &weights)?;

        let mut state = manager.load_state().unwrap_or_else(|err| {
            log::warn!("No training state next to {:?}: {:#}", weights, err);
            TrainingState::default()
        });
        let metadata = safetensors_util::read_metadata(&weights)?;
        if let Some(epoch) = metadata.get("epoch").and_then(|v| v.parse().ok()) {
            state.epoch = epoch;
        }
        if let Some(step) = metadata.get("step").and_then(|v| v.parse().ok()) {
            state.step = step;
        }

        log::info!("Resumed from {:?} at epoch {} (step {})", weights, state.epoch, state.step);
        self.state = state;
        Ok(())
    }

    pub fn train(&mut self, dataset: &ImageDataset) -> Result<TrainSummary> {
        let model = &self.config.model;
        ensure!(
            dataset.channels() == model.channels,
            "The data has {} channels but the model expects {}",
            dataset.channels(),
            model.channels
        );
        if self.network.mode() == TrainingMode::Supervised {
            ensure!(
                dataset.num_classes == model.num_classes,
                "The data has {} classes but model.num_classes is {}",
                dataset.num_classes,
                model.num_classes
            );
        }
        ensure!(dataset.train_len() > 0, "The training split is empty");

        let trainer = self.config.trainer.clone();
        let batch_size = trainer.batch_size as i64;
        let steps_per_epoch = ((dataset.train_len() + batch_size - 1) / batch_size) as usize;
        let schedule = LrSchedule::new(
            trainer.learning_rate,
            trainer.min_learning_rate,
            trainer.warmup_steps.unwrap_or(0),
            steps_per_epoch * trainer.epochs,
        );

        let first_epoch = self.state.epoch + 1;
        if first_epoch > trainer.epochs {
            log::warn!("Nothing to do: epoch {} of {} already completed", self.state.epoch, trainer.epochs);
        }
        log::info!(
            "Training {} for epochs {}..={} ({} steps per epoch)",
            self.config.name,
            first_epoch,
            trainer.epochs,
            steps_per_epoch
        );

        let mut last_metrics = None;
        for epoch in first_epoch..=trainer.epochs {
            let started = Instant::now();
            let mut loss_sum = 0.0;
            let mut seen = 0i64;
            let mut lr = schedule.lr_at(self.state.step);

            for (images, labels) in dataset.train_iter(batch_size, true, self.device) {
                lr = schedule.lr_at(self.state.step);
                self.optimizer.set_lr(lr);

                let images = if self.network.mode() == TrainingMode::Supervised && !self.augment.is_empty() {
                    self.augment.apply(&images, &mut self.rng)
                } else {
                    images
                };
                let loss = self.network.forward_loss(&images, &labels, &mut self.rng, true).loss;
                let loss_value = loss.double_value(&[]);
                if !loss_value.is_finite() {
                    bail!("Loss became {} at epoch {} step {}", loss_value, epoch, self.state.step);
                }

                self.optimizer.zero_grad();
                loss.backward();
                if let Some(max_norm) = trainer.grad_clip {
                    let norm = clip_grad_norm(&self.vs, max_norm);
                    log::debug!("step {} grad norm {:.4}", self.state.step, norm);
                }
                self.optimizer.step();
                self.network.after_step();

                let batch = images.size()[0];
                loss_sum += loss_value * batch as f64;
                seen += batch;
                self.state.step += 1;

                if self.state.step % trainer.log_every == 0 {
                    log::info!(
                        "Epoch {} | Step {} | Loss: {:.4} | LR: {:.2e}",
                        epoch,
                        self.state.step,
                        loss_value,
                        lr
                    );
                    self.tracker.log_step(self.state.step, "train_loss", loss_value)?;
                    self.tracker.log_step(self.state.step, "learning_rate", lr)?;
                }
            }

            let validate = dataset.val_len() > 0 && (epoch % trainer.eval_every == 0 || epoch == trainer.epochs);
            let report = if validate {
                Some(evaluate_network(
                    &mut self.network,
                    dataset,
                    batch_size,
                    self.device,
                    &mut self.rng,
                )?)
            } else {
                None
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss: loss_sum / seen.max(1) as f64,
                val_loss: report.as_ref().map(|r| r.loss),
                val_accuracy: report.as_ref().and_then(|r| r.top1),
                learning_rate: lr,
                elapsed_secs: started.elapsed().as_secs_f64(),
            };
            match (metrics.val_loss, metrics.val_accuracy) {
                (Some(val_loss), Some(accuracy)) => log::info!(
                    "Epoch {} | Train Loss: {:.4} | Val Loss: {:.4} | Val Acc: {:.2}%",
                    epoch,
                    metrics.train_loss,
                    val_loss,
                    accuracy * 100.0
                ),
                (Some(val_loss), None) => log::info!(
                    "Epoch {} | Train Loss: {:.4} | Val Loss: {:.4}",
                    epoch,
                    metrics.train_loss,
                    val_loss
                ),
                _ => log::info!("Epoch {} | Train Loss: {:.4}", epoch, metrics.train_loss),
            }
            self.tracker.log_epoch(&metrics)?;

            self.state.epoch = epoch;
            if metrics.is_improvement(self.state.best_val_loss.unwrap_or(f64::INFINITY)) {
                self.state.best_val_loss = metrics.val_loss;
                self.state.best_epoch = Some(epoch);
                self.save(CheckpointKind::Best)?;
            }
            if epoch % trainer.save_every == 0 || epoch == trainer.epochs {
                self.save(CheckpointKind::Epoch(epoch))?;
            } else {
                self.checkpoints.save_state(&self.state)?;
            }
            last_metrics = Some(metrics);
        }
        self.tracker.finish()?;

        Ok(TrainSummary {
            epochs_run: trainer.epochs.saturating_sub(first_epoch - 1),
            steps: self.state.step,
            best_val_loss: self.state.best_val_loss,
            best_epoch: self.state.best_epoch,
            final_metrics: last_metrics,
        })
    }

    fn save(&self, kind: CheckpointKind) -> Result<()> {
        let tensors = self.network.named_tensors(&self.vs);
        self.checkpoints
            .save(&tensors, &self.state, kind)
            .with_context(|| format!("Failed to write {}", kind.file_name()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn clipping_bounds_the_global_norm() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var("w", &[4], nn::Init::Const(1.0));
        let unused = vs.root().var("unused", &[2], nn::Init::Const(1.0));
        let loss = (&w * 10.0).sum(Kind::Float);
        loss.backward();
        assert!(!unused.grad().defined());

        let before = clip_grad_norm(&vs, 1.0);
        assert!((before - 20.0).abs() < 1e-4);
        let after = w.grad().norm().double_value(&[]);
        assert!((after - 1.0).abs() < 1e-4);
        assert!(clip_grad_norm(&vs, 5.0) < 5.0);
    }
}
