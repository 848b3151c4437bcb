use anyhow::{ensure, Context, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::path::Path;
use tch::{nn, nn::ModuleT, Tensor};

use playground_core::safetensors_util::{self, LoadOptions, LoadReport};
use playground_core::{EsVitLearner, MaxVit};

use crate::config::ExperimentConfig;
use crate::TrainingMode;

/// Weight-file prefix of the EMA teacher in self-supervised checkpoints.
pub const TEACHER_PREFIX: &str = "teacher.";
/// Where the backbone lives inside a self-supervised checkpoint.
pub const PRETRAINED_BACKBONE_PREFIX: &str = "student.net.";

/// Loss of one batch, plus the logits when the network is a classifier.
pub struct StepOutput {
    pub loss: Tensor,
    pub logits: Option<Tensor>,
}

/// The model being trained. Variables live in the caller's `VarStore`;
/// the self-supervised teacher keeps its own store.
#[derive(Debug)]
pub enum Network {
    Supervised(MaxVit),
    SelfSupervised(Box<EsVitLearner<MaxVit>>),
}

impl Network {
    pub fn build(vs: &nn::VarStore, config: &ExperimentConfig) -> Result<Self> {
        let network = match config.mode() {
            TrainingMode::Supervised => {
                Network::Supervised(MaxVit::new(&vs.root(), &config.model).context("Failed to build MaxViT")?)
            }
            TrainingMode::SelfSupervised => {
                let es_vit = config
                    .es_vit
                    .as_ref()
                    .context("self_supervised mode needs an es_vit section")?;
                let model = &config.model;
                let learner = EsVitLearner::new(vs, es_vit, |path| MaxVit::new(path, model))
                    .context("Failed to build the EsViT learner")?;
                Network::SelfSupervised(Box::new(learner))
            }
        };
        Ok(network)
    }

    pub fn mode(&self) -> TrainingMode {
        match self {
            Network::Supervised(_) => TrainingMode::Supervised,
            Network::SelfSupervised(_) => TrainingMode::SelfSupervised,
        }
    }

    pub fn forward_loss(
        &mut self,
        images: &Tensor,
        labels: &Tensor,
        rng: &mut dyn RngCore,
        train: bool,
    ) -> StepOutput {
        match self {
            Network::Supervised(model) => {
                let logits = model.forward_t(images, train);
                StepOutput {
                    loss: logits.cross_entropy_for_logits(labels),
                    logits: Some(logits),
                }
            }
            Network::SelfSupervised(learner) => StepOutput {
                loss: learner.loss(images, rng, train),
                logits: None,
            },
        }
    }

    /// Called after every optimizer step.
    pub fn after_step(&mut self) {
        if let Network::SelfSupervised(learner) = self {
            learner.update_moving_average();
        }
    }

    /// Everything a checkpoint must hold: the trainable store plus the
    /// teacher under [`TEACHER_PREFIX`].
    pub fn named_tensors(&self, vs: &nn::VarStore) -> HashMap<String, Tensor> {
        let mut tensors = vs.variables();
        if let Network::SelfSupervised(learner) = self {
            for (name, tensor) in learner.teacher_store().variables() {
                tensors.insert(format!("{}{}", TEACHER_PREFIX, name), tensor);
            }
        }
        tensors
    }

    /// Restores a checkpoint written from [`Network::named_tensors`].
    pub fn load_weights<P: AsRef<Path>>(&mut self, vs: &nn::VarStore, path: P) -> Result<LoadReport> {
        let path = path.as_ref();
        let mut variables = vs.variables();
        let report = safetensors_util::load_into(
            &mut variables,
            path,
            &LoadOptions::strict().ignoring(TEACHER_PREFIX),
        )
        .with_context(|| format!("Failed to load weights from {:?}", path))?;

        if let Network::SelfSupervised(learner) = self {
            let mut teacher = learner.teacher_store().variables();
            let options = LoadOptions {
                strict: true,
                ..LoadOptions::with_prefix(TEACHER_PREFIX)
            };
            safetensors_util::load_into(&mut teacher, path, &options)
                .with_context(|| format!("Failed to load teacher weights from {:?}", path))?;
        }

        if !report.unexpected.is_empty() {
            log::warn!("{} unexpected tensors in {:?}", report.unexpected.len(), path);
        }
        Ok(report)
    }

    /// Initialises a classifier's backbone from a self-supervised
    /// checkpoint. The classification head keeps its fresh weights.
    pub fn load_pretrained<P: AsRef<Path>>(&mut self, vs: &nn::VarStore, path: P) -> Result<LoadReport> {
        let path = path.as_ref();
        let mut variables = vs.variables();
        let options =
            LoadOptions::with_prefix(PRETRAINED_BACKBONE_PREFIX).ignoring(format!("{}head", PRETRAINED_BACKBONE_PREFIX));
        let report = safetensors_util::load_into(&mut variables, path, &options)
            .with_context(|| format!("Failed to load pretrained backbone from {:?}", path))?;

        let absent: Vec<&String> = report.missing.iter().filter(|name| !name.starts_with("head")).collect();
        ensure!(
            absent.is_empty(),
            "{:?} is not a self-supervised checkpoint for this backbone: {} of its variables are missing (first: {})",
            path,
            absent.len(),
            absent[0]
        );

        log::info!(
            "Initialised {} tensors from {:?}; {} left at their initial values",
            report.loaded.len(),
            path,
            report.missing.len()
        );
        for name in &report.missing {
            log::debug!("Not in pretrained checkpoint: {}", name);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playground_core::{EsVitConfig, MaxVitConfig};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::{Device, Kind};

    fn tiny(mode: TrainingMode) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.model = MaxVitConfig {
            num_classes: 3,
            dim: 8,
            depth: vec![1],
            dim_head: 4,
            window_size: 2,
            mbconv_expansion_rate: 1.0,
            dropout: 0.0,
            num_register_tokens: 1,
            ..Default::default()
        };
        config.data.image_size = 8;
        config.trainer.mode = mode;
        if mode == TrainingMode::SelfSupervised {
            config.es_vit = Some(EsVitConfig {
                image_size: 8,
                projection_hidden_size: 8,
                num_classes_k: 6,
                projection_layers: 2,
                ..Default::default()
            });
        }
        config
    }

    #[test]
    fn supervised_loss_comes_with_logits() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut network = Network::build(&vs, &tiny(TrainingMode::Supervised)).unwrap();
        let images = Tensor::rand([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let labels = Tensor::from_slice(&[0i64, 2]);
        let out = network.forward_loss(&images, &labels, &mut StdRng::seed_from_u64(0), false);
        assert_eq!(out.logits.unwrap().size(), vec![2, 3]);
        assert!(out.loss.double_value(&[]).is_finite());
    }

    #[test]
    fn self_supervised_checkpoint_restores_student_and_teacher() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssl.safetensors");
        let config = tiny(TrainingMode::SelfSupervised);

        let vs = nn::VarStore::new(Device::Cpu);
        let network = Network::build(&vs, &config).unwrap();
        let tensors = network.named_tensors(&vs);
        assert!(tensors.keys().any(|k| k.starts_with(TEACHER_PREFIX)));
        assert!(tensors.contains_key("teacher_view_centers"));
        safetensors_util::save_tensors(&tensors, &path, &HashMap::new()).unwrap();

        let other = nn::VarStore::new(Device::Cpu);
        let mut restored = Network::build(&other, &config).unwrap();
        let report = restored.load_weights(&other, &path).unwrap();
        assert!(report.missing.is_empty());
        assert!(report.unexpected.is_empty());

        let restored_tensors = restored.named_tensors(&other);
        for (name, tensor) in &tensors {
            assert!(tensor.equal(&restored_tensors[name]), "{} differs", name);
        }
    }

    #[test]
    fn classifier_starts_from_pretrained_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssl.safetensors");

        let ssl_vs = nn::VarStore::new(Device::Cpu);
        let ssl = Network::build(&ssl_vs, &tiny(TrainingMode::SelfSupervised)).unwrap();
        safetensors_util::save_tensors(&ssl.named_tensors(&ssl_vs), &path, &HashMap::new()).unwrap();

        let mut config = tiny(TrainingMode::Supervised);
        config.model.num_classes = 5;
        let vs = nn::VarStore::new(Device::Cpu);
        let mut classifier = Network::build(&vs, &config).unwrap();
        let report = classifier.load_pretrained(&vs, &path).unwrap();

        assert!(report.missing.iter().all(|name| name.starts_with("head")));
        assert!(report.loaded.contains(&"conv_stem.0.weight".to_string()));
        let ssl_vars = ssl_vs.variables();
        assert!(vs.variables()["conv_stem.0.weight"].equal(&ssl_vars["student.net.conv_stem.0.weight"]));
    }

    #[test]
    fn supervised_checkpoint_is_not_a_pretrained_backbone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supervised.safetensors");
        let config = tiny(TrainingMode::Supervised);

        let source_vs = nn::VarStore::new(Device::Cpu);
        let source = Network::build(&source_vs, &config).unwrap();
        safetensors_util::save_tensors(&source.named_tensors(&source_vs), &path, &HashMap::new()).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let mut classifier = Network::build(&vs, &config).unwrap();
        let err = classifier.load_pretrained(&vs, &path).unwrap_err();
        assert!(format!("{:#}", err).contains("not a self-supervised checkpoint"));
    }
}
