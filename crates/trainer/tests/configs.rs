use std::path::PathBuf;

use trainer::{ExperimentConfig, TrainingMode};

fn shipped(name: &str) -> ExperimentConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../configs").join(name);
    ExperimentConfig::from_file(&path).unwrap()
}

#[test]
fn shipped_configs_are_valid() {
    for name in ["supervised_cifar10.yaml", "es_vit_pretrain.yaml", "synthetic_smoke.yaml"] {
        let config = shipped(name);
        config.validate().unwrap_or_else(|err| panic!("{}: {:#}", name, err));
    }
}

#[test]
fn pretraining_config_selects_self_supervised_mode() {
    let config = shipped("es_vit_pretrain.yaml");
    assert_eq!(config.mode(), TrainingMode::SelfSupervised);
    assert_eq!(config.es_vit.unwrap().num_classes_k, 4096);
}
