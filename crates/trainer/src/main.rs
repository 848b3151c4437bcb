use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tch::Device;

use trainer::{ExperimentConfig, ImageDataset, Trainer};

#[derive(Parser)]
#[command(author, version, about = "Train a MaxViT classifier or an EsViT self-supervised learner")]
struct Cli {
    /// Experiment config (.yaml, .yml or .json)
    #[arg(short, long, default_value = "configs/supervised_cifar10.yaml")]
    config: PathBuf,

    /// Checkpoint file or directory to resume from
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Train on the CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,

    /// Override trainer.epochs
    #[arg(long)]
    epochs: Option<usize>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = ExperimentConfig::from_file(&cli.config)?;
    if let Some(epochs) = cli.epochs {
        config.trainer.epochs = epochs;
    }
    config
        .validate()
        .with_context(|| format!("Invalid config {:?}", cli.config))?;

    tch::manual_seed(config.seed as i64);
    let device = if cli.cpu { Device::Cpu } else { Device::cuda_if_available() };
    log::info!("Using device: {:?}", device);

    let dataset = ImageDataset::load(&config.data, config.seed)?;
    let mut trainer = Trainer::new(config, device)?;
    if let Some(resume) = &cli.resume {
        trainer.resume(resume)?;
    }

    let summary = trainer.train(&dataset)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    log::info!("Training complete!");

    Ok(())
}
