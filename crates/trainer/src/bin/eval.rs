use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tch::Device;

use trainer::{Evaluator, ExperimentConfig, ImageDataset};

#[derive(Parser)]
#[command(author, version, about = "Evaluate a trained checkpoint on its validation split")]
struct Cli {
    /// Weights file or checkpoint directory
    #[arg(short, long)]
    model_checkpoint: PathBuf,

    /// Evaluate on the data section of this config instead of the checkpoint's
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = 64)]
    batch_size: i64,

    #[arg(long)]
    cpu: bool,

    /// Where to write the JSON report (default: eval_results.json next to the weights)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let device = if cli.cpu { Device::Cpu } else { Device::cuda_if_available() };
    let mut evaluator = Evaluator::from_checkpoint(&cli.model_checkpoint, device)
        .with_context(|| format!("Failed to restore {:?}", cli.model_checkpoint))?;

    let (data_config, seed) = match &cli.config {
        Some(path) => {
            let config = ExperimentConfig::from_file(path)?;
            (config.data, config.seed)
        }
        None => (evaluator.config().data.clone(), evaluator.config().seed),
    };
    tch::manual_seed(seed as i64);
    let dataset = ImageDataset::load(&data_config, seed)?;

    let report = evaluator.evaluate(&dataset, cli.batch_size)?;
    println!("{}", report.to_markdown());

    let output = match cli.output {
        Some(output) => output,
        None => evaluator
            .weights()
            .parent()
            .map(|dir| dir.join("eval_results.json"))
            .unwrap_or_else(|| PathBuf::from("eval_results.json")),
    };
    fs::write(&output, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed to write {:?}", output))?;
    log::info!("Saved results to {:?}", output);

    Ok(())
}
