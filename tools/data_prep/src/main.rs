use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// Split an `input/<class>/*` image folder into `train/` and `val/`.
#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    input: PathBuf,
    #[arg(short, long)]
    output_dir: PathBuf,
    #[arg(long, default_value_t = 0.1)]
    val_fraction: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// Number of validation files for a class of `total` files. Classes with at
/// least two files keep one in each split.
fn val_count(total: usize, fraction: f64) -> usize {
    let n = (total as f64 * fraction).round() as usize;
    if total >= 2 {
        n.clamp(1, total - 1)
    } else {
        0
    }
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {:?}", dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| if want_dirs { path.is_dir() } else { path.is_file() })
        .collect();
    entries.sort();
    Ok(entries)
}

fn copy_all(files: &[PathBuf], dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    for file in files {
        if let Some(name) = file.file_name() {
            fs::copy(file, dest.join(name)).with_context(|| format!("Failed to copy {:?}", file))?;
        }
    }
    Ok(())
}

/// Returns `(train, val)` file counts.
fn split(cli: &Cli) -> Result<(usize, usize)> {
    ensure!(
        (0.0..1.0).contains(&cli.val_fraction),
        "--val-fraction must lie in [0, 1), got {}",
        cli.val_fraction
    );
    let classes = sorted_entries(&cli.input, true)?;
    ensure!(!classes.is_empty(), "No class directories in {:?}", cli.input);

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let (mut n_train, mut n_val) = (0, 0);
    for class_dir in classes {
        let Some(class) = class_dir.file_name() else { continue };
        let mut files = sorted_entries(&class_dir, false)?;
        files.shuffle(&mut rng);

        let count = if cli.val_fraction > 0.0 { val_count(files.len(), cli.val_fraction) } else { 0 };
        let train = files.split_off(count);
        copy_all(&train, &cli.output_dir.join("train").join(class))?;
        copy_all(&files, &cli.output_dir.join("val").join(class))?;

        println!("{:?}: {} train, {} val", class, train.len(), files.len());
        n_train += train.len();
        n_val += files.len();
    }
    Ok((n_train, n_val))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let (train, val) = split(&cli)?;
    println!("Done. Wrote {} training and {} validation files to {:?}.", train, val, cli.output_dir);
    Ok(())
}
