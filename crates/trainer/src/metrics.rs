use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::TrackingConfig;

/// One row of metrics for a finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Starts at 1.
    pub epoch: usize,
    pub train_loss: f64,
    /// `None` when validation was skipped this epoch.
    pub val_loss: Option<f64>,
    /// Top-1 accuracy in [0, 1]; supervised runs only.
    pub val_accuracy: Option<f64>,
    pub learning_rate: f64,
    pub elapsed_secs: f64,
}

impl EpochMetrics {
    pub fn is_improvement(&self, best_val_loss: f64) -> bool {
        matches!(self.val_loss, Some(loss) if loss < best_val_loss)
    }
}

/// Sink for training metrics.
pub trait Tracker {
    fn log_step(&mut self, step: usize, name: &str, value: f64) -> Result<()>;
    fn log_epoch(&mut self, metrics: &EpochMetrics) -> Result<()>;
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| format!("{:.6}", v)).unwrap_or_default()
}

/// Appends epoch rows to `metrics.csv`. Step events are not recorded.
pub struct CsvTracker {
    path: PathBuf,
}

impl CsvTracker {
    pub const HEADER: &'static str = "epoch,train_loss,val_loss,val_accuracy,learning_rate,elapsed_secs";

    /// Writes the header when the file does not exist yet.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join("metrics.csv");
        if !path.exists() {
            fs::write(&path, format!("{}\n", Self::HEADER))
                .with_context(|| format!("Failed to create {:?}", path))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Tracker for CsvTracker {
    fn log_step(&mut self, _step: usize, _name: &str, _value: f64) -> Result<()> {
        Ok(())
    }

    fn log_epoch(&mut self, m: &EpochMetrics) -> Result<()> {
        let mut file = append(&self.path)?;
        writeln!(
            file,
            "{},{:.6},{},{},{:.8},{:.2}",
            m.epoch,
            m.train_loss,
            optional(m.val_loss),
            optional(m.val_accuracy),
            m.learning_rate,
            m.elapsed_secs
        )?;
        Ok(())
    }
}

/// Appends one JSON object per event to `events.jsonl`.
pub struct JsonlTracker {
    file: File,
}

impl JsonlTracker {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let file = append(&dir.as_ref().join("events.jsonl"))?;
        Ok(Self { file })
    }

    fn write(&mut self, event: serde_json::Value) -> Result<()> {
        writeln!(self.file, "{}", event)?;
        Ok(())
    }
}

impl Tracker for JsonlTracker {
    fn log_step(&mut self, step: usize, name: &str, value: f64) -> Result<()> {
        self.write(json!({ "event": "step", "step": step, "name": name, "value": value }))
    }

    fn log_epoch(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let mut event = serde_json::to_value(metrics)?;
        event["event"] = json!("epoch");
        self.write(event)
    }

    fn finish(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

/// Fans every event out to all enabled trackers.
#[derive(Default)]
pub struct MultiTracker {
    trackers: Vec<Box<dyn Tracker>>,
}

impl MultiTracker {
    pub fn from_config<P: AsRef<Path>>(config: &TrackingConfig, dir: P) -> Result<Self> {
        let mut trackers: Vec<Box<dyn Tracker>> = Vec::new();
        if config.csv {
            trackers.push(Box::new(CsvTracker::new(dir.as_ref())?));
        }
        if config.jsonl {
            trackers.push(Box::new(JsonlTracker::new(dir.as_ref())?));
        }
        Ok(Self { trackers })
    }

    pub fn push(&mut self, tracker: Box<dyn Tracker>) {
        self.trackers.push(tracker);
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

impl Tracker for MultiTracker {
    fn log_step(&mut self, step: usize, name: &str, value: f64) -> Result<()> {
        for tracker in &mut self.trackers {
            tracker.log_step(step, name, value)?;
        }
        Ok(())
    }

    fn log_epoch(&mut self, metrics: &EpochMetrics) -> Result<()> {
        for tracker in &mut self.trackers {
            tracker.log_epoch(metrics)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        for tracker in &mut self.trackers {
            tracker.finish()?;
        }
        Ok(())
    }
}
