// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores model weights using Burn's CompactRecorder.
//
// Only the best model (highest dev score) is kept:
//
//   <model_dir>/
//     best_model.mpk       ← weights of the best epoch
//     best.json            ← {"epoch": 7, "dev_score": 0.9112}
//     train_config.json    ← every hyperparameter of the run
//     alphabets.json       ← written by AlphabetStore
//     metrics.csv          ← written by MetricsLogger
//
// The config is what lets `decode` rebuild the exact same
// architecture before loading weights into it; CompactRecorder
// refuses records that do not match the module tree.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};

use crate::application::train_use_case::TrainConfig;
use crate::ml::model::TaggerModel;

const BEST_MODEL: &str = "best_model";
const BEST_META:  &str = "best.json";
const CONFIG:     &str = "train_config.json";

/// Which epoch produced the saved weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestCheckpoint {
    pub epoch:     usize,
    pub dev_score: f64,
}

/// Manages saving and loading of model checkpoints.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Creates the directory if it doesn't already exist.
    pub fn new(dir: impl Into<String>) -> Result<Self> {
        let dir = PathBuf::from(dir.into());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create model directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    /// Overwrite the best-model weights and record which epoch they
    /// came from.
    pub fn save_best<B: Backend>(&self, model: &TaggerModel<B>, best: BestCheckpoint) -> Result<()> {
        let path = self.dir.join(BEST_MODEL);

        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;

        let meta = self.dir.join(BEST_META);
        fs::write(&meta, serde_json::to_string(&best)?)
            .with_context(|| format!("Failed to write '{}'", meta.display()))?;

        tracing::debug!("Saved best checkpoint: epoch {} (dev {:.4})", best.epoch, best.dev_score);
        Ok(())
    }

    /// Load the best weights into a freshly built model of the same
    /// architecture.
    pub fn load_best<B: Backend>(&self, model: TaggerModel<B>, device: &B::Device) -> Result<TaggerModel<B>> {
        let best = self.best()?;
        let path = self.dir.join(BEST_MODEL);

        tracing::info!("Loading checkpoint from epoch {} (dev {:.4})", best.epoch, best.dev_score);

        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!("Cannot load checkpoint '{}'. Have you trained the model first?", path.display())
            })?;

        Ok(model.load_record(record))
    }

    /// Metadata of the saved best model
    pub fn best(&self) -> Result<BestCheckpoint> {
        let path = self.dir.join(BEST_META);
        let s = fs::read_to_string(&path)
            .with_context(|| format!("Cannot find '{}'. Have you run 'train' first?", path.display()))?;
        Ok(serde_json::from_str(&s)?)
    }

    /// Save the training configuration to JSON.
    pub fn save_config(&self, cfg: &TrainConfig) -> Result<()> {
        let path = self.dir.join(CONFIG);
        let json = serde_json::to_string_pretty(cfg)?;

        fs::write(&path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;

        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    /// Load the training configuration saved by `train`.
    pub fn load_config(&self) -> Result<TrainConfig> {
        let path = self.dir.join(CONFIG);
        let json = fs::read_to_string(&path)
            .with_context(|| {
                format!(
                    "Cannot read config from '{}'. \
                     Make sure you have run 'train' before 'decode'.",
                    path.display()
                )
            })?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed config in '{}'", path.display()))
    }
}
