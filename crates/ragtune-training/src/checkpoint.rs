//! `checkpoint-<step>/` directories with adapter weights and trainer state.

use crate::error::{TrainingError, TrainingResult};
use crate::job::ResumeFrom;
use chrono::{DateTime, Utc};
use ragtune_models::{save_adapter, AdaptedModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub epoch: f64,
    pub loss: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
}

/// Loop position and history persisted with every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: u64,
    pub total_steps: u64,
    /// Zero-based epoch the next micro-batch belongs to.
    pub epoch: u32,
    /// Micro-batches of `epoch` already consumed.
    pub batches_in_epoch: u64,
    pub seed: u64,
    #[serde(default)]
    pub log_history: Vec<LogEntry>,
    pub saved_at: DateTime<Utc>,
}

impl TrainerState {
    #[must_use]
    pub fn new(total_steps: u64, seed: u64) -> Self {
        Self {
            global_step: 0,
            total_steps,
            epoch: 0,
            batches_in_epoch: 0,
            seed,
            log_history: Vec::new(),
            saved_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn last_loss(&self) -> Option<f64> {
        self.log_history.last().map(|e| e.loss)
    }

    pub fn read(checkpoint_dir: &Path) -> TrainingResult<Self> {
        let path = checkpoint_dir.join(TRAINER_STATE_FILE);
        let bytes = std::fs::read(&path).map_err(|e| {
            TrainingError::Trainer(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Writes, lists and rotates checkpoints under one output directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    output_dir: PathBuf,
    /// `0` disables rotation.
    save_total_limit: usize,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(output_dir: PathBuf, save_total_limit: usize) -> Self {
        Self { output_dir, save_total_limit }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    #[must_use]
    pub fn checkpoint_dir(&self, step: u64) -> PathBuf {
        self.output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
    }

    /// Persist adapter weights plus `state`, then enforce the retention limit.
    pub fn save(&self, model: &AdaptedModel, state: &TrainerState) -> TrainingResult<PathBuf> {
        let dir = self.checkpoint_dir(state.global_step);
        save_adapter(model, &dir)?;

        let mut state = state.clone();
        state.saved_at = Utc::now();
        std::fs::write(dir.join(TRAINER_STATE_FILE), serde_json::to_vec_pretty(&state)?)?;
        info!(step = state.global_step, dir = %dir.display(), "checkpoint saved");

        self.rotate()?;
        Ok(dir)
    }

    /// Checkpoints in the output directory, oldest first.
    pub fn list(&self) -> TrainingResult<Vec<(u64, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse::<u64>().ok()?;
                Some((step, entry.path()))
            })
            .collect();
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    pub fn latest(&self) -> TrainingResult<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    /// Delete the oldest checkpoints beyond `save_total_limit`.
    pub fn rotate(&self) -> TrainingResult<()> {
        let limit = self.save_total_limit;
        if limit == 0 {
            return Ok(());
        }
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(limit);
        for (step, path) in checkpoints.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!(step, error = %e, "failed to remove old checkpoint");
            } else {
                debug!(step, "removed old checkpoint");
            }
        }
        Ok(())
    }

    /// Map a resume request onto a checkpoint directory.
    pub fn resolve(&self, resume: &ResumeFrom) -> TrainingResult<Option<PathBuf>> {
        match resume {
            ResumeFrom::None => Ok(None),
            ResumeFrom::Latest => self.latest()?.map(Some).ok_or_else(|| {
                TrainingError::Trainer(format!(
                    "resume requested but no checkpoint exists in {}",
                    self.output_dir.display()
                ))
            }),
            ResumeFrom::Path(path) => {
                if path.join(TRAINER_STATE_FILE).exists() {
                    Ok(Some(path.clone()))
                } else {
                    Err(TrainingError::Trainer(format!(
                        "{} is not a checkpoint directory",
                        path.display()
                    )))
                }
            }
        }
    }
}
