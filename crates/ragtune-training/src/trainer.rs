use crate::error::TrainingResult;
use crate::job::ResumeFrom;
use crate::progress::ProgressSink;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerStatus {
    Idle,
    Preparing,
    Running,
    Finished,
    Failed(String),
    Cancelled,
}

/// Result of one `train()` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub status: TrainerStatus,
    pub global_step: u64,
    pub total_steps: u64,
    /// Mean loss over the steps run by this call.
    pub train_loss: Option<f64>,
    pub last_checkpoint: Option<PathBuf>,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Run the configured epochs, optionally continuing from a checkpoint.
    async fn train(&self, resume: &ResumeFrom, progress: &dyn ProgressSink) -> TrainingResult<TrainOutcome>;

    /// Persist the trainable (adapter) weights into `dir`, returning the written files.
    async fn save_model(&self, dir: &Path) -> TrainingResult<Vec<PathBuf>>;

    async fn status(&self) -> TrainingResult<TrainerStatus>;

    /// Ask a running `train()` to stop after the current micro-batch.
    async fn cancel(&self) -> TrainingResult<()>;
}
