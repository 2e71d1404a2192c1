//! Forward/backward and optimizer execution, kept outside the training loop.

use crate::error::TrainingResult;
use crate::job::OptimizerKind;
use crate::packing::TrainingSequence;
use ragtune_models::AdaptedModel;
use std::path::Path;

/// Parameters of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerUpdate {
    /// One-based step being applied.
    pub step: u64,
    pub learning_rate: f64,
    pub max_grad_norm: f64,
    pub optimizer: OptimizerKind,
    /// Micro-batches accumulated since the previous step.
    pub accumulated: usize,
}

/// Executes the numeric side of a training step.
///
/// `accumulate` runs forward and backward for one micro-batch and keeps the
/// gradients; `apply` clips, updates the trainable parameters, and clears
/// them. Errors are propagated by the trainer unchanged.
pub trait StepBackend: Send {
    fn id(&self) -> &'static str;

    /// Returns the mean loss over the micro-batch.
    fn accumulate(&mut self, model: &AdaptedModel, batch: &[&TrainingSequence]) -> TrainingResult<f64>;

    /// Returns the gradient norm before clipping.
    fn apply(&mut self, model: &mut AdaptedModel, update: &OptimizerUpdate) -> TrainingResult<f64>;

    /// Persist optimizer state next to a checkpoint.
    fn save_state(&self, _checkpoint_dir: &Path) -> TrainingResult<()> {
        Ok(())
    }

    /// Restore optimizer state from a checkpoint.
    fn load_state(&mut self, _checkpoint_dir: &Path) -> TrainingResult<()> {
        Ok(())
    }
}

/// Walks the schedule without touching weights.
///
/// The reported loss is the cross-entropy of a uniform distribution over the
/// vocabulary, i.e. what an untrained model would score.
#[derive(Debug, Clone)]
pub struct DryRunBackend {
    uniform_loss: f64,
    tokens_seen: u64,
}

impl DryRunBackend {
    #[must_use]
    pub fn new(vocab_size: usize) -> Self {
        Self { uniform_loss: (vocab_size.max(1) as f64).ln(), tokens_seen: 0 }
    }

    #[must_use]
    pub fn tokens_seen(&self) -> u64 {
        self.tokens_seen
    }
}

impl StepBackend for DryRunBackend {
    fn id(&self) -> &'static str {
        "dry-run"
    }

    fn accumulate(&mut self, _model: &AdaptedModel, batch: &[&TrainingSequence]) -> TrainingResult<f64> {
        self.tokens_seen += batch.iter().map(|s| s.num_label_tokens() as u64).sum::<u64>();
        Ok(self.uniform_loss)
    }

    fn apply(&mut self, _model: &mut AdaptedModel, _update: &OptimizerUpdate) -> TrainingResult<f64> {
        Ok(0.0)
    }
}
