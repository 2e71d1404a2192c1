//! Ragtune Training
//!
//! QLoRA instruction fine-tuning for context-grounded QA:
//! - Loading and category-filtering instruction datasets (`load_dataset`)
//! - Rendering records with the context/question/response template
//! - Describing jobs as `ragtune.toml` files (`TrainingJobSpec`)
//! - Packing sequences and running the SFT loop behind a `StepBackend` (candle by default)
//! - Checkpoint rotation, resume, manifests and run discovery

pub mod artifacts;
pub mod backend;
pub mod candle_backend;
pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod job;
pub mod layout;
pub mod loader;
pub mod packing;
pub mod pipeline;
pub mod progress;
pub mod prompt;
pub mod registry;
pub mod schedule;
pub mod sft;
pub mod trainer;

#[cfg(test)]
pub(crate) mod test_support;

pub use artifacts::{ArtifactKind, RunStatus, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use backend::{DryRunBackend, OptimizerUpdate, StepBackend};
pub use candle_backend::CandleBackend;
pub use checkpoint::{CheckpointManager, LogEntry, TrainerState};
pub use dataset::{Category, Dataset, DatasetId, DatasetSource, QaRecord, RawRecord, DOLLY_DATASET_ID};
pub use error::{TrainingError, TrainingResult};
pub use job::{
    BackendKind, DatasetSpec, LrSchedulerKind, ModelSpec, OptimizerKind, ResumeFrom, SftConfig, TrainingConfig, TrainingJobId,
    TrainingJobSpec,
};
pub use layout::TrainingLayout;
pub use loader::{load_dataset, load_local_dataset, read_jsonl, write_jsonl, LoadOptions, LoadStats, LoadedDataset};
pub use packing::{build_sequences, TrainingSequence, IGNORE_INDEX};
pub use pipeline::{FineTunePipeline, PipelineOutcome};
pub use progress::{JsonProgressSink, ProgressEvent, ProgressSink, StdoutProgressSink, TracingProgressSink};
pub use prompt::{format_prompt, ContextQaFormatter, PromptFormatter};
pub use registry::{discover_runs, RunEntry};
pub use schedule::LrSchedule;
pub use sft::{SftDataset, SftTrainer};
pub use trainer::{TrainOutcome, Trainer, TrainerStatus};
