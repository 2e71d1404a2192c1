//! End-to-end driver: dataset, model, adapters, training, manifest.

use crate::artifacts::{make_artifact, write_json, ArtifactKind, RunStatus, TrainingManifest, TrainingMetrics};
use crate::backend::{DryRunBackend, StepBackend};
use crate::candle_backend::CandleBackend;
use crate::error::TrainingResult;
use crate::job::{BackendKind, ResumeFrom, TrainingJobSpec};
use crate::layout::TrainingLayout;
use crate::loader::{load_dataset, write_jsonl, LoadedDataset};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::prompt::ContextQaFormatter;
use crate::sft::{SftDataset, SftTrainer};
use crate::trainer::{TrainOutcome, Trainer, TrainerStatus};
use chrono::Utc;
use ragtune_models::{AdapterInjector, HubClient, ModelProvisioner, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct PipelineOutcome {
    pub manifest: TrainingManifest,
    pub manifest_path: PathBuf,
    pub train: TrainOutcome,
}

/// Runs one fine-tuning job from its spec.
pub struct FineTunePipeline {
    job: TrainingJobSpec,
    hub: HubClient,
    backend: Option<Box<dyn StepBackend>>,
    cancel: Arc<AtomicBool>,
}

impl FineTunePipeline {
    #[must_use]
    pub fn new(job: TrainingJobSpec, hub: HubClient) -> Self {
        Self { job, hub, backend: None, cancel: Arc::new(AtomicBool::new(false)) }
    }

    /// Use `backend` for the numeric steps instead of the one `training.backend` names.
    #[must_use]
    pub fn with_backend(mut self, backend: Box<dyn StepBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Setting this flag stops training at the next micro-batch with a checkpoint.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn job(&self) -> &TrainingJobSpec {
        &self.job
    }

    #[must_use]
    pub fn layout(&self) -> TrainingLayout {
        TrainingLayout::new(self.job.training.output_dir.clone())
    }

    /// Load and filter the dataset, writing `dataset.jsonl` into the output directory.
    pub async fn prepare(&self) -> TrainingResult<(LoadedDataset, PathBuf)> {
        self.job.validate()?;
        let layout = self.layout();
        layout.ensure_dirs()?;

        let dataset = load_dataset(&self.job.dataset.source, &self.job.load_options(), &self.hub).await?;
        let path = layout.dataset_jsonl_path();
        write_jsonl(&path, &dataset.records)?;
        Ok((dataset, path))
    }

    pub async fn run(self, resume: &ResumeFrom, progress: &dyn ProgressSink) -> TrainingResult<PipelineOutcome> {
        let job = &self.job;
        let job_id = job.job_id.clone();
        let layout = self.layout();

        let (dataset, dataset_path) = self.prepare().await?;
        write_json(&layout.job_spec_path(), job)?;
        progress.on_event(ProgressEvent::Message {
            job_id: job_id.clone(),
            message: format!("{} records kept of {}", dataset.stats.kept, dataset.stats.total),
        });

        let provisioned = ModelProvisioner::new(self.hub.clone())
            .provision(&job.model.model_id, &job.provision_options())
            .await?;
        let tokenizer = provisioned.tokenizer;

        let model = AdapterInjector::new(job.lora.clone())?.inject(provisioned.model)?;
        let summary = model.trainable_summary();
        progress.on_event(ProgressEvent::Message { job_id: job_id.clone(), message: summary.to_string() });

        let backend: Box<dyn StepBackend> = match (self.backend, job.training.backend) {
            (Some(backend), _) => backend,
            (None, BackendKind::Candle) => Box::new(CandleBackend::new()),
            (None, BackendKind::DryRun) => Box::new(DryRunBackend::new(tokenizer.vocab_size())),
        };
        let data = SftDataset {
            records: &dataset.records,
            tokenizer: &tokenizer,
            formatter: &ContextQaFormatter,
            sft: &job.sft,
        };
        let trainer = SftTrainer::new(job_id.clone(), model, data, job.training.clone(), backend)?
            .with_cancel_flag(Arc::clone(&self.cancel));
        let sequences = trainer.num_sequences();

        let train = trainer.train(resume, progress).await?;

        let root = layout.root();
        let mut artifacts = vec![
            make_artifact(root, ArtifactKind::JobSpec, &layout.job_spec_path())?,
            make_artifact(root, ArtifactKind::DatasetJsonl, &dataset_path)?,
        ];
        let status = if train.status == TrainerStatus::Cancelled {
            RunStatus::Cancelled
        } else {
            let adapter_dir = layout.adapter_dir();
            trainer.save_model(&adapter_dir).await?;
            artifacts.push(make_artifact(root, ArtifactKind::Adapter, &adapter_dir.join(ADAPTER_WEIGHTS_FILE))?);
            artifacts.push(make_artifact(root, ArtifactKind::AdapterConfig, &adapter_dir.join(ADAPTER_CONFIG_FILE))?);
            RunStatus::Finished
        };
        if let Some(ckpt) = &train.last_checkpoint {
            artifacts.push(make_artifact(root, ArtifactKind::Checkpoint, &ckpt.join(ADAPTER_WEIGHTS_FILE))?);
        }

        let manifest = TrainingManifest {
            job_id: job_id.clone(),
            created_at: Utc::now(),
            base_model: job.model.clone(),
            dataset_id: dataset.id.clone(),
            dataset_stats: dataset.stats,
            status,
            metrics: TrainingMetrics {
                train_loss: train.train_loss,
                steps: Some(train.global_step),
                total_steps: Some(train.total_steps),
                sequences,
                trainable_params: summary.trainable,
                total_params: summary.total,
            },
            artifacts,
        };
        let manifest_path = layout.manifest_path();
        write_json(&manifest_path, &manifest)?;

        info!(%job_id, manifest = %manifest_path.display(), status = %manifest.status, "run complete");
        Ok(PipelineOutcome { manifest, manifest_path, train })
    }
}
