//! Supervised fine-tuning loop over packed prompt/response sequences.

use crate::backend::{OptimizerUpdate, StepBackend};
use crate::checkpoint::{CheckpointManager, LogEntry, TrainerState};
use crate::dataset::QaRecord;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{ResumeFrom, SftConfig, TrainingConfig, TrainingJobId};
use crate::packing::{build_sequences, TrainingSequence};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::prompt::PromptFormatter;
use crate::schedule::LrSchedule;
use crate::trainer::{TrainOutcome, Trainer, TrainerStatus};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use ragtune_models::{load_adapter_weights, save_adapter, AdaptedModel, TrainingTokenizer, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Everything needed to turn records into training sequences.
#[derive(Clone, Copy)]
pub struct SftDataset<'a> {
    pub records: &'a [QaRecord],
    pub tokenizer: &'a TrainingTokenizer,
    pub formatter: &'a dyn PromptFormatter,
    pub sft: &'a SftConfig,
}

struct SftInner {
    model: AdaptedModel,
    backend: Box<dyn StepBackend>,
}

pub struct SftTrainer {
    job_id: TrainingJobId,
    config: TrainingConfig,
    sequences: Vec<TrainingSequence>,
    checkpoints: CheckpointManager,
    inner: Mutex<SftInner>,
    status: Mutex<TrainerStatus>,
    cancel_requested: Arc<AtomicBool>,
}

impl std::fmt::Debug for SftTrainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftTrainer")
            .field("job_id", &self.job_id)
            .field("sequences", &self.sequences.len())
            .field("output_dir", &self.config.output_dir)
            .finish_non_exhaustive()
    }
}

impl SftTrainer {
    pub fn new(
        job_id: TrainingJobId,
        model: AdaptedModel,
        data: SftDataset<'_>,
        config: TrainingConfig,
        backend: Box<dyn StepBackend>,
    ) -> TrainingResult<Self> {
        config.validate()?;
        data.sft.validate()?;
        let sequences = build_sequences(
            data.records,
            data.formatter,
            data.tokenizer,
            data.sft.max_seq_length,
            data.sft.packing,
        )?;
        let checkpoints = CheckpointManager::new(config.output_dir.clone(), config.save_total_limit);

        info!(
            %job_id,
            backend = backend.id(),
            sequences = sequences.len(),
            max_seq_length = data.sft.max_seq_length,
            packing = data.sft.packing,
            "sft trainer ready"
        );

        Ok(Self {
            job_id,
            config,
            sequences,
            checkpoints,
            inner: Mutex::new(SftInner { model, backend }),
            status: Mutex::new(TrainerStatus::Idle),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    #[must_use]
    pub fn batches_per_epoch(&self) -> usize {
        self.sequences.len().div_ceil(self.config.per_device_train_batch_size)
    }

    #[must_use]
    pub fn steps_per_epoch(&self) -> u64 {
        self.batches_per_epoch().div_ceil(self.config.gradient_accumulation_steps) as u64
    }

    #[must_use]
    pub fn total_steps(&self) -> u64 {
        self.config
            .max_steps
            .unwrap_or_else(|| self.steps_per_epoch() * u64::from(self.config.num_train_epochs))
    }

    /// Share an externally owned cancellation flag, e.g. one set from a signal handler.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_requested = flag;
        self
    }

    /// Shared flag that stops the loop when set; `cancel()` sets it too.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_requested)
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn into_model(self) -> TrainingResult<AdaptedModel> {
        self.inner
            .into_inner()
            .map(|inner| inner.model)
            .map_err(|_| TrainingError::Trainer("trainer state poisoned".to_string()))
    }

    fn set_status(&self, status: TrainerStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// Sequence indices for `epoch`, shuffled deterministically from the seed.
    fn epoch_order(&self, epoch: u32) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.sequences.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(u64::from(epoch)));
        order.shuffle(&mut rng);
        order
    }

    fn run_loop(&self, resume: &ResumeFrom, progress: &dyn ProgressSink) -> TrainingResult<TrainOutcome> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| TrainingError::Trainer("trainer state poisoned".to_string()))?;
        let SftInner { model, backend } = &mut *guard;
        let cfg = &self.config;
        let job_id = self.job_id.clone();
        let total_steps = self.total_steps();

        let mut state = match self.checkpoints.resolve(resume)? {
            Some(dir) => {
                load_adapter_weights(model, &dir)?;
                backend.load_state(&dir)?;
                let state = TrainerState::read(&dir)?;
                if state.seed != cfg.seed {
                    warn!(saved = state.seed, configured = cfg.seed, "seed differs from checkpoint");
                }
                progress.on_event(ProgressEvent::Message {
                    job_id: job_id.clone(),
                    message: format!("resuming from {} at step {}", dir.display(), state.global_step),
                });
                state
            }
            None => TrainerState::new(total_steps, cfg.seed),
        };
        state.total_steps = total_steps;

        self.set_status(TrainerStatus::Running);
        progress.on_event(ProgressEvent::Started { job_id: job_id.clone(), total_steps });

        let schedule = LrSchedule::new(cfg.lr_scheduler_type, cfg.learning_rate, cfg.warmup_steps, total_steps);
        let batches_per_epoch = self.batches_per_epoch();
        let mut losses = Vec::new();
        let mut last_checkpoint = None;

        'epochs: while state.global_step < total_steps {
            let epoch = state.epoch;
            let order = self.epoch_order(epoch);
            let mut pending = 0usize;
            let mut pending_loss = 0.0;

            let batches = order.chunks(cfg.per_device_train_batch_size).enumerate();
            for (idx, chunk) in batches.skip(state.batches_in_epoch as usize) {
                if self.cancel_requested.swap(false, Ordering::SeqCst) {
                    let dir = self.checkpoints.save(model, &state)?;
                    backend.save_state(&dir)?;
                    progress.on_event(ProgressEvent::Cancelled { job_id, step: state.global_step });
                    return Ok(TrainOutcome {
                        status: TrainerStatus::Cancelled,
                        global_step: state.global_step,
                        total_steps,
                        train_loss: mean(&losses),
                        last_checkpoint: Some(dir),
                    });
                }

                let batch: Vec<&TrainingSequence> = chunk.iter().map(|&i| &self.sequences[i]).collect();
                pending_loss += backend.accumulate(model, &batch)?;
                pending += 1;

                let epoch_done = idx + 1 == batches_per_epoch;
                if pending < cfg.gradient_accumulation_steps && !epoch_done {
                    continue;
                }

                let update = OptimizerUpdate {
                    step: state.global_step + 1,
                    learning_rate: schedule.lr_at(state.global_step),
                    max_grad_norm: cfg.max_grad_norm,
                    optimizer: cfg.optim,
                    accumulated: pending,
                };
                let grad_norm = backend.apply(model, &update)?;
                let loss = pending_loss / pending as f64;
                pending = 0;
                pending_loss = 0.0;

                state.global_step += 1;
                state.batches_in_epoch = (idx + 1) as u64;
                losses.push(loss);
                let step = state.global_step;

                progress.on_event(ProgressEvent::Step { job_id: job_id.clone(), step, total: Some(total_steps) });

                if step % cfg.logging_steps == 0 || step == total_steps {
                    let entry = LogEntry {
                        step,
                        epoch: f64::from(epoch) + (idx + 1) as f64 / batches_per_epoch as f64,
                        loss,
                        learning_rate: update.learning_rate,
                        grad_norm,
                    };
                    progress.on_event(ProgressEvent::Log {
                        job_id: job_id.clone(),
                        step,
                        epoch: entry.epoch,
                        loss,
                        learning_rate: entry.learning_rate,
                        grad_norm,
                    });
                    state.log_history.push(entry);
                }

                if step % cfg.save_steps == 0 {
                    let dir = self.checkpoints.save(model, &state)?;
                    backend.save_state(&dir)?;
                    progress.on_event(ProgressEvent::Checkpoint { job_id: job_id.clone(), step, path: dir.clone() });
                    last_checkpoint = Some(dir);
                }

                if step >= total_steps {
                    break 'epochs;
                }
            }

            state.epoch += 1;
            state.batches_in_epoch = 0;
        }

        progress.on_event(ProgressEvent::Finished { job_id });
        Ok(TrainOutcome {
            status: TrainerStatus::Finished,
            global_step: state.global_step,
            total_steps,
            train_loss: mean(&losses),
            last_checkpoint,
        })
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[async_trait]
impl Trainer for SftTrainer {
    fn id(&self) -> &'static str {
        "sft"
    }

    async fn train(&self, resume: &ResumeFrom, progress: &dyn ProgressSink) -> TrainingResult<TrainOutcome> {
        self.set_status(TrainerStatus::Preparing);

        match self.run_loop(resume, progress) {
            Ok(outcome) => {
                info!(
                    job_id = %self.job_id,
                    status = ?outcome.status,
                    step = outcome.global_step,
                    total = outcome.total_steps,
                    train_loss = ?outcome.train_loss,
                    "training stopped"
                );
                self.set_status(outcome.status.clone());
                Ok(outcome)
            }
            Err(e) => {
                self.set_status(TrainerStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn save_model(&self, dir: &Path) -> TrainingResult<Vec<PathBuf>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| TrainingError::Trainer("trainer state poisoned".to_string()))?;
        save_adapter(&guard.model, dir)?;
        Ok(vec![dir.join(ADAPTER_CONFIG_FILE), dir.join(ADAPTER_WEIGHTS_FILE)])
    }

    async fn status(&self) -> TrainingResult<TrainerStatus> {
        Ok(self.status.lock().map(|s| s.clone()).unwrap_or(TrainerStatus::Idle))
    }

    async fn cancel(&self) -> TrainingResult<()> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}
