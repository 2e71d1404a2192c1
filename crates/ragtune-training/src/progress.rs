use crate::job::TrainingJobId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: TrainingJobId, total_steps: u64 },
    Message { job_id: TrainingJobId, message: String },
    Step { job_id: TrainingJobId, step: u64, total: Option<u64> },
    Log { job_id: TrainingJobId, step: u64, epoch: f64, loss: f64, learning_rate: f64, grad_norm: f64 },
    Checkpoint { job_id: TrainingJobId, step: u64, path: PathBuf },
    Cancelled { job_id: TrainingJobId, step: u64 },
    Finished { job_id: TrainingJobId },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, total_steps } => {
                println!("[train:{job_id}] started ({total_steps} steps)");
            }
            ProgressEvent::Message { job_id, message } => println!("[train:{job_id}] {message}"),
            // Per-step lines are too chatty for a terminal; `Log` covers them.
            ProgressEvent::Step { .. } => {}
            ProgressEvent::Log { job_id, step, epoch, loss, learning_rate, grad_norm } => println!(
                "[train:{job_id}] step {step} epoch {epoch:.2} loss {loss:.4} lr {learning_rate:.3e} grad_norm {grad_norm:.4}"
            ),
            ProgressEvent::Checkpoint { job_id, step, path } => {
                println!("[train:{job_id}] checkpoint {step} -> {}", path.display());
            }
            ProgressEvent::Cancelled { job_id, step } => println!("[train:{job_id}] cancelled at step {step}"),
            ProgressEvent::Finished { job_id } => println!("[train:{job_id}] finished"),
        }
    }
}

/// Forwards events to `tracing` as structured fields.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, total_steps } => info!(%job_id, total_steps, "training started"),
            ProgressEvent::Message { job_id, message } => info!(%job_id, "{message}"),
            ProgressEvent::Step { .. } => {}
            ProgressEvent::Log { job_id, step, epoch, loss, learning_rate, grad_norm } => {
                info!(%job_id, step, epoch, loss, learning_rate, grad_norm, "train log");
            }
            ProgressEvent::Checkpoint { job_id, step, path } => {
                info!(%job_id, step, path = %path.display(), "checkpoint");
            }
            ProgressEvent::Cancelled { job_id, step } => info!(%job_id, step, "training cancelled"),
            ProgressEvent::Finished { job_id } => info!(%job_id, "training finished"),
        }
    }
}

/// Prints each event as one JSON line.
#[derive(Debug, Default)]
pub struct JsonProgressSink;

impl ProgressSink for JsonProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            println!("{line}");
        }
    }
}
