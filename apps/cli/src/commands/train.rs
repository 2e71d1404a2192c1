//! Train command implementation.

use super::load_job;
use anyhow::Result;
use colored::Colorize;
use ragtune_models::HubClient;
use ragtune_training::{
    BackendKind, FineTunePipeline, JsonProgressSink, ProgressSink, ResumeFrom, StdoutProgressSink, TrainerStatus,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::warn;

pub async fn execute(
    config: &Path,
    resume: &str,
    output_dir: Option<PathBuf>,
    dry_run: bool,
    json_output: bool,
) -> Result<()> {
    let mut job = load_job(config)?;
    if let Some(dir) = output_dir {
        job.training.output_dir = dir;
    }
    if dry_run {
        job.training.backend = BackendKind::DryRun;
    }
    let resume: ResumeFrom = resume.parse()?;

    let pipeline = FineTunePipeline::new(job, HubClient::new(None)?);
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current micro-batch");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let sink: Box<dyn ProgressSink> =
        if json_output { Box::new(JsonProgressSink) } else { Box::new(StdoutProgressSink) };
    let outcome = pipeline.run(&resume, sink.as_ref()).await?;

    if json_output {
        println!("{}", serde_json::to_string(&outcome.manifest)?);
        return Ok(());
    }

    let manifest = &outcome.manifest;
    println!();
    if outcome.train.status == TrainerStatus::Cancelled {
        println!("{}", "Training cancelled".bold().yellow());
        if let Some(ckpt) = &outcome.train.last_checkpoint {
            println!("  Checkpoint: {}", ckpt.display().to_string().cyan());
        }
        println!("  {}", "Resume with `ragtune train --resume latest`.".dimmed());
    } else {
        println!("{}", "Training complete".bold().green());
        println!("  Job:   {}", manifest.job_id.0.cyan());
        println!("  Steps: {}/{}", outcome.train.global_step, outcome.train.total_steps);
        if let Some(loss) = manifest.metrics.train_loss {
            println!("  Loss:  {loss:.4}");
        }
    }
    println!(
        "  Trainable params: {} of {}",
        manifest.metrics.trainable_params, manifest.metrics.total_params
    );
    println!("  Manifest: {}", outcome.manifest_path.display().to_string().dimmed());
    println!();
    Ok(())
}
