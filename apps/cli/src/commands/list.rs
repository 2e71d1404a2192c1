//! List command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use ragtune_training::{discover_runs, RunStatus};
use serde_json::json;
use std::path::Path;

pub fn execute(root: &Path, json_output: bool) -> Result<()> {
    let runs = discover_runs(root).with_context(|| format!("Failed to scan {}", root.display()))?;

    if json_output {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                json!({
                    "job_id": r.manifest.job_id.0,
                    "created_at": r.manifest.created_at,
                    "status": r.manifest.status,
                    "base_model": r.manifest.base_model.model_id,
                    "dataset_id": r.manifest.dataset_id.0,
                    "train_loss": r.manifest.metrics.train_loss,
                    "run_dir": r.run_dir,
                    "adapter_dir": r.adapter_dir,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Fine-tuning runs ({})", runs.len()).bold().cyan());
    println!();

    if runs.is_empty() {
        println!("  {}", format!("No runs found under {}.", root.display()).dimmed());
        return Ok(());
    }

    println!("{:<38} {:<10} {:<30} {}", "Job", "Status", "Base model", "Adapter");
    println!("{}", "─".repeat(100));
    for r in runs {
        let adapter = r.adapter_dir.map_or_else(|| "-".to_string(), |p| p.display().to_string());
        let status = match r.manifest.status {
            RunStatus::Finished => r.manifest.status.to_string().green(),
            RunStatus::Cancelled => r.manifest.status.to_string().yellow(),
        };
        println!(
            "{:<38} {:<10} {:<30} {}",
            r.manifest.job_id.0.cyan(),
            status,
            r.manifest.base_model.model_id,
            adapter.dimmed()
        );
    }
    println!();
    Ok(())
}
