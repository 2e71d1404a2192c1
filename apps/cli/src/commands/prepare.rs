//! Prepare command implementation.

use super::load_job;
use anyhow::Result;
use colored::Colorize;
use ragtune_models::HubClient;
use ragtune_training::FineTunePipeline;
use serde_json::json;
use std::path::Path;

pub async fn execute(config: &Path, json_output: bool) -> Result<()> {
    let job = load_job(config)?;
    let source = job.dataset.source.to_string();
    let pipeline = FineTunePipeline::new(job, HubClient::new(None)?);
    let (dataset, path) = pipeline.prepare().await?;

    if json_output {
        let out = json!({
            "source": source,
            "dataset_id": dataset.id,
            "stats": dataset.stats,
            "path": path,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Dataset prepared".bold().green());
    println!("  Source:  {}", source.cyan());
    println!("  Kept:    {} of {} ({} dropped)", dataset.stats.kept, dataset.stats.total, dataset.stats.dropped);
    println!("  Id:      {}", dataset.id.0.dimmed());
    println!("  Written: {}", path.display().to_string().dimmed());
    println!();
    Ok(())
}
