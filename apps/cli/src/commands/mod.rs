//! Command implementations for the RagTune CLI.

pub mod init;
pub mod list;
pub mod prepare;
pub mod train;

use anyhow::{Context, Result};
use ragtune_training::TrainingJobSpec;
use std::path::Path;

/// Read and validate a job file.
pub fn load_job(path: &Path) -> Result<TrainingJobSpec> {
    let job = TrainingJobSpec::load(path)
        .with_context(|| format!("Failed to load job file {}. Run `ragtune init` first.", path.display()))?;
    job.validate().context("Invalid job file")?;
    Ok(job)
}
