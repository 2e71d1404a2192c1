use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "training_manifest.json";

/// Files a run writes under its `output_dir`.
///
/// ```text
/// <output_dir>/
///   job.json
///   dataset.jsonl
///   checkpoint-<step>/
///   adapter/
///   training_manifest.json
/// ```
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    root: PathBuf,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    #[must_use]
    pub fn dataset_jsonl_path(&self) -> PathBuf {
        self.root.join("dataset.jsonl")
    }

    #[must_use]
    pub fn job_spec_path(&self) -> PathBuf {
        self.root.join("job.json")
    }

    /// Final adapter written by `save_model`.
    #[must_use]
    pub fn adapter_dir(&self) -> PathBuf {
        self.root.join("adapter")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
