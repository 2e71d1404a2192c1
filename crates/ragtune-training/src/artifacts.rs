//! Run manifest and the hashed files it points at.

use crate::dataset::DatasetId;
use crate::error::{TrainingError, TrainingResult};
use crate::job::{ModelSpec, TrainingJobId};
use crate::loader::LoadStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Final `adapter_model.safetensors`.
    Adapter,
    AdapterConfig,
    /// Adapter weights of the last checkpoint written.
    Checkpoint,
    JobSpec,
    DatasetJsonl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    /// Relative to the run directory when the file lives inside it.
    pub path: PathBuf,
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Finished,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TrainingMetrics {
    pub train_loss: Option<f64>,
    pub steps: Option<u64>,
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub sequences: usize,
    #[serde(default)]
    pub trainable_params: usize,
    #[serde(default)]
    pub total_params: usize,
}

/// `manifest.json` at the root of a run directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub job_id: TrainingJobId,
    pub created_at: DateTime<Utc>,
    pub base_model: ModelSpec,
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub dataset_stats: LoadStats,
    pub status: RunStatus,
    #[serde(default)]
    pub metrics: TrainingMetrics,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainingManifest {
    #[must_use]
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&TrainingArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    /// Absolute location of an artifact for a manifest read from `run_dir`.
    #[must_use]
    pub fn artifact_path(&self, run_dir: &Path, kind: ArtifactKind) -> Option<PathBuf> {
        self.artifact(kind).map(|a| run_dir.join(&a.path))
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hash `path` and record it relative to `run_dir`.
pub fn make_artifact(run_dir: &Path, kind: ArtifactKind, path: &Path) -> TrainingResult<TrainingArtifact> {
    let meta = std::fs::metadata(path).map_err(|e| {
        TrainingError::Artifact(format!("missing {kind:?} artifact at {}: {e}", path.display()))
    })?;

    Ok(TrainingArtifact {
        kind,
        path: path.strip_prefix(run_dir).unwrap_or(path).to_path_buf(),
        sha256: sha256_file(path)?,
        size_bytes: meta.len(),
    })
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}
