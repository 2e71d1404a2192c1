use crate::artifacts::{ArtifactKind, TrainingManifest};
use crate::error::TrainingResult;
use crate::layout::MANIFEST_FILE;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A completed (or cancelled) fine-tuning run found on disk.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub run_dir: PathBuf,
    /// Final adapter directory, when the manifest records one.
    pub adapter_dir: Option<PathBuf>,
    pub manifest: TrainingManifest,
}

fn read_manifest(path: &Path) -> TrainingResult<TrainingManifest> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice::<TrainingManifest>(&bytes)?)
}

fn entry_for(run_dir: &Path) -> Option<RunEntry> {
    let manifest_path = run_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return None;
    }
    match read_manifest(&manifest_path) {
        Ok(manifest) => {
            let adapter_dir = manifest
                .artifact_path(run_dir, ArtifactKind::Adapter)
                .and_then(|p| p.parent().map(Path::to_path_buf));
            Some(RunEntry { run_dir: run_dir.to_path_buf(), adapter_dir, manifest })
        }
        Err(e) => {
            warn!(path = %manifest_path.display(), error = %e, "skipping unreadable manifest");
            None
        }
    }
}

/// Find runs in `root` itself and in its immediate subdirectories, newest first.
pub fn discover_runs(root: &Path) -> TrainingResult<Vec<RunEntry>> {
    let mut out: Vec<RunEntry> = entry_for(root).into_iter().collect();

    let dir = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    for entry in dir {
        let path = entry?.path();
        if path.is_dir() {
            out.extend(entry_for(&path));
        }
    }

    out.sort_by(|a, b| b.manifest.created_at.cmp(&a.manifest.created_at));
    Ok(out)
}
