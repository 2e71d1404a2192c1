//! HuggingFace Hub access for model and dataset files.
//!
//! Failures to reach or resolve a repository are setup errors and are never
//! retried here.

use crate::error::{ModelError, ModelResult};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DATA_EXTENSIONS: &[&str] = &[".jsonl", ".json", ".parquet"];

/// Files that make up a pretrained model on disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Resolve model files inside an existing local directory.
    pub fn from_dir(dir: &Path) -> ModelResult<Self> {
        let config = dir.join("config.json");
        let tokenizer = dir.join("tokenizer.json");
        for required in [&config, &tokenizer] {
            if !required.exists() {
                return Err(ModelError::Hub(format!("missing {}", required.display())));
            }
        }

        let tokenizer_config = Some(dir.join("tokenizer_config.json")).filter(|p| p.exists());

        let single = dir.join("model.safetensors");
        let weights = if single.exists() {
            vec![single]
        } else {
            let index = dir.join("model.safetensors.index.json");
            if !index.exists() {
                return Err(ModelError::Hub(format!(
                    "no model.safetensors or index in {}",
                    dir.display()
                )));
            }
            shard_names(&index)?.into_iter().map(|f| dir.join(f)).collect()
        };

        Ok(Self { config, tokenizer, tokenizer_config, weights })
    }
}

/// Shard file names listed in a `model.safetensors.index.json`.
fn shard_names(index_path: &Path) -> ModelResult<BTreeSet<String>> {
    let index: serde_json::Value = serde_json::from_slice(&std::fs::read(index_path)?)?;
    let names: BTreeSet<String> = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .map(|map| map.values().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    if names.is_empty() {
        return Err(ModelError::Hub(format!("{} lists no shards", index_path.display())));
    }
    Ok(names)
}

/// Thin client over the Hub API with optional token auth.
#[derive(Clone)]
pub struct HubClient {
    api: Api,
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient").finish_non_exhaustive()
    }
}

impl HubClient {
    /// Build a client. `token` falls back to the `HF_TOKEN` environment variable.
    pub fn new(token: Option<String>) -> ModelResult<Self> {
        let token = token.or_else(|| std::env::var("HF_TOKEN").ok()).filter(|t| !t.is_empty());
        let api = ApiBuilder::new()
            .with_token(token)
            .build()
            .map_err(|e| ModelError::Hub(e.to_string()))?;
        Ok(Self { api })
    }

    fn repo(&self, id: &str, kind: RepoType, revision: Option<&str>) -> ApiRepo {
        match revision {
            Some(rev) => self.api.repo(Repo::with_revision(id.to_string(), kind, rev.to_string())),
            None => self.api.repo(Repo::new(id.to_string(), kind)),
        }
    }

    /// Download config, tokenizer and safetensors weights for a model.
    ///
    /// An existing local directory is used directly.
    pub async fn fetch_model(&self, model_id: &str, revision: Option<&str>) -> ModelResult<ModelFiles> {
        let local = Path::new(model_id);
        if local.is_dir() {
            debug!(path = %local.display(), "using local model directory");
            return ModelFiles::from_dir(local);
        }

        let repo = self.repo(model_id, RepoType::Model, revision);
        let get = |file: &'static str| {
            let repo = &repo;
            async move {
                repo.get(file)
                    .await
                    .map_err(|e| ModelError::Hub(format!("{model_id}/{file}: {e}")))
            }
        };

        let config = get("config.json").await?;
        let tokenizer = get("tokenizer.json").await?;
        let tokenizer_config = get("tokenizer_config.json").await.ok();

        info!(model_id, "downloading weights");
        let weights = if let Ok(path) = repo.get("model.safetensors").await {
            vec![path]
        } else {
            let index = get("model.safetensors.index.json").await?;
            let mut paths = Vec::new();
            for shard in shard_names(&index)? {
                let path = repo
                    .get(&shard)
                    .await
                    .map_err(|e| ModelError::Hub(format!("{model_id}/{shard}: {e}")))?;
                paths.push(path);
            }
            paths
        };

        Ok(ModelFiles { config, tokenizer, tokenizer_config, weights })
    }

    /// Download the data files that hold `split` of a dataset repository.
    pub async fn fetch_dataset_split(
        &self,
        dataset_id: &str,
        split: &str,
        revision: Option<&str>,
    ) -> ModelResult<Vec<PathBuf>> {
        let repo = self.repo(dataset_id, RepoType::Dataset, revision);
        let info = repo
            .info()
            .await
            .map_err(|e| ModelError::Hub(format!("{dataset_id}: {e}")))?;
        let files: Vec<String> = info.siblings.into_iter().map(|s| s.rfilename).collect();

        let selected = select_split_files(&files, split);
        if selected.is_empty() {
            return Err(ModelError::Hub(format!(
                "no data files for split '{split}' in dataset '{dataset_id}'"
            )));
        }

        let mut paths = Vec::with_capacity(selected.len());
        for file in selected {
            debug!(dataset_id, file = %file, "downloading dataset file");
            let path = repo
                .get(&file)
                .await
                .map_err(|e| ModelError::Hub(format!("{dataset_id}/{file}: {e}")))?;
            paths.push(path);
        }
        Ok(paths)
    }
}

/// Pick the data files belonging to `split` from a repository file listing.
///
/// Files whose path mentions the split win; a repository with a single data
/// file serves it as the `train` split.
#[must_use]
pub fn select_split_files(files: &[String], split: &str) -> Vec<String> {
    let data: Vec<&String> = files
        .iter()
        .filter(|f| DATA_EXTENSIONS.iter().any(|ext| f.ends_with(ext)))
        .collect();

    let mut matching: Vec<String> = data
        .iter()
        .filter(|f| {
            f.split(['/', '-', '_', '.'])
                .any(|part| part == split)
        })
        .map(|f| (*f).clone())
        .collect();
    matching.sort();

    if matching.is_empty() && split == "train" && data.len() == 1 {
        return vec![data[0].clone()];
    }
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_single_file_repo_serves_train() {
        let files = names(&[".gitattributes", "README.md", "databricks-dolly-15k.jsonl"]);
        assert_eq!(select_split_files(&files, "train"), vec!["databricks-dolly-15k.jsonl"]);
        assert!(select_split_files(&files, "test").is_empty());
    }

    #[test]
    fn test_split_named_parquet_shards() {
        let files = names(&[
            "README.md",
            "data/train-00001-of-00002.parquet",
            "data/train-00000-of-00002.parquet",
            "data/test-00000-of-00001.parquet",
        ]);
        assert_eq!(
            select_split_files(&files, "train"),
            vec!["data/train-00000-of-00002.parquet", "data/train-00001-of-00002.parquet"]
        );
        assert_eq!(select_split_files(&files, "test"), vec!["data/test-00000-of-00001.parquet"]);
    }

    #[test]
    fn test_split_does_not_match_substrings() {
        let files = names(&["data/retrain.jsonl", "data/validation.jsonl"]);
        assert!(select_split_files(&files, "train").is_empty());
    }

    #[test]
    fn test_model_files_from_dir_with_shards() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        std::fs::write(dir.join("config.json"), "{}").unwrap();
        std::fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        std::fs::write(
            dir.join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00001.safetensors", "b": "model-00002.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let files = ModelFiles::from_dir(dir).unwrap();
        assert_eq!(files.weights.len(), 2);
        assert!(files.tokenizer_config.is_none());
    }

    #[test]
    fn test_model_files_from_dir_missing_tokenizer() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.json"), "{}").unwrap();
        assert!(matches!(ModelFiles::from_dir(temp.path()), Err(ModelError::Hub(_))));
    }
}
