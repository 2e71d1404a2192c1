use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

/// The public instruction dataset the pipeline is built around.
pub const DOLLY_DATASET_ID: &str = "databricks/databricks-dolly-15k";

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Dolly task category. Labels outside the known set parse as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ClosedQa,
    InformationExtraction,
    OpenQa,
    Classification,
    Summarization,
    Brainstorming,
    GeneralQa,
    CreativeWriting,
    #[serde(other)]
    Other,
}

impl Category {
    /// Categories whose answers are grounded in (or answerable like) a context passage.
    pub const CONTEXT_GROUNDED: [Category; 3] =
        [Category::ClosedQa, Category::InformationExtraction, Category::OpenQa];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClosedQa => "closed_qa",
            Self::InformationExtraction => "information_extraction",
            Self::OpenQa => "open_qa",
            Self::Classification => "classification",
            Self::Summarization => "summarization",
            Self::Brainstorming => "brainstorming",
            Self::GeneralQa => "general_qa",
            Self::CreativeWriting => "creative_writing",
            Self::Other => "other",
        }
    }
}

/// One row of the source dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub instruction: String,
    #[serde(default)]
    pub context: Option<String>,
    pub response: String,
    pub category: Category,
}

/// A filtered record carrying only what the prompt needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaRecord {
    pub instruction: String,
    #[serde(default)]
    pub context: String,
    pub response: String,
}

impl From<RawRecord> for QaRecord {
    fn from(raw: RawRecord) -> Self {
        Self {
            instruction: raw.instruction,
            context: raw.context.unwrap_or_default(),
            response: raw.response,
        }
    }
}

pub type Dataset = Vec<QaRecord>;

/// Where the records come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetSource {
    /// A dataset repository on the HuggingFace Hub.
    Hub {
        #[serde(default = "default_dataset_id")]
        dataset_id: String,
        #[serde(default = "default_split")]
        split: String,
        #[serde(default)]
        revision: Option<String>,
    },
    /// Local JSONL, one raw record per line.
    Jsonl { path: PathBuf },
    /// Local Parquet file with `instruction`, `context`, `response`, `category` columns.
    Parquet { path: PathBuf },
}

fn default_dataset_id() -> String {
    DOLLY_DATASET_ID.to_string()
}

fn default_split() -> String {
    "train".to_string()
}

impl Default for DatasetSource {
    fn default() -> Self {
        Self::Hub { dataset_id: default_dataset_id(), split: default_split(), revision: None }
    }
}

impl fmt::Display for DatasetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub { dataset_id, split, .. } => write!(f, "hub:{dataset_id}[{split}]"),
            Self::Jsonl { path } | Self::Parquet { path } => write!(f, "{}", path.display()),
        }
    }
}

pub fn compute_dataset_id(records: &[QaRecord]) -> TrainingResult<DatasetId> {
    let mut hasher = Sha256::new();

    for rec in records {
        hasher.update(serde_json::to_vec(rec)?);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_records(records: &[QaRecord]) -> TrainingResult<()> {
    if records.is_empty() {
        return Err(TrainingError::Dataset(
            "no records left after category filtering".to_string(),
        ));
    }
    Ok(())
}
