use ragtune_models::ModelError;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training job spec: {0}")]
    InvalidSpec(String),

    /// A dataset or model source could not be reached. Never retried.
    #[error("setup error: {0}")]
    Setup(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    /// Out of memory or similar, reported by the step backend.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Model(ModelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl From<ModelError> for TrainingError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Hub(msg) => Self::Setup(msg),
            other => Self::Model(other),
        }
    }
}
