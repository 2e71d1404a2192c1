use thiserror::Error;

pub type ModelResult<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Model or dataset source could not be reached or resolved.
    #[error("hub error: {0}")]
    Hub(String),

    /// Invalid quantization / adapter / tokenizer parameter combination.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("safetensors error: {0}")]
    SafeTensors(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(err.to_string())
    }
}
