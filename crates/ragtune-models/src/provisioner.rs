use crate::error::ModelResult;
use crate::hub::{HubClient, ModelFiles};
use crate::model::{ModelArchConfig, QuantizedModel};
use crate::quant::QuantizationConfig;
use crate::tokenizer::{PaddingSide, TrainingTokenizer};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub revision: Option<String>,
    pub quantization: QuantizationConfig,
    pub padding_side: PaddingSide,
    pub gradient_checkpointing: bool,
}

/// A frozen, quantized base model with its training tokenizer.
#[derive(Debug)]
pub struct ProvisionedModel {
    pub model: QuantizedModel,
    pub tokenizer: TrainingTokenizer,
}

/// Resolves a model id to a quantized model and a pad-equals-eos tokenizer.
#[derive(Debug, Clone)]
pub struct ModelProvisioner {
    hub: HubClient,
}

impl ModelProvisioner {
    #[must_use]
    pub fn new(hub: HubClient) -> Self {
        Self { hub }
    }

    /// Fetch (or reuse a local directory) and load the model.
    pub async fn provision(&self, model_id: &str, options: &ProvisionOptions) -> ModelResult<ProvisionedModel> {
        // Configuration errors surface before any download.
        options.quantization.validate()?;
        let files = self.hub.fetch_model(model_id, options.revision.as_deref()).await?;
        Self::provision_from_files(model_id, &files, options)
    }

    /// Load from a local model directory without touching the network.
    pub fn provision_from_dir(dir: &Path, options: &ProvisionOptions) -> ModelResult<ProvisionedModel> {
        let files = ModelFiles::from_dir(dir)?;
        Self::provision_from_files(&dir.display().to_string(), &files, options)
    }

    pub fn provision_from_files(
        model_id: &str,
        files: &ModelFiles,
        options: &ProvisionOptions,
    ) -> ModelResult<ProvisionedModel> {
        options.quantization.validate()?;

        let tokenizer = match options.padding_side {
            PaddingSide::Right => {
                TrainingTokenizer::from_files(&files.tokenizer, files.tokenizer_config.as_deref())?
            }
            PaddingSide::Left => {
                TrainingTokenizer::from_bytes(&std::fs::read(&files.tokenizer)?, PaddingSide::Left)?
            }
        };

        let arch = ModelArchConfig::from_file(&files.config)?;
        let mut model = QuantizedModel::load(model_id, arch, &files.weights, &options.quantization)?;
        model.prepare_for_kbit_training(options.gradient_checkpointing);

        info!(
            model_id,
            load_in_4bit = options.quantization.load_in_4bit,
            quant_type = ?options.quantization.quant_type,
            eos = tokenizer.eos_token(),
            memory_bytes = model.memory_bytes(),
            "model provisioned"
        );
        Ok(ProvisionedModel { model, tokenizer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::model::tests::write_toy_model;
    use crate::tokenizer::tests::TOY_TOKENIZER;
    use tempfile::TempDir;

    fn toy_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        write_toy_model(temp.path(), 32, 1);
        std::fs::write(temp.path().join("tokenizer.json"), TOY_TOKENIZER).unwrap();
        temp
    }

    #[test]
    fn test_provisioned_model_is_frozen_with_eos_padding() {
        let temp = toy_dir();
        let options = ProvisionOptions { gradient_checkpointing: true, ..Default::default() };
        let provisioned = ModelProvisioner::provision_from_dir(temp.path(), &options).unwrap();

        assert_eq!(provisioned.model.num_trainable_parameters(), 0);
        assert!(provisioned.model.gradient_checkpointing());
        assert_eq!(provisioned.tokenizer.pad_token_id(), provisioned.tokenizer.eos_token_id());
        assert_eq!(provisioned.tokenizer.padding_side(), PaddingSide::Right);
        assert_eq!(provisioned.model.arch().model_type.as_deref(), Some("llama"));
    }

    #[test]
    fn test_left_padding_is_a_config_error() {
        let temp = toy_dir();
        let options = ProvisionOptions { padding_side: PaddingSide::Left, ..Default::default() };
        let err = ModelProvisioner::provision_from_dir(temp.path(), &options).unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }

    #[test]
    fn test_invalid_quantization_is_a_config_error() {
        let temp = toy_dir();
        let mut options = ProvisionOptions::default();
        options.quantization.block_size = 100;
        let err = ModelProvisioner::provision_from_dir(temp.path(), &options).unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }

    #[tokio::test]
    async fn test_provision_uses_local_directory() {
        let temp = toy_dir();
        let provisioner = ModelProvisioner::new(HubClient::new(None).unwrap());
        let id = temp.path().display().to_string();
        let provisioned = provisioner.provision(&id, &ProvisionOptions::default()).await.unwrap();
        assert_eq!(provisioned.model.model_id(), id);
    }
}
