use crate::dataset::DatasetSource;
use crate::error::{TrainingError, TrainingResult};
use crate::loader::LoadOptions;
use chrono::{DateTime, Utc};
use ragtune_models::{ComputeDtype, LoraConfig, PaddingSide, ProvisionOptions, QuantizationConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub String);

impl TrainingJobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// The base model to fine-tune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Hub repository id or a local model directory.
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub padding_side: PaddingSide,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DatasetSpec {
    #[serde(flatten)]
    pub source: DatasetSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    #[serde(rename = "paged_adamw_32bit")]
    PagedAdamw32bit,
    #[serde(rename = "paged_adamw_8bit")]
    PagedAdamw8bit,
    Adamw,
    Sgd,
    Adafactor,
}

/// Which step backend runs the numeric side of training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Forward, backward and optimizer steps on candle tensors.
    #[default]
    Candle,
    /// Walks the schedule and writes artifacts without updating weights.
    DryRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerKind {
    #[default]
    Constant,
    Linear,
    Cosine,
}

/// Where `train()` picks up from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResumeFrom {
    #[default]
    None,
    /// Highest-step checkpoint in the output directory.
    Latest,
    Path(PathBuf),
}

impl FromStr for ResumeFrom {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "none" => Self::None,
            "latest" => Self::Latest,
            path => Self::Path(PathBuf::from(path)),
        })
    }
}

/// Hyperparameters consumed once by the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_epochs")]
    pub num_train_epochs: u32,
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,
    #[serde(default = "default_accumulation")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_true")]
    pub gradient_checkpointing: bool,
    #[serde(default)]
    pub optim: OptimizerKind,
    #[serde(default = "default_logging_steps")]
    pub logging_steps: u64,
    #[serde(default = "default_save_steps")]
    pub save_steps: u64,
    /// `0` keeps every checkpoint.
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub fp16: bool,
    #[serde(default = "default_true")]
    pub bf16: bool,
    #[serde(default)]
    pub tf32: bool,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    #[serde(default)]
    pub lr_scheduler_type: LrSchedulerKind,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop after this many optimizer steps, overriding the epoch count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub backend: BackendKind,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_epochs() -> u32 {
    1
}
fn default_batch_size() -> usize {
    4
}
fn default_accumulation() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_logging_steps() -> u64 {
    10
}
fn default_save_steps() -> u64 {
    100
}
fn default_save_total_limit() -> usize {
    3
}
fn default_learning_rate() -> f64 {
    2e-4
}
fn default_max_grad_norm() -> f64 {
    0.3
}
fn default_warmup_steps() -> u64 {
    10
}
fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            num_train_epochs: default_epochs(),
            per_device_train_batch_size: default_batch_size(),
            gradient_accumulation_steps: default_accumulation(),
            gradient_checkpointing: true,
            optim: OptimizerKind::default(),
            logging_steps: default_logging_steps(),
            save_steps: default_save_steps(),
            save_total_limit: default_save_total_limit(),
            learning_rate: default_learning_rate(),
            fp16: false,
            bf16: true,
            tf32: false,
            max_grad_norm: default_max_grad_norm(),
            warmup_steps: default_warmup_steps(),
            lr_scheduler_type: LrSchedulerKind::default(),
            seed: default_seed(),
            max_steps: None,
            backend: BackendKind::default(),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        let invalid = |msg: &str| Err(TrainingError::InvalidSpec(msg.to_string()));

        if self.output_dir.as_os_str().is_empty() {
            return invalid("output_dir is required");
        }
        if self.num_train_epochs == 0 {
            return invalid("num_train_epochs must be >= 1");
        }
        if self.per_device_train_batch_size == 0 {
            return invalid("per_device_train_batch_size must be >= 1");
        }
        if self.gradient_accumulation_steps == 0 {
            return invalid("gradient_accumulation_steps must be >= 1");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid("learning_rate must be > 0");
        }
        if self.logging_steps == 0 {
            return invalid("logging_steps must be >= 1");
        }
        if self.save_steps == 0 {
            return invalid("save_steps must be >= 1");
        }
        if self.fp16 && self.bf16 {
            return invalid("fp16 and bf16 are mutually exclusive");
        }
        if !self.max_grad_norm.is_finite() || self.max_grad_norm <= 0.0 {
            return invalid("max_grad_norm must be > 0");
        }
        if self.max_steps == Some(0) {
            return invalid("max_steps must be >= 1 when set");
        }
        Ok(())
    }

    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.per_device_train_batch_size * self.gradient_accumulation_steps
    }
}

/// Supervised fine-tuning inputs beyond the hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftConfig {
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    #[serde(default = "default_true")]
    pub packing: bool,
}

fn default_max_seq_length() -> usize {
    2048
}

impl SftConfig {
    pub fn validate(&self) -> TrainingResult<()> {
        if self.max_seq_length < 2 {
            return Err(TrainingError::InvalidSpec("sft.max_seq_length must be >= 2".to_string()));
        }
        Ok(())
    }
}

impl Default for SftConfig {
    fn default() -> Self {
        Self { max_seq_length: default_max_seq_length(), packing: true }
    }
}

/// A complete fine-tuning job, as read from `ragtune.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJobSpec {
    #[serde(default, skip_serializing)]
    pub job_id: TrainingJobId,
    #[serde(default = "Utc::now", skip_serializing)]
    pub created_at: DateTime<Utc>,
    pub model: ModelSpec,
    #[serde(default)]
    pub dataset: DatasetSpec,
    #[serde(default)]
    pub quantization: QuantizationConfig,
    #[serde(default)]
    pub lora: LoraConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub sft: SftConfig,
}

impl TrainingJobSpec {
    #[must_use]
    pub fn new(model_id: impl Into<String>, dataset: DatasetSource) -> Self {
        Self {
            job_id: TrainingJobId::new(),
            created_at: Utc::now(),
            model: ModelSpec { model_id: model_id.into(), revision: None, padding_side: PaddingSide::Right },
            dataset: DatasetSpec { source: dataset, max_records: None },
            quantization: QuantizationConfig::default(),
            lora: LoraConfig::default(),
            training: TrainingConfig::default(),
            sft: SftConfig::default(),
        }
    }

    pub fn from_toml_str(contents: &str) -> TrainingResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Read a job file. Relative local paths stay relative to the working directory.
    pub fn load(path: &Path) -> TrainingResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TrainingError::InvalidSpec(format!("failed to read job file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.model.model_id.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("model.model_id is required".to_string()));
        }
        self.sft.validate()?;
        self.quantization.validate()?;
        self.lora.validate()?;
        self.training.validate()?;

        match (self.quantization.compute_dtype, self.training.fp16, self.training.bf16) {
            (ComputeDtype::Bf16, true, _) => Err(TrainingError::InvalidSpec(
                "fp16 training with a bf16 compute dtype".to_string(),
            )),
            (ComputeDtype::F16, _, true) => Err(TrainingError::InvalidSpec(
                "bf16 training with an f16 compute dtype".to_string(),
            )),
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn provision_options(&self) -> ProvisionOptions {
        ProvisionOptions {
            revision: self.model.revision.clone(),
            quantization: self.quantization.clone(),
            padding_side: self.model.padding_side,
            gradient_checkpointing: self.training.gradient_checkpointing,
        }
    }

    #[must_use]
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions { max_records: self.dataset.max_records, ..LoadOptions::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ragtune_models::{LoraBias, QuantType};

    const JOB: &str = r#"
[model]
model_id = "mistralai/Mistral-7B-v0.1"

[dataset]
type = "hub"
split = "train"
max_records = 500

[quantization]
load_in_4bit = true
quant_type = "nf4"
double_quant = true
compute_dtype = "bf16"

[lora]
r = 16
alpha = 32.0
dropout = 0.1
target_modules = ["q_proj", "v_proj"]
bias = "lora_only"

[training]
output_dir = "runs/rag"
num_train_epochs = 3
lr_scheduler_type = "cosine"
optim = "paged_adamw_8bit"
save_total_limit = 2

[sft]
max_seq_length = 512
packing = false
"#;

    #[test]
    fn test_job_file_parses_all_sections() {
        let job = TrainingJobSpec::from_toml_str(JOB).unwrap();
        job.validate().unwrap();

        assert_eq!(job.model.model_id, "mistralai/Mistral-7B-v0.1");
        assert_eq!(job.model.padding_side, PaddingSide::Right);
        assert_eq!(job.dataset.source, DatasetSource::default());
        assert_eq!(job.dataset.max_records, Some(500));
        assert_eq!(job.quantization.quant_type, QuantType::Nf4);
        assert!(job.quantization.double_quant);
        assert_eq!(job.lora.r, 16);
        assert_eq!(job.lora.bias, LoraBias::LoraOnly);
        assert_eq!(job.training.num_train_epochs, 3);
        assert_eq!(job.training.lr_scheduler_type, LrSchedulerKind::Cosine);
        assert_eq!(job.training.optim, OptimizerKind::PagedAdamw8bit);
        assert_eq!(job.training.save_total_limit, 2);
        assert_eq!(job.training.learning_rate, 2e-4);
        assert!(!job.sft.packing);
        assert_eq!(job.load_options().max_records, Some(500));
    }

    #[test]
    fn test_missing_model_id_is_rejected() {
        let job = TrainingJobSpec::new("  ", DatasetSource::default());
        assert!(job.validate().is_err());
    }

    #[test]
    fn test_fp16_and_bf16_conflict() {
        let mut job = TrainingJobSpec::new("m", DatasetSource::default());
        job.training.fp16 = true;
        let err = job.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_fp16_with_bf16_compute_dtype_is_rejected() {
        let mut job = TrainingJobSpec::new("m", DatasetSource::default());
        job.training.fp16 = true;
        job.training.bf16 = false;
        assert!(job.validate().is_err());

        job.quantization.compute_dtype = ComputeDtype::F16;
        job.validate().unwrap();
    }

    #[test]
    fn test_invalid_lora_surfaces_as_config_error() {
        let mut job = TrainingJobSpec::new("m", DatasetSource::default());
        job.lora.r = 0;
        assert!(matches!(
            job.validate(),
            Err(TrainingError::Model(ragtune_models::ModelError::Config(_)))
        ));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for mutate in [
            (|c: &mut TrainingConfig| c.save_steps = 0) as fn(&mut TrainingConfig),
            |c| c.logging_steps = 0,
            |c| c.gradient_accumulation_steps = 0,
            |c| c.learning_rate = 0.0,
        ] {
            let mut cfg = TrainingConfig::default();
            mutate(&mut cfg);
            assert!(cfg.validate().is_err());
        }
    }

    #[test]
    fn test_save_total_limit_defaults_and_round_trips() {
        let job = TrainingJobSpec::from_toml_str("[model]\nmodel_id = \"m\"\n").unwrap();
        assert_eq!(job.training.save_total_limit, 3);

        let keep_all =
            TrainingJobSpec::from_toml_str("[model]\nmodel_id = \"m\"\n[training]\nsave_total_limit = 0\n").unwrap();
        keep_all.validate().unwrap();
        assert_eq!(keep_all.training.save_total_limit, 0);

        let json = serde_json::to_string(&keep_all).unwrap();
        let back: TrainingJobSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.training, keep_all.training);
    }

    #[test]
    fn test_resume_from_str() {
        assert_eq!("latest".parse::<ResumeFrom>().unwrap(), ResumeFrom::Latest);
        assert_eq!("none".parse::<ResumeFrom>().unwrap(), ResumeFrom::None);
        assert_eq!(
            "out/checkpoint-10".parse::<ResumeFrom>().unwrap(),
            ResumeFrom::Path(PathBuf::from("out/checkpoint-10"))
        );
    }
}
