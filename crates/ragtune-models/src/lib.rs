//! Ragtune Models
//!
//! Base-model side of QLoRA fine-tuning:
//! - Resolving models and datasets on the HuggingFace Hub (`HubClient`)
//! - Blockwise 4-bit NF4/FP4 quantization (`BlockQuantizer`)
//! - Loading safetensors weights into a frozen `QuantizedModel`
//! - A training tokenizer that pads with EOS on the right
//! - LoRA adapter injection and PEFT-compatible adapter files

pub mod adapter_io;
pub mod error;
pub mod hub;
pub mod lora;
pub mod model;
pub mod provisioner;
pub mod quant;
pub mod tokenizer;

pub use adapter_io::{
    load_adapter, load_adapter_weights, read_adapter_config, save_adapter, PeftAdapterConfig,
    ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE,
};
pub use error::{ModelError, ModelResult};
pub use hub::{select_split_files, HubClient, ModelFiles};
pub use lora::{AdaptedModel, AdapterInjector, LoraBias, LoraConfig, LoraLayer, TaskType, TrainableSummary};
pub use model::{ModelArchConfig, Parameter, QuantizedModel, Weight};
pub use provisioner::{ModelProvisioner, ProvisionOptions, ProvisionedModel};
pub use quant::{dequantize, BlockQuantizer, ComputeDtype, QuantType, QuantizationConfig, QuantizedTensor};
pub use tokenizer::{PaddingSide, TrainingTokenizer};
