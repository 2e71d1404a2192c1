//! PEFT-compatible adapter persistence.
//!
//! An adapter directory holds `adapter_config.json` and
//! `adapter_model.safetensors` with tensors named
//! `base_model.model.<module>.lora_A.weight` / `.lora_B.weight`. Biases the
//! bias policy unfroze are stored as `base_model.model.<module>.bias`.

use crate::error::{ModelError, ModelResult};
use crate::lora::{AdaptedModel, AdapterInjector, LoraBias, LoraConfig, TaskType};
use crate::model::QuantizedModel;
use ndarray::Array2;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

const KEY_PREFIX: &str = "base_model.model.";

/// On-disk `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftAdapterConfig {
    pub peft_type: String,
    pub r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub target_modules: Vec<String>,
    pub bias: String,
    pub task_type: String,
    pub base_model_name_or_path: String,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default = "default_inference_mode")]
    pub inference_mode: bool,
}

fn default_inference_mode() -> bool {
    true
}

impl PeftAdapterConfig {
    #[must_use]
    pub fn from_lora(config: &LoraConfig, base_model: &str) -> Self {
        Self {
            peft_type: "LORA".to_string(),
            r: config.r,
            lora_alpha: config.alpha,
            lora_dropout: config.dropout,
            target_modules: config.target_modules.clone(),
            bias: config.bias.as_str().to_string(),
            task_type: config.task_type.as_peft_str().to_string(),
            base_model_name_or_path: base_model.to_string(),
            use_rslora: config.use_rslora,
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }

    pub fn to_lora(&self) -> ModelResult<LoraConfig> {
        if self.peft_type != "LORA" {
            return Err(ModelError::Config(format!("unsupported peft_type {}", self.peft_type)));
        }
        let bias = match self.bias.as_str() {
            "none" => LoraBias::None,
            "all" => LoraBias::All,
            "lora_only" => LoraBias::LoraOnly,
            other => return Err(ModelError::Config(format!("unknown bias policy {other}"))),
        };
        Ok(LoraConfig {
            r: self.r,
            alpha: self.lora_alpha,
            dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
            bias,
            task_type: TaskType::CausalLm,
            use_rslora: self.use_rslora,
            ..LoraConfig::default()
        })
    }
}

/// Write the adapter config and weights of `model` into `dir`.
pub fn save_adapter(model: &AdaptedModel, dir: &Path) -> ModelResult<()> {
    std::fs::create_dir_all(dir)?;

    let config = PeftAdapterConfig::from_lora(model.config(), model.base().model_id());
    std::fs::write(dir.join(ADAPTER_CONFIG_FILE), serde_json::to_vec_pretty(&config)?)?;

    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(model.adapters().len() * 2);
    for (module, layer) in model.adapters() {
        for (suffix, matrix) in [("lora_A", &layer.lora_a), ("lora_B", &layer.lora_b)] {
            let data: Vec<f32> = matrix.iter().copied().collect();
            buffers.push((
                format!("{KEY_PREFIX}{module}.{suffix}.weight"),
                matrix.shape().to_vec(),
                bytemuck::cast_slice(&data).to_vec(),
            ));
        }
    }
    for (name, values) in model.trainable_biases() {
        buffers.push((format!("{KEY_PREFIX}{name}"), vec![values.len()], bytemuck::cast_slice(values).to_vec()));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), "pt".to_string());
    let bytes = safetensors::serialize(views, Some(metadata))?;
    std::fs::write(dir.join(ADAPTER_WEIGHTS_FILE), bytes)?;

    info!(
        dir = %dir.display(),
        adapters = model.adapters().len(),
        biases = model.trainable_biases().count(),
        "adapter saved"
    );
    Ok(())
}

/// Read `adapter_config.json` from an adapter directory.
pub fn read_adapter_config(dir: &Path) -> ModelResult<PeftAdapterConfig> {
    let bytes = std::fs::read(dir.join(ADAPTER_CONFIG_FILE))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Attach a saved adapter to a frozen base model.
pub fn load_adapter(base: QuantizedModel, dir: &Path) -> ModelResult<AdaptedModel> {
    let config = read_adapter_config(dir)?.to_lora()?;
    let mut model = AdapterInjector::new(config)?.inject(base)?;
    load_adapter_weights(&mut model, dir)?;
    Ok(model)
}

/// Overwrite the adapter matrices and trainable biases of `model` with those stored in `dir`.
pub fn load_adapter_weights(model: &mut AdaptedModel, dir: &Path) -> ModelResult<()> {
    let bytes = std::fs::read(dir.join(ADAPTER_WEIGHTS_FILE))?;
    let tensors = SafeTensors::deserialize(&bytes)?;

    for (module, layer) in model.adapters_mut().iter_mut() {
        layer.lora_a = read_matrix(&tensors, &format!("{KEY_PREFIX}{module}.lora_A.weight"), layer.lora_a.dim())?;
        layer.lora_b = read_matrix(&tensors, &format!("{KEY_PREFIX}{module}.lora_B.weight"), layer.lora_b.dim())?;
    }

    let biases: Vec<(String, usize)> =
        model.trainable_biases().map(|(name, values)| (name.to_string(), values.len())).collect();
    for (name, len) in biases {
        let values = read_f32(&tensors, &format!("{KEY_PREFIX}{name}"), &[len])?;
        model.set_trainable_bias(&name, &values)?;
    }
    Ok(())
}

fn read_f32(tensors: &SafeTensors<'_>, name: &str, shape: &[usize]) -> ModelResult<Vec<f32>> {
    let view = tensors.tensor(name)?;
    if view.dtype() != Dtype::F32 {
        return Err(ModelError::SafeTensors(format!("{name}: expected F32, found {:?}", view.dtype())));
    }
    if view.shape() != shape {
        return Err(ModelError::ShapeMismatch(format!("{name}: expected {shape:?}, found {:?}", view.shape())));
    }
    Ok(view
        .data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn read_matrix(tensors: &SafeTensors<'_>, name: &str, dim: (usize, usize)) -> ModelResult<Array2<f32>> {
    let data = read_f32(tensors, name, &[dim.0, dim.1])?;
    Array2::from_shape_vec(dim, data).map_err(|e| ModelError::ShapeMismatch(e.to_string()))
}
