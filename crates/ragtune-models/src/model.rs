//! Base model state: named parameters, dense or 4-bit quantized.

use crate::error::{ModelError, ModelResult};
use crate::quant::{dequantize, BlockQuantizer, ComputeDtype, QuantizationConfig, QuantizedTensor};
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Module name suffixes that are never quantized, matching the usual
/// bitsandbytes skip list for causal LMs.
const QUANT_SKIP_MODULES: &[&str] = &["lm_head", "embed_tokens", "wte", "wpe", "embed_out"];

/// Subset of `config.json` the pipeline relies on. Unknown keys are kept.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelArchConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub hidden_size: Option<usize>,
    #[serde(default)]
    pub num_hidden_layers: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModelArchConfig {
    pub fn from_file(path: &Path) -> ModelResult<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Weight {
    Dense { shape: Vec<usize>, data: Vec<f32> },
    Quantized(QuantizedTensor),
}

impl Weight {
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Dense { shape, .. } => shape,
            Self::Quantized(q) => &q.shape,
        }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    #[must_use]
    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }

    /// Dense f32 view of the weight; quantized weights are expanded.
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Self::Dense { data, .. } => data.clone(),
            Self::Quantized(q) => dequantize(q),
        }
    }

    #[must_use]
    pub fn memory_bytes(&self, dtype: ComputeDtype) -> usize {
        match self {
            Self::Dense { data, .. } => data.len() * dtype.size_in_bytes(),
            Self::Quantized(q) => q.memory_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub weight: Weight,
    pub trainable: bool,
}

/// A loaded, optionally quantized, pretrained model.
#[derive(Debug, Clone)]
pub struct QuantizedModel {
    model_id: String,
    arch: ModelArchConfig,
    compute_dtype: ComputeDtype,
    params: BTreeMap<String, Parameter>,
    gradient_checkpointing: bool,
}

impl QuantizedModel {
    #[must_use]
    pub fn new(
        model_id: impl Into<String>,
        arch: ModelArchConfig,
        compute_dtype: ComputeDtype,
        params: BTreeMap<String, Parameter>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            arch,
            compute_dtype,
            params,
            gradient_checkpointing: false,
        }
    }

    /// Load safetensors shards, quantizing eligible linear weights per `quant`.
    pub fn load(
        model_id: &str,
        arch: ModelArchConfig,
        weight_files: &[PathBuf],
        quant: &QuantizationConfig,
    ) -> ModelResult<Self> {
        quant.validate()?;
        if weight_files.is_empty() {
            return Err(ModelError::Hub(format!("no weight files found for {model_id}")));
        }

        let quantizer = BlockQuantizer::from_config(quant);
        let mut params = BTreeMap::new();

        for path in weight_files {
            let bytes = std::fs::read(path)?;
            let tensors = SafeTensors::deserialize(&bytes)?;
            for (name, view) in tensors.tensors() {
                let shape = view.shape().to_vec();
                let data = decode_tensor(&name, view.dtype(), view.data())?;

                let weight = if quant.load_in_4bit && is_quantizable(&name, &shape) {
                    Weight::Quantized(quantizer.quantize(&data, &shape)?)
                } else {
                    Weight::Dense { shape, data }
                };
                params.insert(name, Parameter { weight, trainable: true });
            }
            debug!(file = %path.display(), "loaded weight shard");
        }

        let model = Self::new(model_id, arch, quant.compute_dtype, params);
        info!(
            model_id = %model.model_id,
            params = model.num_parameters(),
            quantized_tensors = model.params.values().filter(|p| p.weight.is_quantized()).count(),
            "model loaded"
        );
        Ok(model)
    }

    /// Freeze every parameter and record the gradient checkpointing choice.
    pub fn prepare_for_kbit_training(&mut self, gradient_checkpointing: bool) {
        for p in self.params.values_mut() {
            p.trainable = false;
        }
        self.gradient_checkpointing = gradient_checkpointing;
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[must_use]
    pub fn arch(&self) -> &ModelArchConfig {
        &self.arch
    }

    #[must_use]
    pub fn compute_dtype(&self) -> ComputeDtype {
        self.compute_dtype
    }

    #[must_use]
    pub fn gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, Parameter> {
        &self.params
    }

    pub(crate) fn params_mut(&mut self) -> &mut BTreeMap<String, Parameter> {
        &mut self.params
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Logical element count across all parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.params.values().map(|p| p.weight.numel()).sum()
    }

    #[must_use]
    pub fn num_trainable_parameters(&self) -> usize {
        self.params.values().filter(|p| p.trainable).map(|p| p.weight.numel()).sum()
    }

    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.params.values().map(|p| p.weight.memory_bytes(self.compute_dtype)).sum()
    }
}

fn is_quantizable(name: &str, shape: &[usize]) -> bool {
    if shape.len() != 2 {
        return false;
    }
    let Some(module) = name.strip_suffix(".weight") else {
        return false;
    };
    let leaf = module.rsplit('.').next().unwrap_or(module);
    !QUANT_SKIP_MODULES.contains(&leaf) && !leaf.contains("norm")
}

fn decode_tensor(name: &str, dtype: Dtype, bytes: &[u8]) -> ModelResult<Vec<f32>> {
    let out = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        other => {
            return Err(ModelError::Config(format!(
                "tensor {name} has unsupported dtype {other:?}"
            )));
        }
    };
    Ok(out)
}
