//! Blockwise 4-bit weight quantization (NF4 / FP4).
//!
//! Weights are split into fixed-size blocks. Each block is scaled by its
//! absolute maximum and every value is mapped to the nearest entry of a
//! 16-level code book, stored two codes per byte. With double quantization
//! the per-block absmax values are themselves stored as 8-bit integers with a
//! shared offset and scale.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};

/// NF4 code book: 16 levels with equal probability mass under N(0, 1).
pub const NF4_CODE: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// FP4 (E2M1) code book normalised to [-1, 1], sorted ascending.
/// Carries both signed zeros, so the zero level appears twice.
pub const FP4_CODE: [f32; 16] = [
    -1.0,
    -0.666_666_7,
    -0.5,
    -0.333_333_34,
    -0.25,
    -0.166_666_67,
    -0.083_333_336,
    -0.0,
    0.0,
    0.083_333_336,
    0.166_666_67,
    0.25,
    0.333_333_34,
    0.5,
    0.666_666_7,
    1.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    #[default]
    Nf4,
    Fp4,
}

impl QuantType {
    #[must_use]
    pub fn code_book(self) -> &'static [f32; 16] {
        match self {
            Self::Nf4 => &NF4_CODE,
            Self::Fp4 => &FP4_CODE,
        }
    }
}

/// Dtype used for activations (and for dense, non-quantized parameters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDtype {
    F32,
    F16,
    #[default]
    Bf16,
}

impl ComputeDtype {
    #[must_use]
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::Bf16 => 2,
        }
    }
}

/// Quantization policy applied when the base model is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    #[serde(default = "default_true")]
    pub load_in_4bit: bool,

    #[serde(default)]
    pub quant_type: QuantType,

    #[serde(default = "default_true")]
    pub double_quant: bool,

    #[serde(default)]
    pub compute_dtype: ComputeDtype,

    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_block_size() -> usize {
    64
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            load_in_4bit: true,
            quant_type: QuantType::Nf4,
            double_quant: true,
            compute_dtype: ComputeDtype::Bf16,
            block_size: default_block_size(),
        }
    }
}

impl QuantizationConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.double_quant && !self.load_in_4bit {
            return Err(ModelError::Config(
                "double_quant requires load_in_4bit".to_string(),
            ));
        }
        if !self.block_size.is_power_of_two() || !(16..=4096).contains(&self.block_size) {
            return Err(ModelError::Config(format!(
                "block_size must be a power of two in [16, 4096], got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}

/// Per-block absmax scales, plain or 8-bit double-quantized.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockScales {
    Plain(Vec<f32>),
    Double { codes: Vec<u8>, offset: f32, scale: f32 },
}

impl BlockScales {
    fn double_quantize(absmax: &[f32]) -> Self {
        let offset = absmax.iter().copied().fold(f32::INFINITY, f32::min);
        let max = absmax.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let scale = (max - offset) / 255.0;

        let codes = absmax
            .iter()
            .map(|&v| {
                if scale > 0.0 {
                    ((v - offset) / scale).round().clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            })
            .collect();

        Self::Double { codes, offset, scale }
    }

    #[must_use]
    pub fn values(&self) -> Vec<f32> {
        match self {
            Self::Plain(v) => v.clone(),
            Self::Double { codes, offset, scale } => {
                codes.iter().map(|&c| f32::from(c) * scale + offset).collect()
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Plain(v) => v.len(),
            Self::Double { codes, .. } => codes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn memory_bytes(&self) -> usize {
        match self {
            Self::Plain(v) => v.len() * 4,
            Self::Double { codes, .. } => codes.len() + 8,
        }
    }
}

/// A tensor stored as packed 4-bit codes plus block scales.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub quant_type: QuantType,
    pub shape: Vec<usize>,
    pub block_size: usize,
    /// Two codes per byte, low nibble first.
    pub packed: Vec<u8>,
    pub scales: BlockScales,
}

impl QuantizedTensor {
    /// Number of logical elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.packed.len() + self.scales.memory_bytes()
    }

    /// Ratio of f32 size to stored size.
    #[must_use]
    pub fn compression_ratio(&self) -> f32 {
        let stored = self.memory_bytes().max(1);
        (self.numel() * 4) as f32 / stored as f32
    }

    fn code_at(&self, idx: usize) -> u8 {
        let byte = self.packed[idx / 2];
        if idx % 2 == 0 { byte & 0x0F } else { byte >> 4 }
    }
}

/// Quantizes f32 data into blockwise 4-bit codes.
#[derive(Debug, Clone)]
pub struct BlockQuantizer {
    quant_type: QuantType,
    block_size: usize,
    double_quant: bool,
}

impl BlockQuantizer {
    #[must_use]
    pub fn new(quant_type: QuantType, block_size: usize, double_quant: bool) -> Self {
        Self { quant_type, block_size, double_quant }
    }

    #[must_use]
    pub fn from_config(config: &QuantizationConfig) -> Self {
        Self::new(config.quant_type, config.block_size, config.double_quant)
    }

    /// Index of the nearest code book entry.
    #[inline]
    fn nearest_code(code_book: &[f32; 16], value: f32) -> u8 {
        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for (i, &c) in code_book.iter().enumerate() {
            let d = (value - c).abs();
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best as u8
    }

    pub fn quantize(&self, data: &[f32], shape: &[usize]) -> ModelResult<QuantizedTensor> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(ModelError::ShapeMismatch(format!(
                "shape {:?} implies {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }

        let code_book = self.quant_type.code_book();
        let mut absmax = Vec::with_capacity(data.len().div_ceil(self.block_size));
        let mut packed = vec![0u8; data.len().div_ceil(2)];

        for (block_idx, block) in data.chunks(self.block_size).enumerate() {
            let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            absmax.push(amax);
            let inv = if amax > 0.0 { 1.0 / amax } else { 0.0 };

            for (j, &v) in block.iter().enumerate() {
                let idx = block_idx * self.block_size + j;
                let code = Self::nearest_code(code_book, v * inv);
                if idx % 2 == 0 {
                    packed[idx / 2] |= code;
                } else {
                    packed[idx / 2] |= code << 4;
                }
            }
        }

        let scales = if self.double_quant {
            BlockScales::double_quantize(&absmax)
        } else {
            BlockScales::Plain(absmax)
        };

        Ok(QuantizedTensor {
            quant_type: self.quant_type,
            shape: shape.to_vec(),
            block_size: self.block_size,
            packed,
            scales,
        })
    }
}

/// Expand a quantized tensor back to f32 values.
#[must_use]
pub fn dequantize(tensor: &QuantizedTensor) -> Vec<f32> {
    let code_book = tensor.quant_type.code_book();
    let absmax = tensor.scales.values();
    (0..tensor.numel())
        .map(|i| {
            let scale = absmax[i / tensor.block_size];
            code_book[tensor.code_at(i) as usize] * scale
        })
        .collect()
}
