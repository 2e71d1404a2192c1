//! Low-rank adapter injection.
//!
//! For every targeted projection `W: [out, in]` the adapted layer computes
//! `y = x·Wᵀ + scale · (x·Aᵀ)·Bᵀ` with `A: [r, in]`, `B: [out, r]` and
//! `scale = alpha / r` (or `alpha / sqrt(r)` with rsLoRA). `B` starts at zero,
//! so the adapted model matches the base model until the first update.

use crate::error::{ModelError, ModelResult};
use crate::model::{QuantizedModel, Weight};
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoraBias {
    /// No bias parameters are trained.
    #[default]
    None,
    /// Every bias in the model is trained.
    All,
    /// Only biases of adapted modules are trained.
    LoraOnly,
}

impl LoraBias {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::All => "all",
            Self::LoraOnly => "lora_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    CausalLm,
}

impl TaskType {
    #[must_use]
    pub fn as_peft_str(self) -> &'static str {
        match self {
            Self::CausalLm => "CAUSAL_LM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default = "default_r")]
    pub r: usize,

    #[serde(default = "default_alpha")]
    pub alpha: f32,

    #[serde(default = "default_dropout")]
    pub dropout: f32,

    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,

    #[serde(default)]
    pub bias: LoraBias,

    #[serde(default)]
    pub task_type: TaskType,

    #[serde(default)]
    pub use_rslora: bool,

    /// Seed for adapter initialization.
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
}

fn default_r() -> usize {
    8
}
fn default_alpha() -> f32 {
    16.0
}
fn default_dropout() -> f32 {
    0.05
}
fn default_init_seed() -> u64 {
    42
}
fn default_target_modules() -> Vec<String> {
    ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: default_r(),
            alpha: default_alpha(),
            dropout: default_dropout(),
            target_modules: default_target_modules(),
            bias: LoraBias::None,
            task_type: TaskType::CausalLm,
            use_rslora: false,
            init_seed: default_init_seed(),
        }
    }
}

impl LoraConfig {
    pub fn validate(&self) -> ModelResult<()> {
        if self.r == 0 {
            return Err(ModelError::Config("lora r must be >= 1".to_string()));
        }
        if !self.alpha.is_finite() || self.alpha <= 0.0 {
            return Err(ModelError::Config("lora alpha must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ModelError::Config("lora dropout must be in [0, 1)".to_string()));
        }
        if self.target_modules.is_empty() {
            return Err(ModelError::Config("lora target_modules must not be empty".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn scaling(&self) -> f32 {
        if self.use_rslora {
            self.alpha / (self.r as f32).sqrt()
        } else {
            self.alpha / self.r as f32
        }
    }
}

/// Trainable low-rank pair attached to one frozen projection.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraLayer {
    /// `[r, in_features]`
    pub lora_a: Array2<f32>,
    /// `[out_features, r]`
    pub lora_b: Array2<f32>,
    pub scale: f32,
    pub dropout: f32,
}

impl LoraLayer {
    fn init(out_features: usize, in_features: usize, config: &LoraConfig, rng: &mut StdRng) -> Self {
        // Kaiming-uniform bound for A; B is zero.
        let bound = (3.0_f32 / in_features as f32).sqrt();
        let lora_a = Array2::from_shape_fn((config.r, in_features), |_| rng.gen_range(-bound..bound));
        let lora_b = Array2::zeros((out_features, config.r));
        Self { lora_a, lora_b, scale: config.scaling(), dropout: config.dropout }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.lora_a.nrows()
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.lora_a.ncols()
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.lora_b.nrows()
    }

    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.lora_a.len() + self.lora_b.len()
    }

    /// `scale · B·A`, the dense update this adapter adds to `W`.
    #[must_use]
    pub fn delta_weight(&self) -> Array2<f32> {
        self.lora_b.dot(&self.lora_a) * self.scale
    }
}

/// Summary line in the familiar PEFT format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainableSummary {
    pub trainable: usize,
    pub total: usize,
}

impl TrainableSummary {
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 { 0.0 } else { 100.0 * self.trainable as f64 / self.total as f64 }
    }
}

impl fmt::Display for TrainableSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.percent()
        )
    }
}

/// A frozen base model with adapters attached. There is no way back to the
/// plain base model short of [`AdaptedModel::discard_adapters`].
#[derive(Debug, Clone)]
pub struct AdaptedModel {
    base: QuantizedModel,
    config: LoraConfig,
    /// Keyed by module path, e.g. `model.layers.0.self_attn.q_proj`.
    adapters: BTreeMap<String, LoraLayer>,
}

impl AdaptedModel {
    #[must_use]
    pub fn base(&self) -> &QuantizedModel {
        &self.base
    }

    #[must_use]
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    #[must_use]
    pub fn adapters(&self) -> &BTreeMap<String, LoraLayer> {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut BTreeMap<String, LoraLayer> {
        &mut self.adapters
    }

    #[must_use]
    pub fn adapter_parameters(&self) -> usize {
        self.adapters.values().map(LoraLayer::num_parameters).sum()
    }

    /// Base parameters plus adapter parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.base.num_parameters() + self.adapter_parameters()
    }

    /// Adapter parameters plus any base parameters the bias policy unfroze.
    #[must_use]
    pub fn num_trainable_parameters(&self) -> usize {
        self.adapter_parameters() + self.base.num_trainable_parameters()
    }

    #[must_use]
    pub fn trainable_summary(&self) -> TrainableSummary {
        TrainableSummary { trainable: self.num_trainable_parameters(), total: self.num_parameters() }
    }

    /// Base parameters the bias policy unfroze, by full parameter name.
    pub fn trainable_biases(&self) -> impl Iterator<Item = (&str, &[f32])> + '_ {
        self.base.params().iter().filter(|(_, p)| p.trainable).filter_map(|(name, p)| match &p.weight {
            Weight::Dense { data, .. } => Some((name.as_str(), data.as_slice())),
            Weight::Quantized(_) => None,
        })
    }

    /// Overwrite a trainable bias. Frozen or unknown parameters are rejected.
    pub fn set_trainable_bias(&mut self, name: &str, values: &[f32]) -> ModelResult<()> {
        let param = self
            .base
            .params_mut()
            .get_mut(name)
            .ok_or_else(|| ModelError::Config(format!("unknown parameter {name}")))?;
        if !param.trainable {
            return Err(ModelError::Config(format!("parameter {name} is frozen")));
        }
        match &mut param.weight {
            Weight::Dense { data, .. } if data.len() == values.len() => {
                data.copy_from_slice(values);
                Ok(())
            }
            Weight::Dense { data, .. } => Err(ModelError::ShapeMismatch(format!(
                "{name}: expected {} values, got {}",
                data.len(),
                values.len()
            ))),
            Weight::Quantized(_) => Err(ModelError::Config(format!("parameter {name} is quantized"))),
        }
    }

    /// Adapted projection forward for a batch `x: [n, in]`, returning `[n, out]`.
    pub fn forward(&self, module: &str, x: ArrayView2<'_, f32>) -> ModelResult<Array2<f32>> {
        let weight_name = format!("{module}.weight");
        let param = self
            .base
            .get(&weight_name)
            .ok_or_else(|| ModelError::Config(format!("unknown module {module}")))?;
        let shape = param.weight.shape();
        let (out_f, in_f) = (shape[0], shape[1]);
        if x.ncols() != in_f {
            return Err(ModelError::ShapeMismatch(format!(
                "{module} expects {in_f} input features, got {}",
                x.ncols()
            )));
        }

        let w = Array2::from_shape_vec((out_f, in_f), param.weight.to_f32())
            .map_err(|e| ModelError::ShapeMismatch(e.to_string()))?;
        let mut y = x.dot(&w.t());

        if let Some(bias) = self.base.get(&format!("{module}.bias")) {
            let b = Array1::from_vec(bias.weight.to_f32());
            y += &b;
        }

        if let Some(layer) = self.adapters.get(module) {
            let xa = x.dot(&layer.lora_a.t());
            y = y + xa.dot(&layer.lora_b.t()) * layer.scale;
        }
        Ok(y)
    }

    /// Drop the adapters and hand back the frozen base model.
    #[must_use]
    pub fn discard_adapters(self) -> QuantizedModel {
        self.base
    }
}

/// Attaches LoRA adapters to a provisioned base model.
#[derive(Debug, Clone)]
pub struct AdapterInjector {
    config: LoraConfig,
}

impl AdapterInjector {
    pub fn new(config: LoraConfig) -> ModelResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Freeze the base, insert adapters at every matching projection, and
    /// unfreeze biases according to the bias policy.
    pub fn inject(&self, mut base: QuantizedModel) -> ModelResult<AdaptedModel> {
        let mut rng = StdRng::seed_from_u64(self.config.init_seed);

        let targets: Vec<(String, usize, usize)> = base
            .params()
            .iter()
            .filter_map(|(name, p)| {
                let module = name.strip_suffix(".weight")?;
                let shape = p.weight.shape();
                (shape.len() == 2 && self.is_target(module))
                    .then(|| (module.to_string(), shape[0], shape[1]))
            })
            .collect();

        if targets.is_empty() {
            return Err(ModelError::Config(format!(
                "none of the target modules {:?} exist in {}",
                self.config.target_modules,
                base.model_id()
            )));
        }

        let mut adapters = BTreeMap::new();
        for (module, out_f, in_f) in targets {
            adapters.insert(module, LoraLayer::init(out_f, in_f, &self.config, &mut rng));
        }

        for (name, param) in base.params_mut().iter_mut() {
            param.trainable = match (self.config.bias, name.strip_suffix(".bias")) {
                (LoraBias::All, Some(_)) => true,
                (LoraBias::LoraOnly, Some(module)) => adapters.contains_key(module),
                _ => false,
            };
        }

        let model = AdaptedModel { base, config: self.config.clone(), adapters };
        info!(
            adapters = model.adapters.len(),
            rank = self.config.r,
            summary = %model.trainable_summary(),
            "lora adapters injected"
        );
        Ok(model)
    }

    fn is_target(&self, module: &str) -> bool {
        let leaf = module.rsplit('.').next().unwrap_or(module);
        self.config.target_modules.iter().any(|t| t == leaf)
    }
}
