//! Step backend that trains the adapters with candle.
//!
//! The frozen base weights are dequantized once into f32 tensors. LoRA
//! matrices and any bias the bias policy unfroze become [`Var`]s, so a
//! backward pass only produces gradients for what the optimizer may touch.
//!
//! The forward pass is a compact pre-norm decoder over the standard
//! llama-style parameter names: token embedding, per-layer single-head causal
//! attention over `q/k/v/o_proj`, a gated MLP over `gate/up/down_proj` where
//! present, a final RMS norm, and `lm_head` (or the tied embedding). Every
//! projection adds its adapter delta `scale · B·A·dropout(x)`.

use crate::backend::{OptimizerUpdate, StepBackend};
use crate::error::{TrainingError, TrainingResult};
use crate::job::OptimizerKind;
use crate::packing::{TrainingSequence, IGNORE_INDEX};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use ragtune_models::AdaptedModel;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

const RMS_EPS: f64 = 1e-6;
const MASK_VALUE: f32 = -1e9;
const PROJECTIONS: [&str; 7] = ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"];

struct LoraVars {
    a: Var,
    b: Var,
    scale: f64,
    dropout: f32,
}

/// Tensors for one model, built from an [`AdaptedModel`] on first use.
struct Graph {
    device: Device,
    frozen: HashMap<String, Tensor>,
    biases: BTreeMap<String, Var>,
    adapters: BTreeMap<String, LoraVars>,
    num_layers: usize,
}

impl Graph {
    fn build(model: &AdaptedModel, device: &Device) -> TrainingResult<Self> {
        let mut frozen = HashMap::new();
        let mut biases = BTreeMap::new();
        for (name, param) in model.base().params() {
            let shape = param.weight.shape().to_vec();
            let data = param.weight.to_f32();
            if param.trainable && !param.weight.is_quantized() {
                biases.insert(name.clone(), Var::from_vec(data, shape, device)?);
            } else {
                frozen.insert(name.clone(), Tensor::from_vec(data, shape, device)?);
            }
        }

        let mut adapters = BTreeMap::new();
        for (module, layer) in model.adapters() {
            if !reached_by_forward(module) {
                warn!(module = %module, "adapter sits outside the decoder graph and will not receive gradients");
            }
            let a = Var::from_vec(
                layer.lora_a.iter().copied().collect::<Vec<f32>>(),
                (layer.rank(), layer.in_features()),
                device,
            )?;
            let b = Var::from_vec(
                layer.lora_b.iter().copied().collect::<Vec<f32>>(),
                (layer.out_features(), layer.rank()),
                device,
            )?;
            adapters.insert(module.clone(), LoraVars { a, b, scale: f64::from(layer.scale), dropout: layer.dropout });
        }

        let num_layers = frozen
            .keys()
            .chain(biases.keys())
            .filter_map(|name| name.strip_prefix("model.layers.")?.split('.').next()?.parse::<usize>().ok())
            .max()
            .map_or(0, |last| last + 1);

        info!(
            frozen = frozen.len(),
            biases = biases.len(),
            adapters = adapters.len(),
            layers = num_layers,
            "candle graph built"
        );
        Ok(Self { device: device.clone(), frozen, biases, adapters, num_layers })
    }

    /// Trainable variables in a fixed order: A and B per adapter, then biases.
    fn vars(&self) -> Vec<Var> {
        self.adapters
            .values()
            .flat_map(|l| [l.a.clone(), l.b.clone()])
            .chain(self.biases.values().cloned())
            .collect()
    }

    fn param(&self, name: &str) -> Option<Tensor> {
        self.biases.get(name).map(|v| v.as_tensor().clone()).or_else(|| self.frozen.get(name).cloned())
    }

    /// `x·Wᵀ + b` plus the adapter delta. `None` when the module has no weight.
    fn linear(&self, module: &str, x: &Tensor) -> TrainingResult<Option<Tensor>> {
        let Some(w) = self.param(&format!("{module}.weight")) else {
            return Ok(None);
        };
        let mut y = x.matmul(&w.t()?)?;
        if let Some(bias) = self.param(&format!("{module}.bias")) {
            y = y.broadcast_add(&bias)?;
        }
        if let Some(lora) = self.adapters.get(module) {
            let dropped = if lora.dropout > 0.0 { candle_nn::ops::dropout(x, lora.dropout)? } else { x.clone() };
            let delta = dropped.matmul(&lora.a.as_tensor().t()?)?.matmul(&lora.b.as_tensor().t()?)?;
            y = y.add(&delta.affine(lora.scale, 0.0)?)?;
        }
        Ok(Some(y))
    }

    fn rms_norm(&self, weight: &str, x: &Tensor) -> TrainingResult<Tensor> {
        let rms = x.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, RMS_EPS)?.sqrt()?;
        let normed = x.broadcast_div(&rms)?;
        Ok(match self.param(weight) {
            Some(w) => normed.broadcast_mul(&w)?,
            None => normed,
        })
    }

    fn attention(&self, prefix: &str, x: &Tensor, mask: &Tensor) -> TrainingResult<Tensor> {
        let h = self.rms_norm(&format!("{prefix}.input_layernorm.weight"), x)?;
        let attn = format!("{prefix}.self_attn");
        let (Some(q), Some(k), Some(v)) = (
            self.linear(&format!("{attn}.q_proj"), &h)?,
            self.linear(&format!("{attn}.k_proj"), &h)?,
            self.linear(&format!("{attn}.v_proj"), &h)?,
        ) else {
            return Ok(x.clone());
        };
        let width = q.dim(1)?;
        let k = widen(&k, width)?;
        let v = widen(&v, width)?;

        let scores = q.matmul(&k.t()?)?.affine(1.0 / (width as f64).sqrt(), 0.0)?;
        let probs = candle_nn::ops::softmax(&scores.broadcast_add(mask)?, D::Minus1)?;
        let context = probs.matmul(&v)?;
        let out = self.linear(&format!("{attn}.o_proj"), &context)?.unwrap_or(context);
        Ok(x.add(&out)?)
    }

    fn mlp(&self, prefix: &str, x: &Tensor) -> TrainingResult<Tensor> {
        let h = self.rms_norm(&format!("{prefix}.post_attention_layernorm.weight"), x)?;
        let mlp = format!("{prefix}.mlp");
        let (Some(gate), Some(up)) =
            (self.linear(&format!("{mlp}.gate_proj"), &h)?, self.linear(&format!("{mlp}.up_proj"), &h)?)
        else {
            return Ok(x.clone());
        };
        let hidden = gate.silu()?.mul(&up)?;
        match self.linear(&format!("{mlp}.down_proj"), &hidden)? {
            Some(down) => Ok(x.add(&down)?),
            None => Ok(x.clone()),
        }
    }

    /// `[len, vocab]` logits for one sequence.
    fn logits(&self, input_ids: &[u32]) -> TrainingResult<Tensor> {
        let len = input_ids.len();
        let embed = self
            .param("model.embed_tokens.weight")
            .ok_or_else(|| TrainingError::Trainer("model has no model.embed_tokens.weight".to_string()))?;
        let ids = Tensor::from_slice(input_ids, len, &self.device)?;
        let mut x = embed.index_select(&ids, 0)?;

        let mask = causal_mask(len, &self.device)?;
        for layer in 0..self.num_layers {
            let prefix = format!("model.layers.{layer}");
            x = self.attention(&prefix, &x, &mask)?;
            x = self.mlp(&prefix, &x)?;
        }
        let x = self.rms_norm("model.norm.weight", &x)?;
        match self.linear("lm_head", &x)? {
            Some(logits) => Ok(logits),
            None => Ok(x.matmul(&embed.t()?)?),
        }
    }

    /// Mean next-token cross-entropy over labelled positions, or `None` when
    /// the batch has nothing to predict.
    fn loss(&self, batch: &[&TrainingSequence]) -> TrainingResult<Option<Tensor>> {
        let mut rows = Vec::with_capacity(batch.len());
        let mut targets = Vec::new();
        for seq in batch {
            let (positions, labels) = shifted_targets(seq);
            if positions.is_empty() {
                continue;
            }
            let logits = self.logits(&seq.input_ids)?;
            let index = Tensor::from_vec(positions, labels.len(), &self.device)?;
            rows.push(logits.index_select(&index, 0)?);
            targets.extend(labels);
        }
        if targets.is_empty() {
            return Ok(None);
        }
        let logits = Tensor::cat(&rows, 0)?;
        let count = targets.len();
        let targets = Tensor::from_vec(targets, count, &self.device)?;
        Ok(Some(candle_nn::loss::cross_entropy(&logits, &targets)?))
    }

    /// Copy the current variable values into the model.
    fn write_back(&self, model: &mut AdaptedModel) -> TrainingResult<()> {
        for (module, lora) in &self.adapters {
            let a = lora.a.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            let b = lora.b.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            let layer = model
                .adapters_mut()
                .get_mut(module)
                .ok_or_else(|| TrainingError::Trainer(format!("adapter {module} disappeared from the model")))?;
            if layer.lora_a.len() != a.len() || layer.lora_b.len() != b.len() {
                return Err(TrainingError::Trainer(format!("adapter {module} changed shape during training")));
            }
            layer.lora_a.iter_mut().zip(&a).for_each(|(dst, src)| *dst = *src);
            layer.lora_b.iter_mut().zip(&b).for_each(|(dst, src)| *dst = *src);
        }
        for (name, var) in &self.biases {
            let values = var.as_tensor().flatten_all()?.to_vec1::<f32>()?;
            model.set_trainable_bias(name, &values)?;
        }
        Ok(())
    }
}

fn reached_by_forward(module: &str) -> bool {
    if module == "lm_head" {
        return true;
    }
    module.starts_with("model.layers.")
        && module.rsplit('.').next().is_some_and(|leaf| PROJECTIONS.contains(&leaf))
}

/// Positions `t` whose label at `t + 1` counts, with those labels.
fn shifted_targets(seq: &TrainingSequence) -> (Vec<u32>, Vec<u32>) {
    seq.labels
        .iter()
        .skip(1)
        .enumerate()
        .filter(|(_, label)| **label != IGNORE_INDEX)
        .map(|(pos, label)| (pos as u32, *label as u32))
        .unzip()
}

fn causal_mask(len: usize, device: &Device) -> TrainingResult<Tensor> {
    let mask: Vec<f32> = (0..len)
        .flat_map(|row| (0..len).map(move |col| if col > row { MASK_VALUE } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (len, len), device)?)
}

/// Repeat grouped key/value features up to the query width.
fn widen(x: &Tensor, width: usize) -> TrainingResult<Tensor> {
    let have = x.dim(1)?;
    if have == width {
        return Ok(x.clone());
    }
    if have == 0 || width % have != 0 {
        return Err(TrainingError::Trainer(format!(
            "key/value width {have} does not divide query width {width}"
        )));
    }
    let copies = vec![x.clone(); width / have];
    Ok(Tensor::cat(&copies, 1)?)
}

enum StepOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl StepOptimizer {
    fn new(kind: OptimizerKind, vars: Vec<Var>, learning_rate: f64) -> TrainingResult<Self> {
        let adamw = |vars: Vec<Var>| {
            let params = ParamsAdamW { lr: learning_rate, weight_decay: 0.0, ..ParamsAdamW::default() };
            AdamW::new(vars, params).map(Self::AdamW)
        };
        Ok(match kind {
            OptimizerKind::Sgd => Self::Sgd(SGD::new(vars, learning_rate)?),
            OptimizerKind::Adafactor => {
                warn!("adafactor is not available, using adamw");
                adamw(vars)?
            }
            // Paged variants only differ in where the moments live.
            OptimizerKind::PagedAdamw32bit | OptimizerKind::PagedAdamw8bit | OptimizerKind::Adamw => adamw(vars)?,
        })
    }

    fn step(&mut self, learning_rate: f64, grads: &GradStore) -> TrainingResult<()> {
        match self {
            Self::AdamW(opt) => {
                opt.set_learning_rate(learning_rate);
                opt.step(grads)?;
            }
            Self::Sgd(opt) => {
                opt.set_learning_rate(learning_rate);
                opt.step(grads)?;
            }
        }
        Ok(())
    }
}

/// Trains the adapters (and unfrozen biases) on the CPU with candle.
///
/// Gradients from each micro-batch are summed, averaged over the window in
/// [`StepBackend::apply`], and clipped to `max_grad_norm` by global norm
/// before the optimizer runs. The model is updated after every step so
/// checkpoints always see the current weights.
pub struct CandleBackend {
    device: Device,
    graph: Option<Graph>,
    optimizer: Option<StepOptimizer>,
    grads: Vec<Option<Tensor>>,
    store: Option<GradStore>,
}

impl std::fmt::Debug for CandleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleBackend")
            .field("device", &self.device)
            .field("built", &self.graph.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for CandleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CandleBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { device: Device::Cpu, graph: None, optimizer: None, grads: Vec::new(), store: None }
    }

    /// Drop every tensor so the next micro-batch rebuilds from the model.
    fn reset(&mut self) {
        self.graph = None;
        self.optimizer = None;
        self.grads.clear();
        self.store = None;
    }
}

impl StepBackend for CandleBackend {
    fn id(&self) -> &'static str {
        "candle"
    }

    fn accumulate(&mut self, model: &AdaptedModel, batch: &[&TrainingSequence]) -> TrainingResult<f64> {
        if self.graph.is_none() {
            self.graph = Some(Graph::build(model, &self.device)?);
        }
        let Some(graph) = self.graph.as_ref() else {
            return Err(TrainingError::Trainer("candle graph missing".to_string()));
        };

        let Some(loss) = graph.loss(batch)? else {
            debug!("micro-batch has no labelled tokens");
            return Ok(0.0);
        };
        let value = f64::from(loss.to_scalar::<f32>()?);
        let grads = loss.backward()?;

        let vars = graph.vars();
        if self.grads.len() != vars.len() {
            self.grads = vec![None; vars.len()];
        }
        for (slot, var) in self.grads.iter_mut().zip(&vars) {
            if let Some(grad) = grads.get(var.as_tensor()) {
                *slot = Some(match slot.take() {
                    Some(sum) => sum.add(grad)?,
                    None => grad.clone(),
                });
            }
        }
        self.store = Some(grads);
        Ok(value)
    }

    fn apply(&mut self, model: &mut AdaptedModel, update: &OptimizerUpdate) -> TrainingResult<f64> {
        let (Some(graph), Some(mut store)) = (self.graph.as_ref(), self.store.take()) else {
            return Ok(0.0);
        };
        let vars = graph.vars();
        let window = update.accumulated.max(1) as f64;

        let mut averaged = Vec::with_capacity(vars.len());
        let mut squared = 0.0;
        for slot in &mut self.grads {
            let grad = match slot.take() {
                Some(sum) => {
                    let grad = sum.affine(1.0 / window, 0.0)?;
                    squared += f64::from(grad.sqr()?.sum_all()?.to_scalar::<f32>()?);
                    Some(grad)
                }
                None => None,
            };
            averaged.push(grad);
        }
        let grad_norm = squared.sqrt();
        let clip = if update.max_grad_norm > 0.0 && grad_norm > update.max_grad_norm {
            update.max_grad_norm / (grad_norm + 1e-6)
        } else {
            1.0
        };

        for (var, grad) in vars.iter().zip(averaged) {
            match grad {
                Some(grad) => {
                    store.insert(var.as_tensor(), grad.affine(clip, 0.0)?);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }

        if self.optimizer.is_none() {
            self.optimizer = Some(StepOptimizer::new(update.optimizer, vars, update.learning_rate)?);
        }
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.step(update.learning_rate, &store)?;
        }
        graph.write_back(model)?;

        debug!(step = update.step, grad_norm, clip, "candle step applied");
        Ok(grad_norm)
    }

    /// Optimizer moments are not persisted; they restart from zero on resume.
    fn load_state(&mut self, _checkpoint_dir: &Path) -> TrainingResult<()> {
        self.reset();
        Ok(())
    }
}
