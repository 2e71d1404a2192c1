//! Tiny in-memory model and tokenizer for unit tests.

use ragtune_models::{
    AdaptedModel, AdapterInjector, ComputeDtype, LoraBias, LoraConfig, ModelArchConfig, PaddingSide, Parameter,
    QuantizedModel, TrainingTokenizer, Weight,
};
use std::collections::BTreeMap;

pub(crate) const TOY_TOKENIZER: &str = r####"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"<unk>": 0, "</s>": 1, "###": 2, "Context": 3, "Question": 4, "Response": 5,
              "the": 6, "sky": 7, "is": 8, "blue": 9, ".": 10, "Using": 11, "only": 12,
              "context": 13, "above": 14, ",": 15, "summarize": 16, "this": 17, "Sky": 18, ":": 19},
    "unk_token": "<unk>"
  }
}"####;

pub(crate) fn toy_tokenizer() -> TrainingTokenizer {
    TrainingTokenizer::from_bytes(TOY_TOKENIZER.as_bytes(), PaddingSide::Right).unwrap()
}

fn dense(shape: Vec<usize>) -> Parameter {
    let n = shape.iter().product();
    Parameter { weight: Weight::Dense { shape, data: vec![0.01; n] }, trainable: true }
}

pub(crate) fn toy_model(hidden: usize) -> AdaptedModel {
    let mut params = BTreeMap::new();
    params.insert("model.embed_tokens.weight".to_string(), dense(vec![20, hidden]));
    for proj in ["q_proj", "v_proj"] {
        params.insert(format!("model.layers.0.self_attn.{proj}.weight"), dense(vec![hidden, hidden]));
    }
    let mut base = QuantizedModel::new("toy", ModelArchConfig::default(), ComputeDtype::F32, params);
    base.prepare_for_kbit_training(false);

    let config = LoraConfig { r: 2, target_modules: vec!["q_proj".into(), "v_proj".into()], ..Default::default() };
    AdapterInjector::new(config).unwrap().inject(base).unwrap()
}

fn varied(shape: Vec<usize>, salt: usize) -> Parameter {
    let n: usize = shape.iter().product();
    let data = (0..n).map(|i| ((i * 7 + salt) % 11) as f32 / 20.0 - 0.25).collect();
    Parameter { weight: Weight::Dense { shape, data }, trainable: true }
}

/// One attention layer with distinct weights, enough for gradients to flow.
pub(crate) fn toy_lm(hidden: usize, bias: LoraBias) -> AdaptedModel {
    let mut params = BTreeMap::new();
    params.insert("model.embed_tokens.weight".to_string(), varied(vec![20, hidden], 1));
    for (salt, proj) in ["q_proj", "k_proj", "v_proj", "o_proj"].into_iter().enumerate() {
        params.insert(format!("model.layers.0.self_attn.{proj}.weight"), varied(vec![hidden, hidden], salt + 2));
    }
    params.insert("model.layers.0.self_attn.q_proj.bias".to_string(), varied(vec![hidden], 9));
    params.insert("lm_head.weight".to_string(), varied(vec![20, hidden], 3));
    let mut base = QuantizedModel::new("toy-lm", ModelArchConfig::default(), ComputeDtype::F32, params);
    base.prepare_for_kbit_training(false);

    let config = LoraConfig {
        r: 4,
        alpha: 8.0,
        dropout: 0.0,
        target_modules: vec!["q_proj".into(), "v_proj".into()],
        bias,
        ..Default::default()
    };
    AdapterInjector::new(config).unwrap().inject(base).unwrap()
}
