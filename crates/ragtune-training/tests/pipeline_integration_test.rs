use ragtune_models::HubClient;
use ragtune_training::{
    discover_runs, ArtifactKind, BackendKind, DatasetSource, FineTunePipeline, ResumeFrom, RunStatus,
    TracingProgressSink, TrainerStatus, TrainingJobSpec,
};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

const TOKENIZER: &str = r####"{
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

fn write_model_dir(dir: &Path, hidden: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let mut tensors: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    let mut push = |name: &str, shape: Vec<usize>| {
        let n: usize = shape.iter().product();
        let bytes: Vec<u8> = (0..n)
            .flat_map(|i| (((i % 13) as f32 - 6.0) / 50.0).to_le_bytes())
            .collect();
        tensors.push((name.to_string(), shape, bytes));
    };
    push("model.embed_tokens.weight", vec![20, hidden]);
    for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
        push(&format!("model.layers.0.self_attn.{proj}.weight"), vec![hidden, hidden]);
    }
    push("model.layers.0.input_layernorm.weight", vec![hidden]);
    push("lm_head.weight", vec![20, hidden]);

    let views: Vec<(String, TensorView<'_>)> = tensors
        .iter()
        .map(|(name, shape, bytes)| (name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap()))
        .collect();
    let bytes = safetensors::serialize(views, Some(HashMap::new())).unwrap();
    std::fs::write(dir.join("model.safetensors"), bytes).unwrap();
    std::fs::write(
        dir.join("config.json"),
        format!(r#"{{"model_type":"llama","hidden_size":{hidden},"num_hidden_layers":1,"vocab_size":20}}"#),
    )
    .unwrap();
    std::fs::write(dir.join("tokenizer.json"), TOKENIZER).unwrap();
    std::fs::write(dir.join("tokenizer_config.json"), r#"{"eos_token": "</s>"}"#).unwrap();
}

fn write_dataset(path: &Path) {
    let mut lines = Vec::new();
    for i in 0..16 {
        let category = match i % 4 {
            0 => "closed_qa",
            1 => "information_extraction",
            2 => "open_qa",
            _ => "brainstorming",
        };
        lines.push(format!(
            r#"{{"instruction":"summarize this","context":"the sky is blue.","response":"Sky: blue.","category":"{category}"}}"#
        ));
    }
    std::fs::write(path, lines.join("\n")).unwrap();
}

fn job(temp: &Path) -> (TrainingJobSpec, PathBuf) {
    let model_dir = temp.join("toy-model");
    write_model_dir(&model_dir, 16);
    let data = temp.join("dolly.jsonl");
    write_dataset(&data);

    let mut job = TrainingJobSpec::new(model_dir.display().to_string(), DatasetSource::Jsonl { path: data });
    let run_dir = temp.join("runs").join("rag");
    job.training.output_dir = run_dir.clone();
    job.training.save_steps = 2;
    job.sft.max_seq_length = 16;
    (job, run_dir)
}

#[tokio::test]
async fn test_pipeline_runs_end_to_end_on_local_model() {
    let temp = TempDir::new().unwrap();
    let (job, run_dir) = job(temp.path());

    let pipeline = FineTunePipeline::new(job, HubClient::new(None).unwrap());
    let outcome = pipeline.run(&ResumeFrom::None, &TracingProgressSink).await.unwrap();

    // 12 kept records x 27 tokens / 16 = 20 sequences; 5 micro-batches of 4; 3 steps.
    assert_eq!(outcome.train.status, TrainerStatus::Finished);
    assert_eq!(outcome.train.global_step, 3);
    assert_eq!(outcome.manifest.status, RunStatus::Finished);
    assert_eq!(outcome.manifest.dataset_stats.kept, 12);
    assert_eq!(outcome.manifest.dataset_stats.dropped, 4);
    assert_eq!(outcome.manifest.metrics.sequences, 20);
    assert!(outcome.manifest.metrics.trainable_params < outcome.manifest.metrics.total_params);

    assert!(run_dir.join("adapter").join("adapter_config.json").exists());
    assert!(run_dir.join("adapter").join("adapter_model.safetensors").exists());
    assert!(run_dir.join("checkpoint-2").join("trainer_state.json").exists());
    assert!(run_dir.join("dataset.jsonl").exists());
    assert!(outcome.manifest.artifact(ArtifactKind::Adapter).is_some());

    let runs = discover_runs(&temp.path().join("runs")).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].adapter_dir, Some(run_dir.join("adapter")));
}

/// Sum of `|x|` over every `lora_B` tensor in a saved adapter.
fn lora_b_magnitude(adapter_dir: &Path) -> f32 {
    let bytes = std::fs::read(adapter_dir.join("adapter_model.safetensors")).unwrap();
    let tensors = SafeTensors::deserialize(&bytes).unwrap();
    let mut seen = 0;
    let mut total = 0.0;
    for (name, view) in tensors.tensors() {
        if !name.contains("lora_B") {
            continue;
        }
        seen += 1;
        total += view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]).abs())
            .sum::<f32>();
    }
    assert_eq!(seen, 4, "one lora_B per attention projection");
    total
}

#[tokio::test]
async fn test_default_backend_trains_adapter_weights() {
    let temp = TempDir::new().unwrap();
    let (job, run_dir) = job(temp.path());
    assert_eq!(job.training.backend, BackendKind::Candle);

    let pipeline = FineTunePipeline::new(job, HubClient::new(None).unwrap());
    let outcome = pipeline.run(&ResumeFrom::None, &TracingProgressSink).await.unwrap();

    let loss = outcome.manifest.metrics.train_loss.unwrap();
    assert!(loss.is_finite() && loss > 0.0);
    assert!(lora_b_magnitude(&run_dir.join("adapter")) > 0.0);
}

#[tokio::test]
async fn test_dry_run_backend_leaves_adapter_untrained() {
    let temp = TempDir::new().unwrap();
    let (mut job, run_dir) = job(temp.path());
    job.training.backend = BackendKind::DryRun;

    let pipeline = FineTunePipeline::new(job, HubClient::new(None).unwrap());
    let outcome = pipeline.run(&ResumeFrom::None, &TracingProgressSink).await.unwrap();

    assert_eq!(outcome.train.status, TrainerStatus::Finished);
    assert_eq!(lora_b_magnitude(&run_dir.join("adapter")), 0.0);
}

#[tokio::test]
async fn test_pipeline_cancelled_before_first_step() {
    let temp = TempDir::new().unwrap();
    let (job, run_dir) = job(temp.path());

    let pipeline = FineTunePipeline::new(job, HubClient::new(None).unwrap());
    pipeline.cancel_flag().store(true, Ordering::SeqCst);
    let outcome = pipeline.run(&ResumeFrom::None, &TracingProgressSink).await.unwrap();

    assert_eq!(outcome.train.status, TrainerStatus::Cancelled);
    assert_eq!(outcome.manifest.status, RunStatus::Cancelled);
    assert!(run_dir.join("checkpoint-0").exists());
    assert!(!run_dir.join("adapter").exists());
    assert!(outcome.manifest.artifact(ArtifactKind::Adapter).is_none());
}

#[tokio::test]
async fn test_pipeline_rejects_left_padding() {
    let temp = TempDir::new().unwrap();
    let (mut job, _) = job(temp.path());
    job.model.padding_side = ragtune_models::PaddingSide::Left;

    let pipeline = FineTunePipeline::new(job, HubClient::new(None).unwrap());
    let err = pipeline.run(&ResumeFrom::None, &TracingProgressSink).await.unwrap_err();
    assert!(err.to_string().contains("left padding"));
}
