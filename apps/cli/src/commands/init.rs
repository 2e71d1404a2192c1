//! Init command implementation.
//!
//! Writes a starter job file.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use std::path::PathBuf;

pub const JOB_FILE: &str = "ragtune.toml";

pub const TEMPLATE: &str = r#"# RagTune job file.

[model]
# Hub repository id or a local directory with config.json, tokenizer.json and safetensors weights.
model_id = "mistralai/Mistral-7B-v0.1"
padding_side = "right"

[dataset]
# "hub", "jsonl" or "parquet". Local sources take `path = "..."` instead.
type = "hub"
dataset_id = "databricks/databricks-dolly-15k"
split = "train"
# max_records = 1000

[quantization]
load_in_4bit = true
quant_type = "nf4"
double_quant = true
compute_dtype = "bf16"

[lora]
r = 8
alpha = 16.0
dropout = 0.05
target_modules = ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"]
bias = "none"
task_type = "causal_lm"

[training]
output_dir = "outputs"
num_train_epochs = 1
per_device_train_batch_size = 4
gradient_accumulation_steps = 2
gradient_checkpointing = true
optim = "paged_adamw_32bit"
logging_steps = 10
save_steps = 100
# 0 keeps every checkpoint.
save_total_limit = 3
learning_rate = 2e-4
bf16 = true
max_grad_norm = 0.3
warmup_steps = 10
lr_scheduler_type = "constant"
seed = 42
# "candle" trains the adapters; "dry_run" walks the schedule without updating weights.
backend = "candle"

[sft]
max_seq_length = 2048
packing = true
"#;

pub fn execute(path: Option<PathBuf>, force: bool) -> Result<()> {
    let dir = path.unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let target = dir.join(JOB_FILE);
    if target.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", target.display());
    }
    std::fs::write(&target, TEMPLATE).with_context(|| format!("Failed to write {}", target.display()))?;

    println!("{} {}", "Wrote".green().bold(), target.display());
    println!("  {}", "Next: edit the job file, then run `ragtune train`.".dimmed());
    Ok(())
}
