//! Dataset loading and category filtering.

use crate::dataset::{compute_dataset_id, validate_records, Category, Dataset, DatasetId, DatasetSource, QaRecord, RawRecord};
use crate::error::{TrainingError, TrainingResult};
use arrow::array::{Array, StringArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ragtune_models::HubClient;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Categories that survive filtering.
    pub categories: Vec<Category>,
    /// Keep at most this many records after filtering.
    pub max_records: Option<usize>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { categories: Category::CONTEXT_GROUNDED.to_vec(), max_records: None }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadStats {
    pub total: usize,
    pub kept: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub records: Dataset,
    pub id: DatasetId,
    pub stats: LoadStats,
}

/// Load `source`, keep only the allowed categories, and hash the result.
pub async fn load_dataset(
    source: &DatasetSource,
    options: &LoadOptions,
    hub: &HubClient,
) -> TrainingResult<LoadedDataset> {
    let files = match source {
        DatasetSource::Hub { dataset_id, split, revision } => {
            hub.fetch_dataset_split(dataset_id, split, revision.as_deref()).await?
        }
        DatasetSource::Jsonl { path } | DatasetSource::Parquet { path } => vec![path.clone()],
    };
    load_files(source, &files, options)
}

/// Load from local files only. Hub sources are rejected.
pub fn load_local_dataset(source: &DatasetSource, options: &LoadOptions) -> TrainingResult<LoadedDataset> {
    match source {
        DatasetSource::Jsonl { path } | DatasetSource::Parquet { path } => {
            load_files(source, std::slice::from_ref(path), options)
        }
        DatasetSource::Hub { .. } => Err(TrainingError::InvalidSpec(
            "hub dataset sources need a hub client".to_string(),
        )),
    }
}

fn load_files(source: &DatasetSource, files: &[PathBuf], options: &LoadOptions) -> TrainingResult<LoadedDataset> {
    let mut raw = Vec::new();
    for path in files {
        if !path.exists() {
            return Err(TrainingError::Setup(format!("dataset file not found: {}", path.display())));
        }
        let before = raw.len();
        if is_parquet(path) {
            raw.extend(read_parquet_records(path)?);
        } else {
            raw.extend(read_jsonl_records(path)?);
        }
        debug!(file = %path.display(), rows = raw.len() - before, "read dataset file");
    }

    let (records, stats) = filter_records(raw, options);
    validate_records(&records)?;
    let id = compute_dataset_id(&records)?;

    info!(
        source = %source,
        total = stats.total,
        kept = stats.kept,
        dropped = stats.dropped,
        dataset_id = %id,
        "dataset loaded"
    );
    Ok(LoadedDataset { records, id, stats })
}

fn is_parquet(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("parquet")
}

/// Keep records whose category is allowed, projected to `QaRecord`.
#[must_use]
pub fn filter_records(raw: impl IntoIterator<Item = RawRecord>, options: &LoadOptions) -> (Dataset, LoadStats) {
    let mut stats = LoadStats::default();
    let mut records = Vec::new();

    for rec in raw {
        stats.total += 1;
        let under_cap = options.max_records.is_none_or(|max| records.len() < max);
        if under_cap && options.categories.contains(&rec.category) {
            records.push(QaRecord::from(rec));
        }
    }
    stats.kept = records.len();
    stats.dropped = stats.total - stats.kept;
    (records, stats)
}

/// Read raw records from a JSONL file. A `.json` file holding an array is accepted too.
pub fn read_jsonl_records(path: &Path) -> TrainingResult<Vec<RawRecord>> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(&contents)
            .map_err(|e| TrainingError::Dataset(format!("{}: {e}", path.display())));
    }

    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let rec: RawRecord = serde_json::from_str(line).map_err(|e| {
            TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        records.push(rec);
    }
    Ok(records)
}

/// Read raw records from a Parquet file. `context` may be absent or null.
pub fn read_parquet_records(path: &Path) -> TrainingResult<Vec<RawRecord>> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| TrainingError::Dataset(format!("{}: {e}", path.display())))?;

    let schema = builder.schema().clone();
    let column = |name: &str| {
        schema.index_of(name).map_err(|_| {
            TrainingError::Dataset(format!(
                "column '{name}' not found in {}; available: {:?}",
                path.display(),
                schema.fields().iter().map(|f| f.name()).collect::<Vec<_>>()
            ))
        })
    };
    let instruction_idx = column("instruction")?;
    let response_idx = column("response")?;
    let category_idx = column("category")?;
    let context_idx = schema.index_of("context").ok();

    let reader = builder
        .build()
        .map_err(|e| TrainingError::Dataset(format!("{}: {e}", path.display())))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| TrainingError::Dataset(format!("{}: {e}", path.display())))?;
        let strings = |idx: usize| {
            batch.column(idx).as_any().downcast_ref::<StringArray>().ok_or_else(|| {
                TrainingError::Dataset(format!("column {idx} in {} is not a string column", path.display()))
            })
        };
        let instruction = strings(instruction_idx)?;
        let response = strings(response_idx)?;
        let category = strings(category_idx)?;
        let context = context_idx.map(strings).transpose()?;

        for i in 0..batch.num_rows() {
            let category = serde_json::from_value(serde_json::Value::String(category.value(i).to_string()))?;
            records.push(RawRecord {
                instruction: instruction.value(i).to_string(),
                context: context.filter(|c| !c.is_null(i)).map(|c| c.value(i).to_string()),
                response: response.value(i).to_string(),
                category,
            });
        }
    }
    Ok(records)
}

pub fn write_jsonl(path: &Path, records: &[QaRecord]) -> TrainingResult<()> {
    let mut out = String::new();
    for rec in records {
        out.push_str(&serde_json::to_string(rec)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Read back a filtered dataset written by [`write_jsonl`].
pub fn read_jsonl(path: &Path) -> TrainingResult<Dataset> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|e| {
                TrainingError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::StringBuilder;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::arrow_writer::ArrowWriter;
    use std::sync::Arc;
    use tempfile::TempDir;

    const DOLLY_SAMPLE: &str = r#"{"instruction":"When was the tower built?","context":"The tower was built in 1889.","response":"1889","category":"closed_qa"}
{"instruction":"Name three birds","context":"","response":"Robin, crow, owl","category":"brainstorming"}
{"instruction":"Extract the city","context":"Paris is in France.","response":"Paris","category":"information_extraction"}
{"instruction":"Why is the sky blue?","context":"","response":"Rayleigh scattering","category":"open_qa"}
{"instruction":"Summarize","context":"Long text","response":"Short","category":"summarization"}
{"instruction":"Is it a fish?","context":"","response":"No","category":"classification"}
{"instruction":"Write a poem","context":"","response":"...","category":"creative_writing"}
{"instruction":"What is rust?","context":"","response":"A language","category":"general_qa"}
"#;

    fn write_sample(dir: &Path) -> PathBuf {
        let path = dir.join("dolly.jsonl");
        std::fs::write(&path, DOLLY_SAMPLE).unwrap();
        path
    }

    #[test]
    fn test_only_allowed_categories_survive() {
        let temp = TempDir::new().unwrap();
        let source = DatasetSource::Jsonl { path: write_sample(temp.path()) };
        let loaded = load_local_dataset(&source, &LoadOptions::default()).unwrap();

        assert_eq!(loaded.stats, LoadStats { total: 8, kept: 3, dropped: 5 });
        let instructions: Vec<&str> = loaded.records.iter().map(|r| r.instruction.as_str()).collect();
        assert_eq!(
            instructions,
            vec!["When was the tower built?", "Extract the city", "Why is the sky blue?"]
        );
    }

    #[test]
    fn test_only_instruction_context_response_are_kept() {
        let temp = TempDir::new().unwrap();
        let source = DatasetSource::Jsonl { path: write_sample(temp.path()) };
        let loaded = load_local_dataset(&source, &LoadOptions::default()).unwrap();

        let json = serde_json::to_value(&loaded.records[0]).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 3);
        assert!(json.get("category").is_none());
    }

    #[test]
    fn test_max_records_caps_kept() {
        let temp = TempDir::new().unwrap();
        let source = DatasetSource::Jsonl { path: write_sample(temp.path()) };
        let options = LoadOptions { max_records: Some(2), ..Default::default() };
        let loaded = load_local_dataset(&source, &options).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.stats.total, 8);
    }

    #[test]
    fn test_no_allowed_records_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("d.jsonl");
        std::fs::write(&path, r#"{"instruction":"a","context":"","response":"b","category":"brainstorming"}"#).unwrap();
        let err = load_local_dataset(&DatasetSource::Jsonl { path }, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, TrainingError::Dataset(_)));
    }

    #[test]
    fn test_missing_file_is_a_setup_error() {
        let source = DatasetSource::Jsonl { path: PathBuf::from("/nonexistent/dolly.jsonl") };
        let err = load_local_dataset(&source, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, TrainingError::Setup(_)));
    }

    #[test]
    fn test_malformed_line_names_line_number() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.jsonl");
        std::fs::write(&path, "{\"instruction\":\"a\",\"response\":\"b\",\"category\":\"open_qa\"}\nnot json\n").unwrap();
        let err = read_jsonl_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_written_jsonl_reads_back() {
        let temp = TempDir::new().unwrap();
        let source = DatasetSource::Jsonl { path: write_sample(temp.path()) };
        let loaded = load_local_dataset(&source, &LoadOptions::default()).unwrap();

        let out = temp.path().join("dataset.jsonl");
        write_jsonl(&out, &loaded.records).unwrap();
        assert_eq!(read_jsonl(&out).unwrap(), loaded.records);
    }

    #[test]
    fn test_parquet_records_with_null_context() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train-00000-of-00001.parquet");

        let schema = Arc::new(Schema::new(vec![
            Field::new("instruction", DataType::Utf8, false),
            Field::new("context", DataType::Utf8, true),
            Field::new("response", DataType::Utf8, false),
            Field::new("category", DataType::Utf8, false),
        ]));
        let column = |values: &[Option<&str>]| {
            let mut b = StringBuilder::new();
            for v in values {
                match v {
                    Some(s) => b.append_value(s),
                    None => b.append_null(),
                }
            }
            Arc::new(b.finish()) as Arc<dyn Array>
        };
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                column(&[Some("q1"), Some("q2"), Some("q3")]),
                column(&[Some("ctx"), None, Some("")]),
                column(&[Some("r1"), Some("r2"), Some("r3")]),
                column(&[Some("closed_qa"), Some("open_qa"), Some("brainstorming")]),
            ],
        )
        .unwrap();
        let file = File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let loaded = load_local_dataset(&DatasetSource::Parquet { path }, &LoadOptions::default()).unwrap();
        assert_eq!(loaded.stats.kept, 2);
        assert_eq!(loaded.records[0].context, "ctx");
        assert_eq!(loaded.records[1].context, "");
    }
}
