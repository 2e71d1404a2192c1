//! Turning formatted samples into fixed-length training sequences.

use crate::dataset::QaRecord;
use crate::error::{TrainingError, TrainingResult};
use crate::prompt::PromptFormatter;
use ragtune_models::TrainingTokenizer;
use tracing::debug;

/// Label value skipped by the loss.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingSequence {
    pub input_ids: Vec<u32>,
    pub labels: Vec<i64>,
    pub attention_mask: Vec<u8>,
}

impl TrainingSequence {
    #[must_use]
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Positions that contribute to the loss.
    #[must_use]
    pub fn num_label_tokens(&self) -> usize {
        self.labels.iter().filter(|l| **l != IGNORE_INDEX).count()
    }
}

/// Concatenate samples, each followed by `eos_id`, and cut the stream into
/// `max_len` windows. The trailing partial window is dropped.
#[must_use]
pub fn pack_sequences(samples: impl IntoIterator<Item = Vec<u32>>, eos_id: u32, max_len: usize) -> Vec<TrainingSequence> {
    let mut stream = Vec::new();
    for mut ids in samples {
        ids.push(eos_id);
        stream.extend(ids);
    }

    stream
        .chunks_exact(max_len)
        .map(|window| TrainingSequence {
            input_ids: window.to_vec(),
            labels: window.iter().map(|&t| i64::from(t)).collect(),
            attention_mask: vec![1; max_len],
        })
        .collect()
}

/// One sample per sequence: append EOS, truncate to `max_len`, right-pad with `pad_id`.
#[must_use]
pub fn pad_sequence(mut ids: Vec<u32>, eos_id: u32, pad_id: u32, max_len: usize) -> TrainingSequence {
    ids.push(eos_id);
    ids.truncate(max_len);
    let content = ids.len();

    let mut labels: Vec<i64> = ids.iter().map(|&t| i64::from(t)).collect();
    let mut attention_mask = vec![1u8; content];

    ids.resize(max_len, pad_id);
    labels.resize(max_len, IGNORE_INDEX);
    attention_mask.resize(max_len, 0);

    TrainingSequence { input_ids: ids, labels, attention_mask }
}

/// Format, tokenize and pack (or pad) every record.
pub fn build_sequences(
    records: &[QaRecord],
    formatter: &dyn PromptFormatter,
    tokenizer: &TrainingTokenizer,
    max_seq_length: usize,
    packing: bool,
) -> TrainingResult<Vec<TrainingSequence>> {
    let tokenized = records
        .iter()
        .map(|rec| tokenizer.encode(&formatter.format(rec)))
        .collect::<Result<Vec<_>, _>>()?;
    let total_tokens: usize = tokenized.iter().map(Vec::len).sum();

    let sequences = if packing {
        pack_sequences(tokenized, tokenizer.eos_token_id(), max_seq_length)
    } else {
        tokenized
            .into_iter()
            .map(|ids| pad_sequence(ids, tokenizer.eos_token_id(), tokenizer.pad_token_id(), max_seq_length))
            .collect()
    };

    if sequences.is_empty() {
        return Err(TrainingError::Dataset(format!(
            "{} records ({total_tokens} tokens) do not fill a single {max_seq_length}-token sequence",
            records.len()
        )));
    }

    debug!(records = records.len(), total_tokens, sequences = sequences.len(), packing, "sequences built");
    Ok(sequences)
}
