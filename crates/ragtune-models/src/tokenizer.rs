//! Tokenizer provisioning for causal-LM fine-tuning.
//!
//! Training uses a tokenizer whose padding token is the EOS token and whose
//! padding side is always `right`, so packed and padded sequences keep their
//! content positions aligned for left-to-right attention.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy};

/// Well-known EOS spellings, tried when `tokenizer_config.json` is absent.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>", "<|im_end|>"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    #[default]
    Right,
    Left,
}

/// Token entry in `tokenizer_config.json`: either a bare string or an
/// `AddedToken` object with a `content` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Plain(String),
    Added { content: String },
}

impl TokenSpec {
    fn content(&self) -> &str {
        match self {
            Self::Plain(s) => s,
            Self::Added { content } => content,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TokenizerConfigFile {
    #[serde(default)]
    eos_token: Option<TokenSpec>,
}

/// A tokenizer configured for training.
pub struct TrainingTokenizer {
    inner: tokenizers::Tokenizer,
    eos_token: String,
    eos_token_id: u32,
}

impl std::fmt::Debug for TrainingTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingTokenizer")
            .field("eos_token", &self.eos_token)
            .field("eos_token_id", &self.eos_token_id)
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl TrainingTokenizer {
    /// Load `tokenizer.json` plus the optional `tokenizer_config.json`.
    pub fn from_files(tokenizer_json: &Path, tokenizer_config: Option<&Path>) -> ModelResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(tokenizer_json)
            .map_err(|e| ModelError::Tokenizer(format!("{}: {e}", tokenizer_json.display())))?;
        let config = match tokenizer_config {
            Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            None => TokenizerConfigFile::default(),
        };
        Self::configure(inner, &config, PaddingSide::Right)
    }

    /// Build from in-memory `tokenizer.json` bytes.
    pub fn from_bytes(tokenizer_json: &[u8], padding_side: PaddingSide) -> ModelResult<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(tokenizer_json)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Self::configure(inner, &TokenizerConfigFile::default(), padding_side)
    }

    fn configure(
        mut inner: tokenizers::Tokenizer,
        config: &TokenizerConfigFile,
        padding_side: PaddingSide,
    ) -> ModelResult<Self> {
        if padding_side == PaddingSide::Left {
            return Err(ModelError::Config(
                "left padding is not supported for causal-LM training".to_string(),
            ));
        }

        let (eos_token, eos_token_id) = resolve_eos(&inner, config)?;

        inner.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_id: eos_token_id,
            pad_token: eos_token.clone(),
            ..PaddingParams::default()
        }));

        Ok(Self { inner, eos_token, eos_token_id })
    }

    pub fn encode(&self, text: &str) -> ModelResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> ModelResult<String> {
        self.inner.decode(ids, true).map_err(|e| ModelError::Tokenizer(e.to_string()))
    }

    #[must_use]
    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    #[must_use]
    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Always the EOS token.
    #[must_use]
    pub fn pad_token(&self) -> &str {
        &self.eos_token
    }

    #[must_use]
    pub fn pad_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// Fixed at construction; left padding is rejected.
    #[must_use]
    pub fn padding_side(&self) -> PaddingSide {
        match self.inner.get_padding().map(|p| p.direction) {
            Some(PaddingDirection::Left) => PaddingSide::Left,
            _ => PaddingSide::Right,
        }
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    #[must_use]
    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

fn resolve_eos(
    inner: &tokenizers::Tokenizer,
    config: &TokenizerConfigFile,
) -> ModelResult<(String, u32)> {
    if let Some(spec) = &config.eos_token {
        let token = spec.content();
        return inner
            .token_to_id(token)
            .map(|id| (token.to_string(), id))
            .ok_or_else(|| {
                ModelError::Tokenizer(format!("eos_token {token:?} is not in the vocabulary"))
            });
    }

    EOS_CANDIDATES
        .iter()
        .find_map(|t| inner.token_to_id(t).map(|id| ((*t).to_string(), id)))
        .ok_or_else(|| ModelError::Tokenizer("tokenizer has no recognizable EOS token".to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Whitespace word-level tokenizer with `</s>` as EOS.
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

    #[test]
    fn test_pad_token_is_eos_and_padding_is_right() {
        let tok = TrainingTokenizer::from_bytes(TOY_TOKENIZER.as_bytes(), PaddingSide::Right).unwrap();
        assert_eq!(tok.pad_token(), tok.eos_token());
        assert_eq!(tok.pad_token_id(), tok.eos_token_id());
        assert_eq!(tok.eos_token(), "</s>");
        assert_eq!(tok.eos_token_id(), 1);
        assert_eq!(tok.padding_side(), PaddingSide::Right);

        let padding = tok.inner().get_padding().unwrap();
        assert_eq!(padding.pad_id, 1);
        assert_eq!(padding.pad_token, "</s>");
    }

    #[test]
    fn test_left_padding_is_rejected() {
        let err = TrainingTokenizer::from_bytes(TOY_TOKENIZER.as_bytes(), PaddingSide::Left).unwrap_err();
        assert!(matches!(err, ModelError::Config(_)));
    }

    #[test]
    fn test_eos_from_tokenizer_config_object_form() {
        let temp = TempDir::new().unwrap();
        let tok_path = temp.path().join("tokenizer.json");
        let cfg_path = temp.path().join("tokenizer_config.json");
        std::fs::write(&tok_path, TOY_TOKENIZER).unwrap();
        std::fs::write(&cfg_path, r#"{"eos_token": {"content": "</s>", "special": true}}"#).unwrap();

        let tok = TrainingTokenizer::from_files(&tok_path, Some(&cfg_path)).unwrap();
        assert_eq!(tok.pad_token(), "</s>");
    }

    #[test]
    fn test_unknown_eos_in_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let tok_path = temp.path().join("tokenizer.json");
        let cfg_path = temp.path().join("tokenizer_config.json");
        std::fs::write(&tok_path, TOY_TOKENIZER).unwrap();
        std::fs::write(&cfg_path, r#"{"eos_token": "<|eot|>"}"#).unwrap();

        assert!(TrainingTokenizer::from_files(&tok_path, Some(&cfg_path)).is_err());
    }

    #[test]
    fn test_encode_known_words() {
        let tok = TrainingTokenizer::from_bytes(TOY_TOKENIZER.as_bytes(), PaddingSide::Right).unwrap();
        let ids = tok.encode("the sky is blue").unwrap();
        assert_eq!(ids, vec![6, 7, 8, 9]);
    }
}
