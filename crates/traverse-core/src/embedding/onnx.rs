//! Local sentence encoder via ONNX Runtime.
//!
//! Expects `model.onnx` and `tokenizer.json` under `{model_dir}/{model}/`.
//! Models exporting a `sentence_embedding` output are used as-is; otherwise
//! `last_hidden_state` is mean-pooled over the attention mask (E5 recipe).

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayView3;
use ort::session::Session;
use ort::value::Value;
use tokenizers::TruncationParams;

use super::{finish_embedding, Embedder};
use crate::config::EmbeddingConfig;
use crate::error::{BackendError, ConfigError};

const MODEL_FILENAME: &str = "model.onnx";
const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// ONNX sentence encoder behind the [`Embedder`] trait.
pub struct OnnxEmbedder {
    encoder: Arc<SentenceEncoder>,
    query_prefix: String,
    dimension: usize,
}

impl OnnxEmbedder {
    /// Load the encoder from `model_dir`.
    pub fn load(config: &EmbeddingConfig, model_dir: &Path) -> Result<Self, ConfigError> {
        let encoder = SentenceEncoder::load(model_dir, config.max_length)?;
        tracing::info!("Loaded ONNX embedder '{}' from {:?}", config.model, model_dir);
        Ok(Self {
            encoder: Arc::new(encoder),
            query_prefix: config.query_prefix.clone(),
            dimension: config.dimension,
        })
    }

    /// Whether the model files exist.
    pub fn model_exists(model_dir: &Path) -> bool {
        model_dir.join(MODEL_FILENAME).exists() && model_dir.join(TOKENIZER_FILENAME).exists()
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn name(&self) -> &str {
        "onnx"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let encoder = Arc::clone(&self.encoder);
        let input = format!("{}{}", self.query_prefix, text);
        let raw = tokio::task::spawn_blocking(move || encoder.encode(&input))
            .await
            .map_err(|e| BackendError::embedding(format!("Embedding task failed: {e}")))??;
        finish_embedding(raw, self.dimension)
    }
}

/// Tokenizer + session pair.
///
/// Uses a `Mutex` because `Session::run` requires `&mut self`.
struct SentenceEncoder {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    /// BERT-style exports also take `token_type_ids`
    wants_token_type_ids: bool,
}

impl SentenceEncoder {
    fn load(model_dir: &Path, max_length: usize) -> Result<Self, ConfigError> {
        let model_path = model_dir.join(MODEL_FILENAME);
        let tokenizer_path = model_dir.join(TOKENIZER_FILENAME);

        if !model_path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "embedding model".to_string(),
                path: model_path,
            });
        }
        if !tokenizer_path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "embedding tokenizer".to_string(),
                path: tokenizer_path,
            });
        }

        let load_err = |message: String| ConfigError::ModelLoad {
            path: model_path.clone(),
            message,
        };

        let session = Session::builder()
            .map_err(|e| load_err(format!("Failed to create ONNX session builder: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| load_err(format!("Failed to load embedding model: {e}")))?;

        let tokenizer = load_tokenizer(&tokenizer_path, max_length).map_err(load_err)?;

        let wants_token_type_ids = session
            .inputs()
            .iter()
            .any(|i| i.name() == "token_type_ids");

        tracing::debug!(
            "Embedding session inputs: {:?}, outputs: {:?}",
            session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>()
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            wants_token_type_ids,
        })
    }

    /// Encode one text to a raw (not yet normalized) embedding.
    fn encode(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| BackendError::embedding(format!("Tokenization failed: {e}")))?;

        let (input_ids, attention_mask) = token_inputs(&encoding);
        let seq_len = input_ids.len();

        let shape = vec![1i64, seq_len as i64];
        let tensor = |data: Vec<i64>| {
            Value::from_array((shape.clone(), data))
                .map_err(|e| BackendError::embedding(format!("Failed to create input tensor: {e}")))
        };
        let ids_value = tensor(input_ids)?;
        let mask_value = tensor(attention_mask.clone())?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| BackendError::embedding(format!("Embedding session lock poisoned: {e}")))?;

        let outputs = if self.wants_token_type_ids {
            let types_value = tensor(vec![0i64; seq_len])?;
            session.run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value,
                "token_type_ids" => types_value
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value
            ])
        }
        .map_err(|e| BackendError::embedding(format!("Embedding inference failed: {e}")))?;

        if let Some((_, pooled)) = outputs.iter().find(|(name, _)| *name == "sentence_embedding") {
            let (_shape, data) = pooled
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::embedding(format!("Failed to extract sentence_embedding: {e}")))?;
            return Ok(data.to_vec());
        }

        let hidden = outputs
            .iter()
            .find(|(name, _)| *name == "last_hidden_state")
            .ok_or_else(|| BackendError::embedding("Model produced neither sentence_embedding nor last_hidden_state"))?;

        let (shape, data) = hidden
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::embedding(format!("Failed to extract last_hidden_state: {e}")))?;

        if shape.len() != 3 {
            return Err(BackendError::embedding(format!(
                "Unexpected last_hidden_state rank {}",
                shape.len()
            )));
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        let hidden = ArrayView3::from_shape(dims, data)
            .map_err(|e| BackendError::embedding(format!("Bad last_hidden_state shape: {e}")))?;

        Ok(mean_pool(hidden, &attention_mask))
    }
}

/// Tokenizer truncating to `max_length` tokens, special tokens included.
fn load_tokenizer(path: &Path, max_length: usize) -> Result<tokenizers::Tokenizer, String> {
    let mut tokenizer = tokenizers::Tokenizer::from_file(path)
        .map_err(|e| format!("Failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..TruncationParams::default()
        }))
        .map_err(|e| format!("Invalid truncation for max_length {max_length}: {e}"))?;
    Ok(tokenizer)
}

/// `input_ids` and `attention_mask` for one encoding, at least one token long.
fn token_inputs(encoding: &tokenizers::Encoding) -> (Vec<i64>, Vec<i64>) {
    let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
    let mut attention_mask: Vec<i64> = encoding
        .get_attention_mask()
        .iter()
        .map(|&m| m as i64)
        .collect();
    if input_ids.is_empty() {
        input_ids.push(0);
        attention_mask.push(0);
    }
    (input_ids, attention_mask)
}

/// Average token vectors of the first sequence where the mask is set.
fn mean_pool(hidden: ArrayView3<'_, f32>, attention_mask: &[i64]) -> Vec<f32> {
    let (_, seq_len, dim) = hidden.dim();
    let mut pooled = vec![0.0f32; dim];
    let mut count = 0usize;
    for t in 0..seq_len {
        if attention_mask.get(t).copied().unwrap_or(0) == 0 {
            continue;
        }
        count += 1;
        for (d, value) in pooled.iter_mut().enumerate() {
            *value += hidden[[0, t, d]];
        }
    }
    if count > 0 {
        for value in pooled.iter_mut() {
            *value /= count as f32;
        }
    }
    pooled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_respects_mask() {
        // 1 × 3 tokens × 2 dims; third token is padding.
        let data = [1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let hidden = ArrayView3::from_shape((1, 3, 2), &data[..]).unwrap();
        let pooled = mean_pool(hidden, &[1, 1, 0]);
        assert_eq!(pooled, vec![2.0, 3.0]);
    }

    #[test]
    fn test_mean_pool_all_masked_is_zero() {
        let data = [1.0, 2.0];
        let hidden = ArrayView3::from_shape((1, 1, 2), &data[..]).unwrap();
        assert_eq!(mean_pool(hidden, &[0]), vec![0.0, 0.0]);
    }

    const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {"type": "WhitespaceSplit"},
  "post_processor": {
    "type": "TemplateProcessing",
    "single": [
      {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 0}}
    ],
    "pair": [
      {"SpecialToken": {"id": "[CLS]", "type_id": 0}},
      {"Sequence": {"id": "A", "type_id": 0}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 0}},
      {"Sequence": {"id": "B", "type_id": 1}},
      {"SpecialToken": {"id": "[SEP]", "type_id": 1}}
    ],
    "special_tokens": {
      "[CLS]": {"id": "[CLS]", "ids": [1], "tokens": ["[CLS]"]},
      "[SEP]": {"id": "[SEP]", "ids": [2], "tokens": ["[SEP]"]}
    }
  },
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"[UNK]": 0, "[CLS]": 1, "[SEP]": 2, "query:": 3, "restaurant": 4, "indien": 5, "pas": 6, "cher": 7},
    "unk_token": "[UNK]"
  }
}"#;

    fn tokenizer(max_length: usize) -> tokenizers::Tokenizer {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TOKENIZER_FILENAME);
        std::fs::write(&path, TOKENIZER_JSON).unwrap();
        load_tokenizer(&path, max_length).unwrap()
    }

    #[test]
    fn test_truncation_keeps_closing_special_token() {
        let encoding = tokenizer(4).encode("query: restaurant indien pas cher", true).unwrap();
        let (ids, mask) = token_inputs(&encoding);
        assert_eq!(ids, vec![1, 3, 4, 2]);
        assert_eq!(mask, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_short_input_is_not_truncated() {
        let encoding = tokenizer(16).encode("restaurant indien", true).unwrap();
        let (ids, _) = token_inputs(&encoding);
        assert_eq!(ids, vec![1, 4, 5, 2]);
    }

    #[test]
    fn test_model_exists_false_for_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!OnnxEmbedder::model_exists(dir.path()));
    }
}
