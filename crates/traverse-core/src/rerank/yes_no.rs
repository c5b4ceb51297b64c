//! Local yes/no LM reranker (Qwen3-Reranker style) via ONNX Runtime.
//!
//! Each pair is wrapped in a fixed chat prefix and suffix and fed to a causal
//! LM. The relevance score is `softmax([no, yes])[yes]` over the final-position
//! logits of the "yes" and "no" tokens.
//!
//! The export is expected to take `input_ids` + `attention_mask` (and
//! optionally `position_ids`), without a KV cache, and to output `logits`
//! shaped `[batch, seq, vocab]`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayView3;
use ort::session::Session;
use ort::value::Value;

use super::{RerankPair, ScoringBackend};
use crate::config::YesNoConfig;
use crate::error::{BackendError, ConfigError};
use crate::math::yes_probability;

const MODEL_FILENAME: &str = "model.onnx";
const TOKENIZER_FILENAME: &str = "tokenizer.json";

const PREFIX: &str = "<|im_start|>system\nJudge whether the Document meets the requirements based on \
                      the Query and the Instruct provided. Note that the answer can only be \"yes\" \
                      or \"no\".<|im_end|>\n<|im_start|>user\n";
const SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";

/// Yes/no LM scoring backend.
pub struct YesNoBackend {
    model: Arc<YesNoModel>,
}

impl YesNoBackend {
    /// Load the LM and tokenizer from `model_dir`.
    pub fn load(config: &YesNoConfig, model_dir: &Path) -> Result<Self, ConfigError> {
        let model = YesNoModel::load(model_dir, config.max_length)?;
        tracing::info!("Loaded yes/no reranker '{}' from {:?}", config.model, model_dir);
        Ok(Self {
            model: Arc::new(model),
        })
    }

    pub fn model_exists(model_dir: &Path) -> bool {
        model_dir.join(MODEL_FILENAME).exists() && model_dir.join(TOKENIZER_FILENAME).exists()
    }
}

#[async_trait]
impl ScoringBackend for YesNoBackend {
    fn name(&self) -> &str {
        "yes-no"
    }

    async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
        let model = Arc::clone(&self.model);
        let texts: Vec<String> = pairs.iter().map(RerankPair::formatted).collect();
        tokio::task::spawn_blocking(move || model.score_batch(&texts))
            .await
            .map_err(|e| BackendError::rerank(format!("Rerank task failed: {e}")))?
    }
}

struct YesNoModel {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    prefix_ids: Vec<u32>,
    suffix_ids: Vec<u32>,
    yes_id: u32,
    no_id: u32,
    pad_id: u32,
    max_length: usize,
    wants_position_ids: bool,
}

impl YesNoModel {
    fn load(model_dir: &Path, max_length: usize) -> Result<Self, ConfigError> {
        let model_path = model_dir.join(MODEL_FILENAME);
        let tokenizer_path = model_dir.join(TOKENIZER_FILENAME);

        if !model_path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "reranker model".to_string(),
                path: model_path,
            });
        }
        if !tokenizer_path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "reranker tokenizer".to_string(),
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
            .map_err(|e| load_err(format!("Failed to load reranker model: {e}")))?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| load_err(format!("Failed to load tokenizer: {e}")))?;

        let token = |t: &str| {
            tokenizer
                .token_to_id(t)
                .ok_or_else(|| load_err(format!("Tokenizer has no '{t}' token")))
        };
        let yes_id = token("yes")?;
        let no_id = token("no")?;
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .unwrap_or(0);

        let encode_fixed = |text: &str| {
            tokenizer
                .encode(text, false)
                .map(|e| e.get_ids().to_vec())
                .map_err(|e| load_err(format!("Failed to tokenize prompt template: {e}")))
        };
        let prefix_ids = encode_fixed(PREFIX)?;
        let suffix_ids = encode_fixed(SUFFIX)?;

        if prefix_ids.len() + suffix_ids.len() >= max_length {
            return Err(ConfigError::ValidationError(format!(
                "rerank.yes_no.max_length ({max_length}) leaves no room after the {}-token prompt template",
                prefix_ids.len() + suffix_ids.len()
            )));
        }

        let wants_position_ids = session.inputs().iter().any(|i| i.name() == "position_ids");

        tracing::debug!(
            "Reranker session inputs: {:?}, outputs: {:?}",
            session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>()
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            prefix_ids,
            suffix_ids,
            yes_id,
            no_id,
            pad_id,
            max_length,
            wants_position_ids,
        })
    }

    fn score_batch(&self, texts: &[String]) -> Result<Vec<f32>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body_budget = self.max_length - self.prefix_ids.len() - self.suffix_ids.len();
        let mut sequences = Vec::with_capacity(texts.len());
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), false)
                .map_err(|e| BackendError::rerank(format!("Tokenization failed: {e}")))?;
            sequences.push(wrap(
                &self.prefix_ids,
                &encoding.get_ids()[..encoding.get_ids().len().min(body_budget)],
                &self.suffix_ids,
            ));
        }

        let batch = left_pad(&sequences, self.pad_id);
        let shape = vec![batch.rows as i64, batch.seq_len as i64];
        let tensor = |data: Vec<i64>| {
            Value::from_array((shape.clone(), data))
                .map_err(|e| BackendError::rerank(format!("Failed to create input tensor: {e}")))
        };
        let ids_value = tensor(batch.input_ids)?;
        let mask_value = tensor(batch.attention_mask)?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| BackendError::rerank(format!("Reranker session lock poisoned: {e}")))?;

        let outputs = if self.wants_position_ids {
            let positions_value = tensor(batch.position_ids)?;
            session.run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value,
                "position_ids" => positions_value
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => ids_value,
                "attention_mask" => mask_value
            ])
        }
        .map_err(|e| BackendError::rerank(format!("Reranker inference failed: {e}")))?;

        let logits = outputs
            .iter()
            .find(|(name, _)| *name == "logits")
            .ok_or_else(|| BackendError::rerank("Reranker did not produce logits"))?;

        let (shape, data) = logits
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::rerank(format!("Failed to extract logits: {e}")))?;

        if shape.len() != 3 {
            return Err(BackendError::rerank(format!("Unexpected logits rank {}", shape.len())));
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        let logits = ArrayView3::from_shape(dims, data)
            .map_err(|e| BackendError::rerank(format!("Bad logits shape: {e}")))?;

        final_position_scores(logits, self.yes_id as usize, self.no_id as usize)
    }
}

fn wrap(prefix: &[u32], body: &[u32], suffix: &[u32]) -> Vec<u32> {
    let mut ids = Vec::with_capacity(prefix.len() + body.len() + suffix.len());
    ids.extend_from_slice(prefix);
    ids.extend_from_slice(body);
    ids.extend_from_slice(suffix);
    ids
}

/// Flat row-major batch tensors.
struct PaddedBatch {
    rows: usize,
    seq_len: usize,
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    position_ids: Vec<i64>,
}

/// Left-pad so every sequence ends at the last position.
fn left_pad(sequences: &[Vec<u32>], pad_id: u32) -> PaddedBatch {
    let rows = sequences.len();
    let seq_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
    let mut input_ids = vec![pad_id as i64; rows * seq_len];
    let mut attention_mask = vec![0i64; rows * seq_len];
    let mut position_ids = vec![0i64; rows * seq_len];

    for (i, seq) in sequences.iter().enumerate() {
        let offset = seq_len - seq.len();
        for (j, &id) in seq.iter().enumerate() {
            let at = i * seq_len + offset + j;
            input_ids[at] = id as i64;
            attention_mask[at] = 1;
            position_ids[at] = j as i64;
        }
    }

    PaddedBatch {
        rows,
        seq_len,
        input_ids,
        attention_mask,
        position_ids,
    }
}

fn final_position_scores(
    logits: ArrayView3<'_, f32>,
    yes_id: usize,
    no_id: usize,
) -> Result<Vec<f32>, BackendError> {
    let (rows, seq_len, vocab) = logits.dim();
    if seq_len == 0 || yes_id >= vocab || no_id >= vocab {
        return Err(BackendError::rerank(format!(
            "Logits shape [{rows}, {seq_len}, {vocab}] cannot hold yes/no ids {yes_id}/{no_id}"
        )));
    }
    Ok((0..rows)
        .map(|i| {
            let last = seq_len - 1;
            yes_probability(logits[[i, last, yes_id]], logits[[i, last, no_id]])
        })
        .collect())
}
