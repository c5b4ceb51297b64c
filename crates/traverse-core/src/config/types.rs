//! Sub-configuration structs with production defaults.

use crate::types::Category;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Rerank instruction used when no category-specific one is configured.
pub const DEFAULT_TASK_INSTRUCTION: &str = "Given a French natural language query about a place \
     or service, determine if the document describes a matching OpenStreetMap tag.";

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding `{category}.json` / `{category}.index` / `{category}.meta`
    pub data_dir: PathBuf,

    /// Directory where local models are stored
    pub model_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.traverse/data"),
            model_dir: PathBuf::from("~/.traverse/models"),
        }
    }
}

/// Corpus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Categories to load. Output follows `Category` declaration order, not this list.
    pub categories: Vec<Category>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            categories: Category::ALL.to_vec(),
        }
    }
}

/// Vector retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Nearest neighbors requested from each category index
    pub top_k_per_category: usize,

    /// Cap on the merged candidate list
    pub top_k_total: usize,

    /// Similarity floor; anything below is discarded
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k_per_category: 30,
            top_k_total: 50,
            min_score: 0.0,
        }
    }
}

/// Query embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local ONNX Runtime sentence encoder
    Onnx,
    /// Ollama `/api/embed`
    Ollama,
    /// OpenAI-compatible `/v1/embeddings`
    OpenAi,
}

/// Query embedding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,

    /// Model name. Local models live in `{model_dir}/{model}/`.
    pub model: String,

    /// Output dimension; must match every category index
    pub dimension: usize,

    /// Prepended to every query (E5 models expect "query: ")
    pub query_prefix: String,

    /// Token limit for the local encoder
    pub max_length: usize,

    /// Endpoint for remote providers
    pub endpoint: String,

    /// API key for remote providers (supports ${ENV_VAR} syntax)
    pub api_key: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Onnx,
            model: "multilingual-e5-base".to_string(),
            dimension: 768,
            query_prefix: "query: ".to_string(),
            max_length: 512,
            endpoint: "http://localhost:11434".to_string(),
            api_key: String::new(),
        }
    }
}

/// Reranking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RerankStrategy {
    /// Remote cross-encoder classification endpoint
    CrossEncoder,
    /// Local causal LM scored on "yes"/"no" next-token logits
    YesNo,
}

/// What to do when the reranker stays unavailable after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankFallback {
    /// Surface ServiceUnavailable
    Fail,
    /// Keep retrieval similarity scores and continue
    Retrieval,
}

/// How cross-encoder scores are mapped into [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreNormalization {
    /// Endpoint returns raw logits
    Sigmoid,
    /// Endpoint already returns probabilities
    None,
}

/// Reranker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankConfig {
    pub strategy: RerankStrategy,

    /// Task instruction included in every pair
    pub instruction: String,

    /// Per-category instruction overrides
    pub category_instructions: BTreeMap<Category, String>,

    /// Pairs per backend call. Bounds memory only, never changes scores.
    pub batch_size: usize,

    /// Batches in flight at once
    pub parallel_batches: usize,

    pub fallback: RerankFallback,

    pub cross_encoder: CrossEncoderConfig,

    pub yes_no: YesNoConfig,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            strategy: RerankStrategy::CrossEncoder,
            instruction: DEFAULT_TASK_INSTRUCTION.to_string(),
            category_instructions: BTreeMap::new(),
            batch_size: 10,
            parallel_batches: 1,
            fallback: RerankFallback::Fail,
            cross_encoder: CrossEncoderConfig::default(),
            yes_no: YesNoConfig::default(),
        }
    }
}

impl RerankConfig {
    /// Instruction for candidates of the given category.
    pub fn instruction_for(&self, category: Category) -> &str {
        self.category_instructions
            .get(&category)
            .map(String::as_str)
            .unwrap_or(&self.instruction)
    }
}

/// Cross-encoder endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEncoderConfig {
    /// Base URL of a `/v1/rerank` server
    pub endpoint: String,

    pub model: String,

    pub normalize: ScoreNormalization,

    /// API key (supports ${ENV_VAR} syntax)
    pub api_key: String,
}

impl Default for CrossEncoderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            model: "BAAI/bge-reranker-v2-m3".to_string(),
            normalize: ScoreNormalization::Sigmoid,
            api_key: String::new(),
        }
    }
}

/// Local yes/no LM reranker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct YesNoConfig {
    /// Model directory name under `model_dir`
    pub model: String,

    /// Total token budget per pair, chat template included
    pub max_length: usize,
}

impl Default for YesNoConfig {
    fn default() -> Self {
        Self {
            model: "qwen3-reranker-0.6b".to_string(),
            max_length: 8192,
        }
    }
}

/// Which candidates compete for the same popularity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BucketScope {
    /// Popular/Niche buckets per category, categories concatenated
    PerCategory,
    /// One Popular and one Niche bucket across all categories
    Global,
}

/// Popularity bucketing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// `usage_count >= threshold` is Popular, below is Niche
    pub usage_count_threshold: u64,

    /// Results kept per bucket
    pub top_k: usize,

    pub scope: BucketScope,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            usage_count_threshold: 10_000,
            top_k: 5,
            scope: BucketScope::PerCategory,
        }
    }
}

/// Retry settings for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Max retry attempts after the first failure
    pub retry_attempts: u32,

    /// Base backoff delay in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Per-attempt time limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Query embedding timeout in milliseconds
    pub embed_timeout_ms: u64,

    /// Timeout for one full rerank pass in milliseconds
    pub rerank_timeout_ms: u64,

    /// Query transform timeout in milliseconds
    pub transform_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            embed_timeout_ms: 10_000,
            rerank_timeout_ms: 60_000,
            transform_timeout_ms: 15_000,
        }
    }
}

/// Query preprocessing settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub expansion: QueryExpansionConfig,
}

/// LLM query expansion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryExpansionConfig {
    pub enabled: bool,

    /// Ollama API endpoint
    pub endpoint: String,

    pub model: String,

    /// Maximum related terms appended to the query
    pub max_terms: usize,

    /// Normalized queries whose expansion terms are kept in memory
    pub cache_capacity: u64,
}

impl Default for QueryExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434".to_string(),
            model: "gemma3:1b".to_string(),
            max_terms: 10,
            cache_capacity: 1024,
        }
    }
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Default output format ("json" or "jsonl")
    pub format: String,

    /// Pretty-print JSON output
    pub pretty: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            pretty: false,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
