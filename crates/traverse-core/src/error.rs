//! Error types for the Traverse search pipeline.
//!
//! Errors follow the three-way split the pipeline cares about:
//! - [`ConfigError`]: fatal at startup, never retried, the service must not start.
//! - [`BackendError`]: an embedder / reranker / query-transform call failed,
//!   possibly transiently. The orchestrator retries these with backoff.
//! - [`TraverseError::ServiceUnavailable`]: retries were exhausted.
//!
//! Data-quality problems (NaN scores, empty candidate text) are not errors:
//! see [`crate::types::DataQualityIssue`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::Category;

/// Top-level error type for Traverse operations.
#[derive(Error, Debug)]
pub enum TraverseError {
    /// Configuration or corpus artifact errors (fatal)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A backend call failed and was not retried
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// A backend call kept failing after all retry attempts
    #[error("Service unavailable: {stage} failed after {attempts} attempt(s): {source}")]
    ServiceUnavailable {
        stage: Stage,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TraverseError {
    /// Process exit code for this error (sysexits.h conventions).
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 78,
            Self::Backend(_) | Self::ServiceUnavailable { .. } => 69,
            Self::Io(_) => 74,
            Self::Json(_) => 65,
        }
    }

    /// HTTP status a service shell should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Backend(_) | Self::ServiceUnavailable { .. } => 503,
            Self::Config(_) | Self::Io(_) | Self::Json(_) => 500,
        }
    }

    /// Message safe to show to an end user. Configuration details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Backend(_) | Self::ServiceUnavailable { .. } => {
                "search backend temporarily unavailable".to_string()
            }
            Self::Config(_) | Self::Io(_) | Self::Json(_) => "internal server error".to_string(),
        }
    }
}

/// Configuration and corpus-loading errors. All of them are fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A model, index or record file is missing
    #[error("Missing {what} at {path:?}")]
    MissingArtifact { what: String, path: PathBuf },

    /// A model artifact exists but could not be loaded
    #[error("Failed to load model from {path:?}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    /// A serialized index could not be decoded
    #[error("Corrupt index {path:?}: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    /// A record collection could not be read or decoded
    #[error("Failed to load records from {path:?}: {message}")]
    Records { path: PathBuf, message: String },

    /// Index ordinals and record positions do not line up
    #[error(
        "Index/record length mismatch for category '{category}': \
         index has {index_len} vectors, records list has {records_len} entries"
    )]
    IndexMismatch {
        category: Category,
        index_len: usize,
        records_len: usize,
    },

    /// The records were reordered or replaced since the index was built
    #[error("Records hash mismatch for category '{category}': index built from {expected}, records hash to {actual}")]
    RecordsHashMismatch {
        category: Category,
        expected: String,
        actual: String,
    },

    /// Query vectors and index vectors have different sizes
    #[error("Embedding dimension mismatch for category '{category}': embedder produces {expected}, index stores {actual}")]
    DimensionMismatch {
        category: Category,
        expected: usize,
        actual: usize,
    },

    /// A tag appears twice in the same category
    #[error("Duplicate tag '{tag}' in category '{category}'")]
    DuplicateTag { category: Category, tag: String },

    /// A category was loaded twice
    #[error("Category '{0}' is configured more than once")]
    DuplicateCategory(Category),
}

/// Failures of the external inference capabilities.
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// Query embedding failed
    #[error("Embedding failed: {message}")]
    Embedding {
        message: String,
        status_code: Option<u16>,
    },

    /// Rerank scoring failed
    #[error("Rerank scoring failed: {message}")]
    Rerank {
        message: String,
        status_code: Option<u16>,
    },

    /// Query transform (expansion) failed
    #[error("Query transform failed: {message}")]
    QueryTransform {
        message: String,
        status_code: Option<u16>,
    },

    /// A stage did not finish within its time budget
    #[error("Timeout in {stage} stage after {timeout_ms}ms")]
    Timeout { stage: Stage, timeout_ms: u64 },
}

impl BackendError {
    pub(crate) fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
            status_code: None,
        }
    }

    pub(crate) fn rerank(message: impl Into<String>) -> Self {
        Self::Rerank {
            message: message.into(),
            status_code: None,
        }
    }
}

/// Pipeline stage, used in timeout and exhaustion errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    QueryTransform,
    Embed,
    Rerank,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::QueryTransform => "query-transform",
            Self::Embed => "embed",
            Self::Rerank => "rerank",
        };
        f.write_str(name)
    }
}

/// Convenience type alias for Traverse results.
pub type Result<T> = std::result::Result<T, TraverseError>;
