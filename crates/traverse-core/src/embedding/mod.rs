//! Query embedding.
//!
//! An [`Embedder`] turns query text into a unit-normalized vector from the same
//! model family the corpus indexes were built with. Providers:
//!
//! - `onnx`: local sentence encoder via ONNX Runtime (default, E5 family)
//! - `ollama`: Ollama `/api/embed`
//! - `openai`: any OpenAI-compatible `/v1/embeddings` server
//!
//! # Usage
//!
//! ```rust,ignore
//! use traverse_core::embedding::EmbedderFactory;
//! use traverse_core::Config;
//!
//! let config = Config::default();
//! let embedder = EmbedderFactory::create(&config.embedding, &config.model_dir())?;
//! let vector = embedder.embed("restaurant indien").await?;
//! assert_eq!(vector.len(), embedder.dimension());
//! ```

pub(crate) mod http;
pub(crate) mod onnx;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{BackendError, ConfigError};

pub use onnx::OnnxEmbedder;

/// Text-to-vector capability.
///
/// Uses `async_trait` so providers can be held as `Arc<dyn Embedder>`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name for logging (e.g., "onnx", "ollama").
    fn name(&self) -> &str;

    /// Length of the vectors this embedder returns.
    fn dimension(&self) -> usize;

    /// Embed a query. The result is L2-normalized.
    ///
    /// Empty text is embedded like any other text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

/// Creates the configured embedder.
pub struct EmbedderFactory;

impl EmbedderFactory {
    /// Build the embedder selected by `config.provider`.
    ///
    /// Local models are loaded eagerly so a missing artifact fails at startup.
    pub fn create(
        config: &EmbeddingConfig,
        model_dir: &Path,
    ) -> Result<Arc<dyn Embedder>, ConfigError> {
        match config.provider {
            EmbeddingProvider::Onnx => {
                let embedder = onnx::OnnxEmbedder::load(config, &model_dir.join(&config.model))?;
                Ok(Arc::new(embedder))
            }
            EmbeddingProvider::Ollama => Ok(Arc::new(http::HttpEmbedder::ollama(config))),
            EmbeddingProvider::OpenAi => Ok(Arc::new(http::HttpEmbedder::openai(config))),
        }
    }
}

/// Check a returned vector and normalize it.
pub(crate) fn finish_embedding(raw: Vec<f32>, dimension: usize) -> Result<Vec<f32>, BackendError> {
    if raw.len() != dimension {
        return Err(BackendError::embedding(format!(
            "embedder returned {} dimensions, expected {dimension}",
            raw.len()
        )));
    }
    if raw.iter().any(|x| !x.is_finite()) {
        return Err(BackendError::embedding("embedder returned non-finite values"));
    }
    Ok(crate::math::l2_normalize(&raw))
}
