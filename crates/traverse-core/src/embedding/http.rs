//! Remote embedders over HTTP.
//!
//! Two wire shapes are supported:
//! - Ollama `POST /api/embed` with `{model, input, truncate}` → `{embeddings}`
//! - OpenAI-compatible `POST /v1/embeddings` with `{model, input}` → `{data: [{embedding}]}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{finish_embedding, Embedder};
use crate::config::{resolve_env_var, EmbeddingConfig};
use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Api {
    Ollama,
    OpenAi,
}

/// Embedder backed by a remote embedding server.
pub struct HttpEmbedder {
    api: Api,
    endpoint: String,
    model: String,
    query_prefix: String,
    dimension: usize,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn ollama(config: &EmbeddingConfig) -> Self {
        Self::new(Api::Ollama, config)
    }

    pub fn openai(config: &EmbeddingConfig) -> Self {
        Self::new(Api::OpenAi, config)
    }

    fn new(api: Api, config: &EmbeddingConfig) -> Self {
        Self {
            api,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            query_prefix: config.query_prefix.clone(),
            dimension: config.dimension,
            api_key: resolve_env_var(&config.api_key),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self) -> String {
        match self.api {
            Api::Ollama => format!("{}/api/embed", self.endpoint),
            Api::OpenAi => format!("{}/v1/embeddings", self.endpoint),
        }
    }
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
    truncate: bool,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        match self.api {
            Api::Ollama => "ollama",
            Api::OpenAi => "openai",
        }
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let input = format!("{}{}", self.query_prefix, text);
        let mut request = self.client.post(self.url());
        request = match self.api {
            Api::Ollama => request.json(&OllamaEmbedRequest {
                model: &self.model,
                input: &input,
                truncate: true,
            }),
            Api::OpenAi => request.json(&OpenAiEmbedRequest {
                model: &self.model,
                input: &input,
            }),
        };
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| BackendError::Embedding {
            message: format!("{} embed request failed: {e}", self.name()),
            status_code: None,
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Embedding {
                message: format!("{} HTTP {status}: {text}", self.name()),
                status_code: Some(status.as_u16()),
            });
        }

        let parse_err =
            |e: reqwest::Error| BackendError::embedding(format!("Failed to parse embed response: {e}"));
        let vector = match self.api {
            Api::Ollama => resp
                .json::<OllamaEmbedResponse>()
                .await
                .map_err(parse_err)?
                .embeddings
                .into_iter()
                .next(),
            Api::OpenAi => resp
                .json::<OpenAiEmbedResponse>()
                .await
                .map_err(parse_err)?
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding),
        }
        .ok_or_else(|| BackendError::embedding("Embed response contained no vectors"))?;

        finish_embedding(vector, self.dimension)
    }
}
