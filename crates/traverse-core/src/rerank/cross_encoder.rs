//! Cross-encoder scoring via a `/v1/rerank` endpoint (TEI, vLLM, llama.cpp, Jina-compatible).
//!
//! Pairs that share an instruction and query go out as one request; the
//! documents' scores are mapped back by the `index` the server returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{RerankPair, ScoringBackend};
use crate::config::{resolve_env_var, CrossEncoderConfig, ScoreNormalization};
use crate::error::BackendError;
use crate::math::sigmoid;

/// Remote cross-encoder.
pub struct CrossEncoderBackend {
    endpoint: String,
    model: String,
    normalize: ScoreNormalization,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl CrossEncoderBackend {
    pub fn new(config: &CrossEncoderConfig) -> Self {
        Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            normalize: config.normalize,
            api_key: resolve_env_var(&config.api_key),
            client: reqwest::Client::new(),
        }
    }

    async fn rerank_group(&self, query: &str, documents: Vec<&str>) -> Result<Vec<f32>, BackendError> {
        let url = format!("{}/v1/rerank", self.endpoint);
        let n = documents.len();
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: n,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await.map_err(|e| BackendError::Rerank {
            message: format!("Failed to reach reranker endpoint: {e}"),
            status_code: None,
        })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::Rerank {
                message: format!("Reranker HTTP {status}: {text}"),
                status_code: Some(status.as_u16()),
            });
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| BackendError::rerank(format!("Failed to parse reranker response: {e}")))?;

        self.collect_scores(parsed, n)
    }

    /// Place each returned score at its document index.
    fn collect_scores(&self, resp: RerankResponse, n: usize) -> Result<Vec<f32>, BackendError> {
        let mut scores: Vec<Option<f32>> = vec![None; n];
        for result in resp.results {
            let slot = scores.get_mut(result.index).ok_or_else(|| {
                BackendError::rerank(format!("Reranker returned out-of-range index {}", result.index))
            })?;
            *slot = Some(match self.normalize {
                ScoreNormalization::Sigmoid => sigmoid(result.relevance_score),
                ScoreNormalization::None => result.relevance_score,
            });
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| BackendError::rerank(format!("Reranker returned no score for document {i}")))
            })
            .collect()
    }
}

/// Query side of the request: instruction prepended when present.
fn compose_query(pair: &RerankPair) -> String {
    if pair.instruction.trim().is_empty() {
        pair.query.clone()
    } else {
        format!("<Instruct>: {}\n<Query>: {}", pair.instruction, pair.query)
    }
}

#[async_trait]
impl ScoringBackend for CrossEncoderBackend {
    fn name(&self) -> &str {
        "cross-encoder"
    }

    async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
        // (composed query, pair indices) in first-seen order
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, pair) in pairs.iter().enumerate() {
            let query = compose_query(pair);
            match groups.iter_mut().find(|(q, _)| *q == query) {
                Some((_, members)) => members.push(i),
                None => groups.push((query, vec![i])),
            }
        }

        let mut scores = vec![0.0f32; pairs.len()];
        for (query, members) in &groups {
            let documents = members.iter().map(|&i| pairs[i].document.as_str()).collect();
            let group_scores = self.rerank_group(query, documents).await?;
            for (&i, score) in members.iter().zip(group_scores) {
                scores[i] = score;
            }
        }
        Ok(scores)
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultRaw>,
}

#[derive(Deserialize)]
struct RerankResultRaw {
    index: usize,
    relevance_score: f32,
}
