//! Search orchestration: transform → embed → retrieve → rerank → select.
//!
//! [`Traverse`] is built once at startup and shared by every query. All of its
//! state is read-only behind `Arc`s, so clones are cheap and concurrent
//! searches need no locks. Embedding retries, the transform timeout and the
//! reranker fallback live here; the reranker retries each batch itself.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, RerankFallback};
use crate::corpus::CandidateStore;
use crate::embedding::{Embedder, EmbedderFactory};
use crate::error::{BackendError, ConfigError, Result, Stage, TraverseError};
use crate::query::{OllamaExpander, QueryTransform};
use crate::rerank::{Reranked, Reranker, ScoringBackend, ScoringBackendFactory};
use crate::retrieval::Retriever;
use crate::retry::{with_retry, Exhausted, RetryPolicy};
use crate::selection::SelectionPolicy;
use crate::types::{SearchOutcome, SearchStats};

/// Process-wide search context.
#[derive(Clone)]
pub struct Traverse {
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    retriever: Arc<Retriever>,
    reranker: Arc<Reranker>,
    selection: SelectionPolicy,
    transform: Option<Arc<dyn QueryTransform>>,
}

impl Traverse {
    /// Load the corpus and backends described by `config`.
    ///
    /// Any misalignment between indexes and records, or a missing artifact,
    /// fails here so a running instance is always a consistent one.
    pub async fn new(config: Config) -> Result<Self> {
        tracing::debug!("Initializing Traverse v{}", crate::VERSION);
        let store = CandidateStore::load(&config.data_dir(), &config.corpus.categories)?;
        let model_dir = config.model_dir();
        let embedder = EmbedderFactory::create(&config.embedding, &model_dir)?;
        let backend = ScoringBackendFactory::create(&config.rerank, &model_dir)?;

        let transform: Option<Arc<dyn QueryTransform>> = if config.query.expansion.enabled {
            Some(Arc::new(OllamaExpander::new(&config.query.expansion)))
        } else {
            None
        };

        let traverse = Self::from_parts(config, store, embedder, backend)?;
        Ok(match transform {
            Some(t) => traverse.with_query_transform(t),
            None => traverse,
        })
    }

    /// Assemble from already-built parts.
    ///
    /// Fails if the embedder's dimension differs from the configured one or
    /// from any loaded index.
    pub fn from_parts(
        config: Config,
        store: CandidateStore,
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn ScoringBackend>,
    ) -> Result<Self> {
        if embedder.dimension() != config.embedding.dimension {
            return Err(ConfigError::ValidationError(format!(
                "embedder '{}' produces {} dimensions but embedding.dimension is {}",
                embedder.name(),
                embedder.dimension(),
                config.embedding.dimension
            ))
            .into());
        }
        store.check_dimension(embedder.dimension())?;

        tracing::info!(
            "Traverse ready: {} tags in {} categories, embedder '{}', reranker '{}'",
            store.len(),
            store.shards().len(),
            embedder.name(),
            backend.name()
        );

        let retriever = Retriever::new(Arc::new(store), config.retrieval.clone());
        let reranker = Reranker::new(backend, config.rerank.clone())
            .with_retry_policy(retry_policy(&config, config.limits.rerank_timeout_ms));
        let selection = SelectionPolicy::from_config(&config.selection);

        Ok(Self {
            config: Arc::new(config),
            embedder,
            retriever: Arc::new(retriever),
            reranker: Arc::new(reranker),
            selection,
            transform: None,
        })
    }

    /// Run `transform` on every query before embedding.
    #[must_use]
    pub fn with_query_transform(mut self, transform: Arc<dyn QueryTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CandidateStore {
        self.retriever.store()
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    pub fn reranker_name(&self) -> &str {
        self.reranker.backend_name()
    }

    /// Selection policy from the configuration.
    pub fn selection(&self) -> &SelectionPolicy {
        &self.selection
    }

    /// Search with the configured selection policy.
    pub async fn search(&self, query: &str) -> Result<SearchOutcome> {
        self.search_with(query, &self.selection).await
    }

    /// Search with an explicit selection policy.
    ///
    /// A query with no qualifying match is `Ok` with empty results.
    pub async fn search_with(&self, query: &str, selection: &SelectionPolicy) -> Result<SearchOutcome> {
        let mut stats = SearchStats::default();
        let effective = self.transform_query(query).await;

        let start = Instant::now();
        let policy = retry_policy(&self.config, self.config.limits.embed_timeout_ms);
        let candidates = with_retry(Stage::Embed, policy, || {
            self.retriever.retrieve(self.embedder.as_ref(), &effective)
        })
        .await
        .map_err(unavailable)?;
        stats.retrieve_ms = start.elapsed().as_millis() as u64;
        stats.retrieved = candidates.len();
        tracing::debug!("Retrieved {} candidates in {}ms", candidates.len(), stats.retrieve_ms);

        let start = Instant::now();
        let reranked = if candidates.is_empty() {
            Reranked::default()
        } else {
            match self.reranker.rerank(query, &candidates).await {
                Ok(reranked) => reranked,
                Err(exhausted) if self.config.rerank.fallback == RerankFallback::Retrieval => {
                    tracing::warn!(
                        "Reranker unavailable after {} attempt(s) ({}), using retrieval scores",
                        exhausted.attempts,
                        exhausted.last_error
                    );
                    stats.fallback_used = true;
                    Reranked {
                        candidates: candidates.clone(),
                        issues: Vec::new(),
                    }
                }
                Err(exhausted) => return Err(unavailable(exhausted)),
            }
        };
        stats.rerank_ms = start.elapsed().as_millis() as u64;
        stats.reranked = reranked.candidates.len();
        tracing::debug!("Reranked {} candidates in {}ms", stats.reranked, stats.rerank_ms);

        let start = Instant::now();
        let results = selection.select(&reranked.candidates);
        stats.select_ms = start.elapsed().as_millis() as u64;
        stats.selected = results.len();
        stats.effective_query = effective;

        Ok(SearchOutcome {
            query: query.to_string(),
            results,
            issues: reranked.issues,
            stats,
        })
    }

    /// Apply the query transform, keeping the original query if it fails.
    async fn transform_query(&self, query: &str) -> String {
        let Some(transform) = &self.transform else {
            return query.to_string();
        };
        let timeout_ms = self.config.limits.transform_timeout_ms;
        let limit = std::time::Duration::from_millis(timeout_ms);
        match tokio::time::timeout(limit, transform.transform(query)).await {
            Ok(Ok(rewritten)) => rewritten,
            Ok(Err(e)) => {
                tracing::warn!("Query transform '{}' failed: {e}. Using original query", transform.name());
                query.to_string()
            }
            Err(_) => {
                let e = BackendError::Timeout {
                    stage: Stage::QueryTransform,
                    timeout_ms,
                };
                tracing::warn!("Query transform '{}' failed: {e}. Using original query", transform.name());
                query.to_string()
            }
        }
    }
}

fn retry_policy(config: &Config, timeout_ms: u64) -> RetryPolicy {
    RetryPolicy {
        retry_attempts: config.pipeline.retry_attempts,
        retry_delay_ms: config.pipeline.retry_delay_ms,
        timeout_ms,
    }
}

fn unavailable(exhausted: Exhausted) -> TraverseError {
    TraverseError::ServiceUnavailable {
        stage: exhausted.stage,
        attempts: exhausted.attempts,
        source: exhausted.last_error,
    }
}
