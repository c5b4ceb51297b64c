//! Pointwise reranking of retrieved candidates.
//!
//! A [`ScoringBackend`] turns (instruction, query, document) triples into one
//! relevance value in [0, 1] per triple. [`Reranker`] owns the discipline around
//! it: one pair per candidate, fixed-size batches, ordered reassembly and
//! data-quality filtering of the returned scores.
//!
//! Strategies (selected by `[rerank].strategy`):
//! - `cross-encoder`: remote `/v1/rerank` endpoint ([`CrossEncoderBackend`])
//! - `yes-no`: local causal LM scored on "yes"/"no" logits ([`YesNoBackend`])

pub mod cross_encoder;
pub mod yes_no;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};

use crate::config::{LimitsConfig, RerankConfig, RerankStrategy};
use crate::error::{BackendError, ConfigError, Stage};
use crate::retry::{with_retry, Exhausted, RetryPolicy};
use crate::types::{Candidate, Category, DataQualityIssue, IssueKind};

pub use cross_encoder::CrossEncoderBackend;
pub use yes_no::YesNoBackend;

/// One query/document pair submitted for scoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerankPair {
    pub instruction: String,
    pub query: String,
    pub document: String,
}

impl RerankPair {
    /// Render as the `<Instruct>/<Query>/<Document>` block used by instruction-tuned rerankers.
    pub fn formatted(&self) -> String {
        format!(
            "<Instruct>: {}\n<Query>: {}\n<Document>: {}",
            self.instruction, self.query, self.document
        )
    }
}

/// Scalar-per-pair scoring capability.
///
/// Each pair must be scored independently of the other pairs in the call.
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Score every pair. Must return exactly `pairs.len()` values, in order.
    async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError>;
}

/// Creates the configured scoring backend.
pub struct ScoringBackendFactory;

impl ScoringBackendFactory {
    pub fn create(
        config: &RerankConfig,
        model_dir: &Path,
    ) -> Result<Arc<dyn ScoringBackend>, ConfigError> {
        match config.strategy {
            RerankStrategy::CrossEncoder => {
                Ok(Arc::new(CrossEncoderBackend::new(&config.cross_encoder)))
            }
            RerankStrategy::YesNo => {
                let backend =
                    YesNoBackend::load(&config.yes_no, &model_dir.join(&config.yes_no.model))?;
                Ok(Arc::new(backend))
            }
        }
    }
}

/// Reranked candidates plus the ones dropped on the way.
#[derive(Debug, Clone, Default)]
pub struct Reranked {
    /// Scored candidates in input order
    pub candidates: Vec<Candidate>,
    pub issues: Vec<DataQualityIssue>,
}

/// Batching, retry and validation around a [`ScoringBackend`].
pub struct Reranker {
    backend: Arc<dyn ScoringBackend>,
    config: RerankConfig,
    retry: RetryPolicy,
}

impl Reranker {
    /// Reranker without retries; each batch call is bounded by the default rerank timeout.
    pub fn new(backend: Arc<dyn ScoringBackend>, config: RerankConfig) -> Self {
        Self {
            backend,
            config,
            retry: RetryPolicy {
                retry_attempts: 0,
                retry_delay_ms: 0,
                timeout_ms: LimitsConfig::default().rerank_timeout_ms,
            },
        }
    }

    /// Retry budget applied to each batch independently.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Score `candidates` against `query`.
    ///
    /// Output preserves input order. Candidates without descriptive text, or
    /// whose score is NaN or outside [0, 1], are dropped and reported in
    /// [`Reranked::issues`]. Every other input candidate comes back exactly once
    /// with only its score changed.
    ///
    /// A failing batch is retried on its own; batches that already succeeded
    /// are not scored again. Fails once any batch exhausts its retries.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[Candidate],
    ) -> Result<Reranked, Exhausted> {
        let mut issues = Vec::new();
        let mut scorable = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if candidate.has_text() {
                scorable.push(candidate);
            } else {
                tracing::warn!(
                    "Dropping '{}' ({}): no text to rerank against",
                    candidate.tag(),
                    candidate.category()
                );
                issues.push(DataQualityIssue::new(candidate, IssueKind::EmptyText));
            }
        }

        if scorable.is_empty() {
            return Ok(Reranked {
                candidates: Vec::new(),
                issues,
            });
        }

        let pairs: Vec<RerankPair> = scorable
            .iter()
            .map(|c| self.pair_for(query, c))
            .collect();

        let batches: Vec<Vec<f32>> = stream::iter(
            pairs
                .chunks(self.config.batch_size.max(1))
                .map(|batch| self.score_batch(batch)),
        )
        .buffered(self.config.parallel_batches.max(1))
        .try_collect()
        .await?;

        let mut reranked = Vec::with_capacity(scorable.len());
        for (candidate, score) in scorable.into_iter().zip(batches.into_iter().flatten()) {
            match check_score(score) {
                Ok(score) => reranked.push(candidate.with_score(score)),
                Err(kind) => {
                    tracing::warn!(
                        "Dropping '{}' ({}): backend '{}' returned unusable score {:?}",
                        candidate.tag(),
                        candidate.category(),
                        self.backend.name(),
                        kind
                    );
                    issues.push(DataQualityIssue::new(candidate, kind));
                }
            }
        }

        Ok(Reranked {
            candidates: reranked,
            issues,
        })
    }

    fn pair_for(&self, query: &str, candidate: &Candidate) -> RerankPair {
        RerankPair {
            instruction: self.instruction_for(candidate.category()).to_string(),
            query: query.to_string(),
            document: candidate.document_text(),
        }
    }

    fn instruction_for(&self, category: Category) -> &str {
        self.config.instruction_for(category)
    }

    async fn score_batch(&self, batch: &[RerankPair]) -> Result<Vec<f32>, Exhausted> {
        with_retry(Stage::Rerank, self.retry, || self.score_once(batch)).await
    }

    async fn score_once(&self, batch: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
        let scores = self.backend.score(batch).await?;
        if scores.len() != batch.len() {
            return Err(BackendError::rerank(format!(
                "backend '{}' returned {} scores for {} pairs",
                self.backend.name(),
                scores.len(),
                batch.len()
            )));
        }
        Ok(scores)
    }
}

fn check_score(score: f32) -> Result<f32, IssueKind> {
    if !score.is_finite() {
        Err(IssueKind::NonFiniteScore)
    } else if !(0.0..=1.0).contains(&score) {
        Err(IssueKind::ScoreOutOfRange(score))
    } else {
        Ok(score)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::TagRecord;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Deterministic backend: score depends only on the document text.
    pub(crate) struct HashBackend {
        pub calls: AtomicU32,
        pub seen_instructions: Mutex<Vec<String>>,
    }

    impl HashBackend {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                seen_instructions: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn score_of(document: &str) -> f32 {
            let h = blake3::hash(document.as_bytes());
            h.as_bytes()[0] as f32 / 255.0
        }
    }

    #[async_trait]
    impl ScoringBackend for HashBackend {
        fn name(&self) -> &str {
            "hash"
        }

        async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut seen = self.seen_instructions.lock().unwrap();
            seen.extend(pairs.iter().map(|p| p.instruction.clone()));
            Ok(pairs.iter().map(|p| Self::score_of(&p.document)).collect())
        }
    }

    /// Returns fixed scores keyed by a substring of the document.
    struct ScriptedBackend {
        script: Vec<(&'static str, f32)>,
    }

    #[async_trait]
    impl ScoringBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
            Ok(pairs
                .iter()
                .map(|p| {
                    self.script
                        .iter()
                        .find(|(needle, _)| p.document.contains(needle))
                        .map(|(_, s)| *s)
                        .unwrap_or(0.5)
                })
                .collect())
        }
    }

    /// Later batches finish first.
    struct SlowFirstBackend;

    #[async_trait]
    impl ScoringBackend for SlowFirstBackend {
        fn name(&self) -> &str {
            "slow-first"
        }

        async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
            let first: u64 = pairs[0]
                .document
                .split_whitespace()
                .next()
                .and_then(|tag| tag.trim_start_matches("t=").parse().ok())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(50u64.saturating_sub(first * 5))).await;
            Ok(pairs.iter().map(|_| 0.5).collect())
        }
    }

    struct ShortBackend;

    #[async_trait]
    impl ScoringBackend for ShortBackend {
        fn name(&self) -> &str {
            "short"
        }

        async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
            Ok(vec![0.5; pairs.len().saturating_sub(1)])
        }
    }

    /// Fails the first call of every batch holding `t=2`, then scores 0.5.
    struct FlakyBackend {
        calls: AtomicU32,
        failed: AtomicU32,
        status_code: Option<u16>,
    }

    impl FlakyBackend {
        fn new(status_code: Option<u16>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failed: AtomicU32::new(0),
                status_code,
            }
        }
    }

    #[async_trait]
    impl ScoringBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let holds_target = pairs.iter().any(|p| p.document.starts_with("t=2 "));
            if holds_target && self.failed.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BackendError::Rerank {
                    message: "HTTP 503".to_string(),
                    status_code: self.status_code,
                });
            }
            Ok(vec![0.5; pairs.len()])
        }
    }

    fn retrying(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retry_attempts: retries,
            retry_delay_ms: 1,
            timeout_ms: 5_000,
        }
    }

    pub(crate) fn candidates(n: usize) -> Vec<Candidate> {
        (0..n)
            .map(|i| {
                let tag = format!("t={i}");
                Candidate::new(
                    Arc::new(TagRecord::new(tag, format!("Label {i}"), format!("Description {i}"), i as u64)),
                    if i % 2 == 0 { Category::Poi } else { Category::Attribute },
                )
                .with_score(1.0 - i as f32 / 100.0)
            })
            .collect()
    }

    fn reranker(backend: Arc<dyn ScoringBackend>, batch_size: usize, parallel: usize) -> Reranker {
        let config = RerankConfig {
            batch_size,
            parallel_batches: parallel,
            ..RerankConfig::default()
        };
        Reranker::new(backend, config)
    }

    fn scores(r: &Reranked) -> Vec<(String, f32)> {
        r.candidates.iter().map(|c| (c.tag().to_string(), c.score())).collect()
    }

    #[tokio::test]
    async fn test_batch_size_does_not_change_scores() {
        let input = candidates(23);
        let backend: Arc<dyn ScoringBackend> = Arc::new(HashBackend::new());
        let one = reranker(Arc::clone(&backend), 1, 1).rerank("q", &input).await.unwrap();
        let seven = reranker(Arc::clone(&backend), 7, 3).rerank("q", &input).await.unwrap();
        let all = reranker(backend, 100, 1).rerank("q", &input).await.unwrap();
        assert_eq!(scores(&one), scores(&seven));
        assert_eq!(scores(&one), scores(&all));
    }

    #[tokio::test]
    async fn test_batches_are_chunked() {
        let backend = Arc::new(HashBackend::new());
        reranker(backend.clone(), 10, 1).rerank("q", &candidates(25)).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_parallel_batches_reassemble_in_input_order() {
        let input = candidates(8);
        let out = reranker(Arc::new(SlowFirstBackend), 1, 8).rerank("q", &input).await.unwrap();
        let tags: Vec<&str> = out.candidates.iter().map(Candidate::tag).collect();
        let expected: Vec<&str> = input.iter().map(Candidate::tag).collect();
        assert_eq!(tags, expected);
    }

    #[tokio::test]
    async fn test_identity_preserved() {
        let input = candidates(12);
        let out = reranker(Arc::new(HashBackend::new()), 5, 2).rerank("q", &input).await.unwrap();
        let before: HashSet<&str> = input.iter().map(Candidate::tag).collect();
        let after: HashSet<&str> = out.candidates.iter().map(Candidate::tag).collect();
        assert_eq!(before, after);
        for (a, b) in input.iter().zip(&out.candidates) {
            assert!(Arc::ptr_eq(a.record(), b.record()));
            assert_eq!(a.category(), b.category());
        }
        assert!(out.issues.is_empty());
    }

    #[tokio::test]
    async fn test_rerank_is_deterministic() {
        let input = candidates(9);
        let r = reranker(Arc::new(HashBackend::new()), 4, 2);
        let a = r.rerank("restaurant", &input).await.unwrap();
        let b = r.rerank("restaurant", &input).await.unwrap();
        assert_eq!(scores(&a), scores(&b));
    }

    #[tokio::test]
    async fn test_input_candidates_untouched() {
        let input = candidates(3);
        let original: Vec<f32> = input.iter().map(Candidate::score).collect();
        reranker(Arc::new(HashBackend::new()), 2, 1).rerank("q", &input).await.unwrap();
        assert_eq!(input.iter().map(Candidate::score).collect::<Vec<_>>(), original);
    }

    #[tokio::test]
    async fn test_nan_and_out_of_range_scores_are_dropped() {
        let backend = ScriptedBackend {
            script: vec![("Description 1", f32::NAN), ("Description 2", 1.5), ("Description 3", 0.9)],
        };
        let out = reranker(Arc::new(backend), 2, 1).rerank("q", &candidates(4)).await.unwrap();
        let tags: Vec<&str> = out.candidates.iter().map(Candidate::tag).collect();
        assert_eq!(tags, vec!["t=0", "t=3"]);
        assert_eq!(out.candidates[1].score(), 0.9);
        assert_eq!(out.issues.len(), 2);
        assert_eq!(out.issues[0].kind, IssueKind::NonFiniteScore);
        assert_eq!(out.issues[1].kind, IssueKind::ScoreOutOfRange(1.5));
    }

    #[tokio::test]
    async fn test_empty_text_is_dropped_before_scoring() {
        let mut input = candidates(2);
        input.push(Candidate::new(Arc::new(TagRecord::new("x=y", "", "", 1)), Category::Poi));
        let backend = Arc::new(HashBackend::new());
        let out = reranker(backend.clone(), 10, 1).rerank("q", &input).await.unwrap();
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.issues[0].tag, "x=y");
        assert_eq!(out.issues[0].kind, IssueKind::EmptyText);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inclusive_score_bounds_are_kept() {
        let backend = ScriptedBackend {
            script: vec![("Description 0", 0.0), ("Description 1", 1.0)],
        };
        let out = reranker(Arc::new(backend), 2, 1).rerank("q", &candidates(2)).await.unwrap();
        assert_eq!(scores(&out), vec![("t=0".to_string(), 0.0), ("t=1".to_string(), 1.0)]);
        assert!(out.issues.is_empty());
    }

    #[test]
    fn test_check_score_bounds() {
        assert_eq!(check_score(0.0), Ok(0.0));
        assert_eq!(check_score(1.0), Ok(1.0));
        assert_eq!(check_score(-0.001), Err(IssueKind::ScoreOutOfRange(-0.001)));
        assert_eq!(check_score(1.001), Err(IssueKind::ScoreOutOfRange(1.001)));
        assert_eq!(check_score(f32::INFINITY), Err(IssueKind::NonFiniteScore));
    }

    #[tokio::test]
    async fn test_only_the_failed_batch_is_retried() {
        let mut input = candidates(4);
        input.push(Candidate::new(Arc::new(TagRecord::new("x=y", "", "", 1)), Category::Poi));
        let backend = Arc::new(FlakyBackend::new(Some(503)));
        let out = reranker(backend.clone(), 2, 1)
            .with_retry_policy(retrying(2))
            .rerank("q", &input)
            .await
            .unwrap();

        assert_eq!(out.candidates.len(), 4);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, IssueKind::EmptyText);
    }

    #[tokio::test]
    async fn test_permanent_batch_error_is_not_retried() {
        let backend = Arc::new(FlakyBackend::new(Some(400)));
        let err = reranker(backend.clone(), 2, 1)
            .with_retry_policy(retrying(3))
            .rerank("q", &candidates(4))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Rerank);
        assert_eq!(err.attempts, 1);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let backend = Arc::new(HashBackend::new());
        let out = reranker(backend.clone(), 10, 1).rerank("q", &[]).await.unwrap();
        assert!(out.candidates.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_score_count_mismatch_is_backend_error() {
        let err = reranker(Arc::new(ShortBackend), 3, 1).rerank("q", &candidates(3)).await.unwrap_err();
        assert!(matches!(err.last_error, BackendError::Rerank { .. }));
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_category_instructions_are_applied() {
        let backend = Arc::new(HashBackend::new());
        let mut config = RerankConfig::default();
        config
            .category_instructions
            .insert(Category::Attribute, "attribute instruction".to_string());
        let r = Reranker::new(backend.clone(), config.clone());
        r.rerank("q", &candidates(2)).await.unwrap();
        let seen = backend.seen_instructions.lock().unwrap();
        assert_eq!(seen[0], config.instruction);
        assert_eq!(seen[1], "attribute instruction");
    }

    #[test]
    fn test_pair_formatting() {
        let pair = RerankPair {
            instruction: "Judge".to_string(),
            query: "restaurant indien".to_string(),
            document: "cuisine=indian (Indienne)".to_string(),
        };
        assert_eq!(
            pair.formatted(),
            "<Instruct>: Judge\n<Query>: restaurant indien\n<Document>: cuisine=indian (Indienne)"
        );
    }
}
