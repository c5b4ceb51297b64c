//! First stage: per-category nearest-neighbor search, merged and capped.

use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::corpus::CandidateStore;
use crate::embedding::Embedder;
use crate::error::BackendError;
use crate::types::Candidate;

/// Searches every category index with one query vector.
pub struct Retriever {
    store: Arc<CandidateStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(store: Arc<CandidateStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    /// Embed `query` once and search with it.
    pub async fn retrieve(
        &self,
        embedder: &dyn Embedder,
        query: &str,
    ) -> Result<Vec<Candidate>, BackendError> {
        let embedding = embedder.embed(query).await?;
        self.search_embedding(&embedding)
    }

    /// Search all categories with an already-computed query vector.
    ///
    /// Returns at most `top_k_total` candidates, none scoring below
    /// `min_score`, sorted by similarity descending. Equal scores keep
    /// category order, then index order.
    pub fn search_embedding(&self, embedding: &[f32]) -> Result<Vec<Candidate>, BackendError> {
        let mut merged = Vec::new();

        for shard in self.store.shards() {
            if shard.is_empty() {
                continue;
            }
            if shard.index().dimension() != embedding.len() {
                return Err(BackendError::embedding(format!(
                    "query vector has {} dimensions, '{}' index stores {}",
                    embedding.len(),
                    shard.category(),
                    shard.index().dimension()
                )));
            }

            let neighbors = shard.index().search(embedding, self.config.top_k_per_category);
            let before = merged.len();
            merged.extend(
                neighbors
                    .into_iter()
                    .filter(|n| n.score >= self.config.min_score)
                    .filter_map(|n| shard.candidate(n.id).map(|c| c.with_score(n.score))),
            );
            tracing::debug!(
                "Retrieved {} '{}' candidates (k={})",
                merged.len() - before,
                shard.category(),
                self.config.top_k_per_category
            );
        }

        merged.sort_by(|a, b| b.score().total_cmp(&a.score()));
        merged.truncate(self.config.top_k_total);
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{CategoryShard, FlatIndex};
    use crate::types::{Category, TagRecord};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ConstantEmbedder {
        vector: Vec<f32>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Embedder for ConstantEmbedder {
        fn name(&self) -> &str {
            "constant"
        }

        fn dimension(&self) -> usize {
            self.vector.len()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector.clone())
        }
    }

    fn unit(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    /// Tags `{prefix}{i}` with row `i` at angle `i * 0.1` from the x axis.
    fn shard(category: Category, prefix: &str, n: usize) -> CategoryShard {
        let records = (0..n)
            .map(|i| TagRecord::new(format!("{prefix}{i}"), "label", "", 1))
            .collect();
        let rows: Vec<Vec<f32>> = (0..n).map(|i| unit(i as f32 * 0.1)).collect();
        CategoryShard::new(category, records, Arc::new(FlatIndex::from_rows(&rows).unwrap())).unwrap()
    }

    fn retriever(per_category: usize, total: usize, min_score: f32) -> Retriever {
        let store = CandidateStore::new(vec![
            shard(Category::Poi, "poi=", 20),
            shard(Category::Attribute, "attr=", 20),
        ])
        .unwrap();
        Retriever::new(
            Arc::new(store),
            RetrievalConfig {
                top_k_per_category: per_category,
                top_k_total: total,
                min_score,
            },
        )
    }

    fn assert_non_increasing(results: &[Candidate]) {
        for w in results.windows(2) {
            assert!(w[0].score() >= w[1].score(), "{} < {}", w[0].score(), w[1].score());
        }
    }

    #[test]
    fn test_per_category_bound_and_order() {
        let r = retriever(3, 100, -1.0);
        let results = r.search_embedding(&unit(0.0)).unwrap();
        assert_eq!(results.len(), 6);
        assert_non_increasing(&results);
        for category in Category::ALL {
            assert_eq!(results.iter().filter(|c| c.category() == category).count(), 3);
        }
    }

    #[test]
    fn test_merge_cap_and_min_score() {
        let r = retriever(10, 7, 0.9);
        let results = r.search_embedding(&unit(0.0)).unwrap();
        assert!(results.len() <= 7);
        assert!(results.iter().all(|c| c.score() >= 0.9));
        assert_non_increasing(&results);
    }

    #[test]
    fn test_k_larger_than_corpus_returns_everything() {
        let r = retriever(500, 500, -1.0);
        assert_eq!(r.search_embedding(&unit(0.3)).unwrap().len(), 40);
    }

    #[test]
    fn test_equal_scores_keep_category_order() {
        let r = retriever(1, 2, -1.0);
        let results = r.search_embedding(&unit(0.0)).unwrap();
        assert_eq!(results[0].tag(), "poi=0");
        assert_eq!(results[1].tag(), "attr=0");
    }

    #[test]
    fn test_high_min_score_yields_empty() {
        let r = retriever(5, 5, 1.5);
        assert!(r.search_embedding(&unit(0.0)).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_dimension_is_backend_error() {
        let r = retriever(5, 5, 0.0);
        assert!(r.search_embedding(&[1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_deterministic() {
        let r = retriever(4, 6, 0.0);
        let a: Vec<String> = r.search_embedding(&unit(0.7)).unwrap().iter().map(|c| c.tag().to_string()).collect();
        let b: Vec<String> = r.search_embedding(&unit(0.7)).unwrap().iter().map(|c| c.tag().to_string()).collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_query_embedded_once_for_all_categories() {
        let r = retriever(2, 4, 0.0);
        let embedder = ConstantEmbedder {
            vector: unit(0.0),
            calls: AtomicU32::new(0),
        };
        let results = r.retrieve(&embedder, "").await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }
}
