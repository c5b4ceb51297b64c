//! End-to-end scenarios against on-disk corpora.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use traverse_core::corpus::{index_path, records_hash, records_path};
use traverse_core::math::l2_normalize;
use traverse_core::{
    BackendError, CandidateStore, Category, Config, ConfigError, Embedder, FlatIndex, RerankPair,
    ScoringBackend, TagRecord, Traverse, TraverseError, Visibility,
};

const AXES: [&str; 4] = ["restaurant", "indien", "pain", "manger"];

fn keyword_vector(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    let raw: Vec<f32> = AXES
        .iter()
        .map(|k| if text.contains(k) { 1.0 } else { 0.05 })
        .collect();
    l2_normalize(&raw)
}

struct KeywordEmbedder {
    seen: Mutex<Vec<String>>,
}

impl KeywordEmbedder {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn name(&self) -> &str {
        "keyword"
    }

    fn dimension(&self) -> usize {
        AXES.len()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.seen.lock().unwrap().push(text.to_string());
        Ok(keyword_vector(text))
    }
}

/// Fixed score per tag, found through the document text.
struct TagScores {
    scores: Vec<(&'static str, f32)>,
    calls: AtomicU32,
}

impl TagScores {
    fn new(scores: Vec<(&'static str, f32)>) -> Self {
        Self {
            scores,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ScoringBackend for TagScores {
    fn name(&self) -> &str {
        "tag-scores"
    }

    async fn score(&self, pairs: &[RerankPair]) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(pairs
            .iter()
            .map(|p| {
                self.scores
                    .iter()
                    .find(|(tag, _)| p.document.starts_with(tag))
                    .map(|(_, s)| *s)
                    .unwrap_or(0.0)
            })
            .collect())
    }
}

fn write_category(dir: &Path, category: Category, records: &[TagRecord]) {
    std::fs::write(
        records_path(dir, category),
        serde_json::to_string_pretty(records).unwrap(),
    )
    .unwrap();
    let rows: Vec<Vec<f32>> = records
        .iter()
        .map(|r| keyword_vector(&format!("{} {}", r.short_label, r.rich_description)))
        .collect();
    FlatIndex::from_rows(&rows)
        .unwrap()
        .save(&index_path(dir, category), Some(&records_hash(records)))
        .unwrap();
}

fn scenario_a_corpus(dir: &Path, bakery_usage: u64) {
    write_category(
        dir,
        Category::Poi,
        &[
            TagRecord::new(
                "amenity=restaurant",
                "Restaurant",
                "Lieu où l'on vient manger au restaurant",
                2_000_000,
            ),
            TagRecord::new("amenity=bakery", "Boulangerie", "Commerce qui vend du pain", bakery_usage),
        ],
    );
    write_category(
        dir,
        Category::Attribute,
        &[TagRecord::new(
            "cuisine=indian",
            "Cuisine indienne",
            "Restaurant servant de la cuisine indien",
            200,
        )],
    );
}

fn scenario_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.data_dir = dir.to_path_buf();
    config.embedding.dimension = AXES.len();
    config.retrieval.top_k_per_category = 2;
    config.retrieval.top_k_total = 4;
    config.retrieval.min_score = 0.0;
    config.selection.usage_count_threshold = 10_000;
    config.selection.top_k = 1;
    config.pipeline.retry_delay_ms = 1;
    config
}

fn scenario_a_scores() -> TagScores {
    TagScores::new(vec![
        ("cuisine=indian", 0.95),
        ("amenity=restaurant", 0.7),
        ("amenity=bakery", 0.4),
    ])
}

fn build(dir: &Path, backend: Arc<dyn ScoringBackend>) -> (Traverse, Arc<KeywordEmbedder>) {
    let config = scenario_config(dir);
    let store = CandidateStore::load(dir, &config.corpus.categories).unwrap();
    let embedder = Arc::new(KeywordEmbedder::new());
    let traverse = Traverse::from_parts(config, store, embedder.clone(), backend).unwrap();
    (traverse, embedder)
}

fn tags(outcome: &traverse_core::SearchOutcome) -> Vec<(String, Visibility)> {
    outcome
        .results
        .iter()
        .map(|c| (c.tag().to_string(), c.visibility()))
        .collect()
}

#[tokio::test]
async fn scenario_a_retrieval_returns_all_three_sorted() {
    let dir = tempfile::tempdir().unwrap();
    scenario_a_corpus(dir.path(), 50_000);
    let (traverse, _) = build(dir.path(), Arc::new(scenario_a_scores()));

    let outcome = traverse.search("restaurant indien").await.unwrap();
    assert_eq!(outcome.stats.retrieved, 3);
    assert_eq!(outcome.stats.reranked, 3);
    assert!(outcome.issues.is_empty());
}

#[tokio::test]
async fn scenario_a_popular_and_niche_buckets_per_category() {
    let dir = tempfile::tempdir().unwrap();
    scenario_a_corpus(dir.path(), 5_000);
    let (traverse, _) = build(dir.path(), Arc::new(scenario_a_scores()));

    let outcome = traverse.search("restaurant indien").await.unwrap();
    assert_eq!(
        tags(&outcome),
        vec![
            ("amenity=restaurant".to_string(), Visibility::Popular),
            ("amenity=bakery".to_string(), Visibility::Niche),
            ("cuisine=indian".to_string(), Visibility::Niche),
        ]
    );
    let indian = outcome.matches().into_iter().find(|m| m.tag == "cuisine=indian").unwrap();
    assert_eq!(indian.score, 0.95);
    assert_eq!(indian.category, Category::Attribute);
}

#[tokio::test]
async fn scenario_a_bucket_is_decided_by_usage_count_only() {
    // amenity=bakery at 50,000 uses is above the threshold, so it competes with
    // amenity=restaurant for the single Popular POI slot and loses on score.
    let dir = tempfile::tempdir().unwrap();
    scenario_a_corpus(dir.path(), 50_000);
    let (traverse, _) = build(dir.path(), Arc::new(scenario_a_scores()));

    let outcome = traverse.search("restaurant indien").await.unwrap();
    assert_eq!(
        tags(&outcome),
        vec![
            ("amenity=restaurant".to_string(), Visibility::Popular),
            ("cuisine=indian".to_string(), Visibility::Niche),
        ]
    );
}

#[tokio::test]
async fn scenario_b_length_mismatch_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<TagRecord> = (0..99)
        .map(|i| TagRecord::new(format!("shop=kind{i}"), format!("Shop {i}"), "", i))
        .collect();
    std::fs::write(
        records_path(dir.path(), Category::Poi),
        serde_json::to_string(&records).unwrap(),
    )
    .unwrap();
    let rows: Vec<Vec<f32>> = (0..100).map(|_| keyword_vector("pain")).collect();
    FlatIndex::from_rows(&rows)
        .unwrap()
        .save(&index_path(dir.path(), Category::Poi), None)
        .unwrap();
    write_category(dir.path(), Category::Attribute, &[TagRecord::new("a=b", "A", "B", 1)]);

    let err = CandidateStore::load(dir.path(), &[Category::Poi, Category::Attribute])
        .err()
        .unwrap();
    assert!(matches!(
        err,
        ConfigError::IndexMismatch {
            category: Category::Poi,
            index_len: 100,
            records_len: 99
        }
    ));

    let err = Traverse::new(scenario_config(dir.path())).await.err().unwrap();
    assert!(matches!(err, TraverseError::Config(ConfigError::IndexMismatch { .. })));
    assert_eq!(err.exit_code(), 78);
    assert_eq!(err.http_status(), 500);
    assert!(!err.public_message().contains("100"));
}

#[tokio::test]
async fn scenario_c_empty_query_is_embedded_and_searched() {
    let dir = tempfile::tempdir().unwrap();
    scenario_a_corpus(dir.path(), 50_000);
    let backend = Arc::new(scenario_a_scores());
    let (traverse, embedder) = build(dir.path(), backend.clone());

    let outcome = traverse.search("").await.unwrap();
    assert_eq!(*embedder.seen.lock().unwrap(), vec![String::new()]);
    assert_eq!(outcome.stats.retrieved, 3);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert!(!outcome.is_empty());
}

#[tokio::test]
async fn scenario_c_empty_query_results_governed_by_min_score() {
    let dir = tempfile::tempdir().unwrap();
    scenario_a_corpus(dir.path(), 50_000);
    let mut config = scenario_config(dir.path());
    config.retrieval.min_score = 0.99;
    let store = CandidateStore::load(dir.path(), &config.corpus.categories).unwrap();
    let traverse = Traverse::from_parts(
        config,
        store,
        Arc::new(KeywordEmbedder::new()),
        Arc::new(scenario_a_scores()),
    )
    .unwrap();

    let outcome = traverse.search("").await.unwrap();
    assert!(outcome.is_empty());
    assert!(outcome.matches().is_empty());
}
