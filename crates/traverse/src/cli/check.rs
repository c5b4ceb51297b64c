//! The `traverse check` command: load everything and report what was loaded.

use std::path::PathBuf;

use traverse_core::config::{EmbeddingProvider, RerankStrategy};
use traverse_core::embedding::OnnxEmbedder;
use traverse_core::rerank::YesNoBackend;
use traverse_core::{Config, Traverse, VectorIndex};

/// A local model the configuration loads from disk.
#[derive(Debug, PartialEq)]
struct LocalModel {
    role: &'static str,
    dir: PathBuf,
    present: bool,
}

/// Local models required by `config`. HTTP providers need none.
fn local_models(config: &Config) -> Vec<LocalModel> {
    let model_dir = config.model_dir();
    let mut models = Vec::new();
    if config.embedding.provider == EmbeddingProvider::Onnx {
        let dir = model_dir.join(&config.embedding.model);
        models.push(LocalModel {
            role: "embedding",
            present: OnnxEmbedder::model_exists(&dir),
            dir,
        });
    }
    if config.rerank.strategy == RerankStrategy::YesNo {
        let dir = model_dir.join(&config.rerank.yes_no.model);
        models.push(LocalModel {
            role: "rerank",
            present: YesNoBackend::model_exists(&dir),
            dir,
        });
    }
    models
}

/// Execute the check command.
///
/// Fails with the loading error when the corpus, index or a model is missing
/// or inconsistent.
pub async fn execute(config: Config) -> anyhow::Result<()> {
    for model in local_models(&config) {
        let state = if model.present { "found" } else { "missing" };
        println!("{} model: {} ({state})", model.role, model.dir.display());
    }

    let threshold = config.selection.usage_count_threshold;
    let traverse = Traverse::new(config).await?;

    println!(
        "embedder: {} ({} dims)",
        traverse.embedder_name(),
        traverse.config().embedding.dimension
    );
    println!("reranker: {}", traverse.reranker_name());

    for shard in traverse.store().shards() {
        let popular = shard
            .records()
            .filter(|r| r.usage_count >= threshold)
            .count();
        println!(
            "{}: {} tags, {} popular (usage >= {}), index dim {}",
            shard.category(),
            shard.len(),
            popular,
            threshold,
            shard.index().dimension()
        );
    }

    println!("ok: {} tags total", traverse.store().len());
    Ok(())
}
