//! Traverse Core - natural-language query to OpenStreetMap tag search.
//!
//! Traverse maps a free-form query ("restaurant indien", "où acheter du pain")
//! to a ranked set of `key=value` tags from a controlled vocabulary.
//!
//! # Architecture
//!
//! A two-stage retrieve-and-rerank pipeline over a read-only corpus:
//!
//! ```text
//! Query → [Transform] → Embed → Retrieve (per category) → Rerank (batched) → Select (Popular/Niche) → TagMatch
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use traverse_core::{Config, Traverse};
//!
//! #[tokio::main]
//! async fn main() -> traverse_core::Result<()> {
//!     let config = Config::load()?;
//!     let traverse = Traverse::new(config).await?;
//!
//!     let outcome = traverse.search("restaurant indien").await?;
//!     for m in outcome.matches() {
//!         println!("{} ({:?}) {:.3}", m.tag, m.visibility, m.score);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod corpus;
pub mod embedding;
pub mod error;
pub mod math;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod rerank;
pub mod retrieval;
pub mod retry;
pub mod selection;
pub mod types;

pub use config::Config;
pub use corpus::{CandidateStore, CategoryShard, FlatIndex, VectorIndex};
pub use embedding::{Embedder, EmbedderFactory};
pub use error::{BackendError, ConfigError, Result, Stage, TraverseError};
pub use output::{OutputFormat, OutputWriter};
pub use pipeline::Traverse;
pub use query::{OllamaExpander, QueryTransform};
pub use rerank::{RerankPair, Reranker, ScoringBackend, ScoringBackendFactory};
pub use retrieval::Retriever;
pub use selection::SelectionPolicy;
pub use types::{
    Candidate, Category, DataQualityIssue, IssueKind, SearchOutcome, SearchStats, TagMatch,
    TagRecord, Visibility,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
