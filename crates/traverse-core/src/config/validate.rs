//! Configuration validation with range checks.

use std::collections::HashSet;

use crate::error::ConfigError;

use super::Config;

fn invalid(message: &str) -> Result<(), ConfigError> {
    Err(ConfigError::ValidationError(message.to_string()))
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.corpus.categories.is_empty() {
            return invalid("corpus.categories must not be empty");
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.corpus.categories.iter().find(|c| !seen.insert(**c)) {
            return Err(ConfigError::DuplicateCategory(*dup));
        }
        if self.retrieval.top_k_per_category == 0 {
            return invalid("retrieval.top_k_per_category must be > 0");
        }
        if self.retrieval.top_k_total == 0 {
            return invalid("retrieval.top_k_total must be > 0");
        }
        if !self.retrieval.min_score.is_finite() {
            return invalid("retrieval.min_score must be a finite number");
        }
        if self.embedding.dimension == 0 {
            return invalid("embedding.dimension must be > 0");
        }
        if self.embedding.max_length < 8 {
            return invalid("embedding.max_length must be at least 8");
        }
        if self.rerank.batch_size == 0 {
            return invalid("rerank.batch_size must be > 0");
        }
        if self.rerank.parallel_batches == 0 {
            return invalid("rerank.parallel_batches must be > 0");
        }
        if self.rerank.yes_no.max_length == 0 {
            return invalid("rerank.yes_no.max_length must be > 0");
        }
        if self.selection.top_k == 0 {
            return invalid("selection.top_k must be > 0");
        }
        if self.limits.embed_timeout_ms == 0 {
            return invalid("limits.embed_timeout_ms must be > 0");
        }
        if self.limits.rerank_timeout_ms == 0 {
            return invalid("limits.rerank_timeout_ms must be > 0");
        }
        if self.limits.transform_timeout_ms == 0 {
            return invalid("limits.transform_timeout_ms must be > 0");
        }
        Ok(())
    }
}
