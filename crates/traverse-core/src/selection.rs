//! Popularity-aware result shaping.
//!
//! Candidates are split into Popular (`usage_count >= threshold`) and Niche
//! buckets, each bucket is sorted by rerank score and capped at `top_k`, and
//! the buckets are concatenated Popular first. With the default per-category
//! scope this happens once per category, categories in declared order.

use std::cmp::Ordering;

use crate::config::{BucketScope, SelectionConfig};
use crate::types::{Candidate, Category, Visibility};

/// Bucketing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    pub usage_count_threshold: u64,
    pub top_k: usize,
    pub scope: BucketScope,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self::from_config(&SelectionConfig::default())
    }
}

impl SelectionPolicy {
    pub fn from_config(config: &SelectionConfig) -> Self {
        Self {
            usage_count_threshold: config.usage_count_threshold,
            top_k: config.top_k,
            scope: config.scope,
        }
    }

    /// Override the per-bucket cap.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Override the popularity threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.usage_count_threshold = threshold;
        self
    }

    /// Bucket a candidate belongs to. Depends on nothing but its usage count.
    pub fn bucket_of(&self, candidate: &Candidate) -> Visibility {
        if candidate.usage_count() >= self.usage_count_threshold {
            Visibility::Popular
        } else {
            Visibility::Niche
        }
    }

    /// Compose the final ordered output.
    pub fn select(&self, candidates: &[Candidate]) -> Vec<Candidate> {
        match self.scope {
            BucketScope::PerCategory => Category::ALL
                .iter()
                .flat_map(|&category| {
                    let members: Vec<&Candidate> =
                        candidates.iter().filter(|c| c.category() == category).collect();
                    self.split_and_top(&members)
                })
                .collect(),
            BucketScope::Global => {
                let members: Vec<&Candidate> = candidates.iter().collect();
                self.split_and_top(&members)
            }
        }
    }

    fn split_and_top(&self, members: &[&Candidate]) -> Vec<Candidate> {
        let (popular, niche): (Vec<&Candidate>, Vec<&Candidate>) = members
            .iter()
            .copied()
            .partition(|c| self.bucket_of(c) == Visibility::Popular);

        let mut out = self.top(popular, Visibility::Popular);
        out.extend(self.top(niche, Visibility::Niche));
        out
    }

    fn top(&self, mut bucket: Vec<&Candidate>, visibility: Visibility) -> Vec<Candidate> {
        bucket.sort_by(|a, b| by_score_then_tag(a, b));
        bucket
            .into_iter()
            .take(self.top_k)
            .map(|c| c.with_visibility(visibility))
            .collect()
    }
}

fn by_score_then_tag(a: &Candidate, b: &Candidate) -> Ordering {
    b.score()
        .total_cmp(&a.score())
        .then_with(|| a.tag().cmp(b.tag()))
}
