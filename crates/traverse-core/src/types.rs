//! Core data types for the Traverse search pipeline.
//!
//! A [`TagRecord`] is loaded once and never changes. A [`Candidate`] wraps a
//! shared record with the per-query fields (`score`, `visibility`); every
//! pipeline stage returns new candidates instead of mutating its input.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Tag category. Declaration order is the order categories appear in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Places: `amenity=restaurant`, `shop=bakery`, ...
    Poi,
    /// Characteristics of places: `cuisine=indian`, `wheelchair=yes`, ...
    Attribute,
}

impl Category {
    /// All categories in their fixed declared order.
    pub const ALL: [Category; 2] = [Category::Poi, Category::Attribute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poi => "poi",
            Self::Attribute => "attribute",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Popularity bucket, assigned only by the selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Unset,
    Popular,
    Niche,
}

/// A persisted tag record, as stored in `{category}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    /// `key=value` identifier (e.g., "amenity=restaurant")
    pub tag: String,

    /// Short human label (e.g., "Restaurant")
    #[serde(default)]
    pub short_label: String,

    /// Natural-language description used as rerank document text
    #[serde(default)]
    pub rich_description: String,

    /// Real-world usage count (Taginfo), a popularity proxy
    #[serde(default)]
    pub usage_count: u64,
}

impl TagRecord {
    pub fn new(
        tag: impl Into<String>,
        short_label: impl Into<String>,
        rich_description: impl Into<String>,
        usage_count: u64,
    ) -> Self {
        Self {
            tag: tag.into(),
            short_label: short_label.into(),
            rich_description: rich_description.into(),
            usage_count,
        }
    }
}

/// One retrievable tag with a query-scoped score.
///
/// Cloning is cheap: the record is shared, only `score` and `visibility` are owned.
#[derive(Debug, Clone)]
pub struct Candidate {
    record: Arc<TagRecord>,
    category: Category,
    score: f32,
    visibility: Visibility,
}

impl Candidate {
    pub fn new(record: Arc<TagRecord>, category: Category) -> Self {
        Self {
            record,
            category,
            score: 0.0,
            visibility: Visibility::Unset,
        }
    }

    /// Copy of this candidate with a new score.
    #[must_use]
    pub fn with_score(&self, score: f32) -> Self {
        Self {
            score,
            ..self.clone()
        }
    }

    /// Copy of this candidate with a new visibility.
    #[must_use]
    pub fn with_visibility(&self, visibility: Visibility) -> Self {
        Self {
            visibility,
            ..self.clone()
        }
    }

    pub fn tag(&self) -> &str {
        &self.record.tag
    }

    pub fn short_label(&self) -> &str {
        &self.record.short_label
    }

    pub fn rich_description(&self) -> &str {
        &self.record.rich_description
    }

    pub fn usage_count(&self) -> u64 {
        self.record.usage_count
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn record(&self) -> &Arc<TagRecord> {
        &self.record
    }

    /// Whether the candidate has any descriptive text besides the tag itself.
    pub fn has_text(&self) -> bool {
        !self.record.short_label.trim().is_empty() || !self.record.rich_description.trim().is_empty()
    }

    /// Document side of a rerank pair: `tag (short label): rich description`.
    ///
    /// Empty parts are left out.
    pub fn document_text(&self) -> String {
        let label = self.record.short_label.trim();
        let description = self.record.rich_description.trim();
        let head = if label.is_empty() {
            self.record.tag.clone()
        } else {
            format!("{} ({})", self.record.tag, label)
        };
        if description.is_empty() {
            head
        } else {
            format!("{head}: {description}")
        }
    }
}

/// Service-facing result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMatch {
    pub tag: String,
    pub description: String,
    pub score: f32,
    pub category: Category,
    pub visibility: Visibility,
}

impl From<&Candidate> for TagMatch {
    fn from(c: &Candidate) -> Self {
        let description = if c.rich_description().trim().is_empty() {
            c.short_label().to_string()
        } else {
            c.rich_description().to_string()
        };
        Self {
            tag: c.tag().to_string(),
            description,
            score: c.score(),
            category: c.category(),
            visibility: c.visibility(),
        }
    }
}

/// What was wrong with a dropped candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IssueKind {
    /// Backend returned NaN or infinity
    NonFiniteScore,
    /// Backend returned a score outside [0, 1]
    ScoreOutOfRange(f32),
    /// Candidate has no descriptive text to rerank against
    EmptyText,
}

/// A candidate dropped from the pipeline for data-quality reasons.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQualityIssue {
    pub tag: String,
    pub category: Category,
    pub kind: IssueKind,
}

impl DataQualityIssue {
    pub fn new(candidate: &Candidate, kind: IssueKind) -> Self {
        Self {
            tag: candidate.tag().to_string(),
            category: candidate.category(),
            kind,
        }
    }
}

/// Per-query counters and timings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStats {
    /// Query actually embedded (after any transform)
    pub effective_query: String,
    pub retrieved: usize,
    pub reranked: usize,
    pub selected: usize,
    pub retrieve_ms: u64,
    pub rerank_ms: u64,
    pub select_ms: u64,
    /// Reranker was unavailable and retrieval scores were used instead
    pub fallback_used: bool,
}

/// Result of one search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub query: String,
    pub results: Vec<Candidate>,
    pub issues: Vec<DataQualityIssue>,
    pub stats: SearchStats,
}

impl SearchOutcome {
    /// Service-facing view of the results.
    pub fn matches(&self) -> Vec<TagMatch> {
        self.results.iter().map(TagMatch::from).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
