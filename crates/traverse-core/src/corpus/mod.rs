//! Read-only tag corpus: per-category record lists paired with their vector index.
//!
//! Index ordinal `i` refers to record `i`. A category is only usable once
//! [`CategoryShard::new`] has checked that correspondence, so a store that
//! exists is a store that is aligned.

pub mod index;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::types::{Candidate, Category, TagRecord};

pub use index::{FlatIndex, IndexMeta, Neighbor, VectorIndex};

/// One category: its ordered records and the index built over them.
pub struct CategoryShard {
    category: Category,
    records: Vec<Arc<TagRecord>>,
    index: Arc<dyn VectorIndex>,
}

impl CategoryShard {
    /// Pair a record list with its index.
    ///
    /// Fails if the index size differs from the record count or a tag repeats.
    pub fn new(
        category: Category,
        records: Vec<TagRecord>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, ConfigError> {
        if index.len() != records.len() {
            return Err(ConfigError::IndexMismatch {
                category,
                index_len: index.len(),
                records_len: records.len(),
            });
        }

        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.tag.as_str()) {
                return Err(ConfigError::DuplicateTag {
                    category,
                    tag: record.tag.clone(),
                });
            }
        }

        Ok(Self {
            category,
            records: records.into_iter().map(Arc::new).collect(),
            index,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// Fresh candidate for the record at ordinal `id`.
    pub fn candidate(&self, id: usize) -> Option<Candidate> {
        self.records
            .get(id)
            .map(|record| Candidate::new(Arc::clone(record), self.category))
    }

    pub fn records(&self) -> impl Iterator<Item = &TagRecord> {
        self.records.iter().map(|r| &**r)
    }
}

/// The full corpus, one shard per enabled category in declared order.
#[derive(Default)]
pub struct CandidateStore {
    shards: Vec<CategoryShard>,
}

impl CandidateStore {
    /// Build a store from already-validated shards.
    pub fn new(mut shards: Vec<CategoryShard>) -> Result<Self, ConfigError> {
        shards.sort_by_key(CategoryShard::category);
        if let Some(dup) = shards.windows(2).find(|w| w[0].category == w[1].category) {
            return Err(ConfigError::DuplicateCategory(dup[0].category));
        }
        Ok(Self { shards })
    }

    /// Load `{category}.json` + `{category}.index` for each category from `data_dir`.
    pub fn load(data_dir: &Path, categories: &[Category]) -> Result<Self, ConfigError> {
        let mut shards = Vec::with_capacity(categories.len());
        for &category in categories {
            let records_path = records_path(data_dir, category);
            let records = load_records(&records_path)?;
            let (index, meta) = FlatIndex::load(&index_path(data_dir, category))?;

            if let Some(expected) = &meta.records_hash {
                let actual = records_hash(&records);
                if *expected != actual {
                    return Err(ConfigError::RecordsHashMismatch {
                        category,
                        expected: expected.clone(),
                        actual,
                    });
                }
            }

            let shard = CategoryShard::new(category, records, Arc::new(index))?;
            tracing::info!(
                "Loaded category '{}': {} tags, index dim {}",
                category,
                shard.len(),
                shard.index().dimension()
            );
            shards.push(shard);
        }
        Self::new(shards)
    }

    pub fn shards(&self) -> &[CategoryShard] {
        &self.shards
    }

    pub fn shard(&self, category: Category) -> Option<&CategoryShard> {
        self.shards.iter().find(|s| s.category == category)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.shards.iter().map(CategoryShard::category).collect()
    }

    /// Total number of records across categories.
    pub fn len(&self) -> usize {
        self.shards.iter().map(CategoryShard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail unless every index stores vectors of `dimension`.
    pub fn check_dimension(&self, dimension: usize) -> Result<(), ConfigError> {
        for shard in &self.shards {
            if !shard.is_empty() && shard.index().dimension() != dimension {
                return Err(ConfigError::DimensionMismatch {
                    category: shard.category,
                    expected: dimension,
                    actual: shard.index().dimension(),
                });
            }
        }
        Ok(())
    }
}

/// Path of the record collection for a category.
pub fn records_path(data_dir: &Path, category: Category) -> PathBuf {
    data_dir.join(format!("{category}.json"))
}

/// Path of the serialized index for a category.
pub fn index_path(data_dir: &Path, category: Category) -> PathBuf {
    data_dir.join(format!("{category}.index"))
}

/// Read a JSON array of records.
pub fn load_records(path: &Path) -> Result<Vec<TagRecord>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingArtifact {
            what: "tag records".to_string(),
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| ConfigError::Records {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// BLAKE3 hash of all tags in order.
///
/// Stored in the index sidecar so a reordered record file is caught even when
/// its length still matches.
pub fn records_hash(records: &[TagRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for record in records {
        hasher.update(record.tag.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}
