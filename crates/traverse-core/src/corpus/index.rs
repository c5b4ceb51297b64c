//! Nearest-neighbor index contract and the flat inner-product implementation.
//!
//! On disk a flat index is a raw little-endian f32 matrix (N × dim, row-major)
//! in `{category}.index`, plus a `{category}.meta` sidecar:
//!
//! ```text
//! dimension=768
//! count=1834
//! records_hash=5f0c...
//! ```
//!
//! Row `i` is the embedding of record `i` in `{category}.json`.

use std::cmp::Ordering;
use std::path::Path;

use crate::error::ConfigError;

/// One search hit: ordinal id into the category's record list plus similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: usize,
    pub score: f32,
}

/// A searchable collection of unit-normalized vectors.
///
/// Implementations return at most `k` neighbors sorted by descending
/// similarity. Ordinal ids are positions in insertion order.
pub trait VectorIndex: Send + Sync {
    /// Number of stored vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimension.
    fn dimension(&self) -> usize;

    /// Up to `k` nearest neighbors of `query`, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor>;
}

/// Sidecar metadata stored next to a flat index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub dimension: usize,
    pub count: usize,
    /// Hash of the record tags the index was built from, in order
    pub records_hash: Option<String>,
}

impl IndexMeta {
    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut dimension = None;
        let mut count = None;
        let mut records_hash = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "dimension" => dimension = value.trim().parse::<usize>().ok(),
                "count" => count = value.trim().parse::<usize>().ok(),
                "records_hash" => records_hash = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let corrupt = |message: &str| ConfigError::CorruptIndex {
            path: path.to_path_buf(),
            message: message.to_string(),
        };

        Ok(Self {
            dimension: dimension.ok_or_else(|| corrupt("metadata is missing 'dimension'"))?,
            count: count.ok_or_else(|| corrupt("metadata is missing 'count'"))?,
            records_hash,
        })
    }

    fn render(&self) -> String {
        let mut out = format!("dimension={}\ncount={}\n", self.dimension, self.count);
        if let Some(hash) = &self.records_hash {
            out.push_str(&format!("records_hash={hash}\n"));
        }
        out
    }
}

/// Exact inner-product search over a flat matrix.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    /// Flat matrix: N × dim stored row-major.
    matrix: Vec<f32>,
    dimension: usize,
    count: usize,
}

impl FlatIndex {
    /// Create an index from row vectors. All rows must share one dimension.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, ConfigError> {
        let dimension = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != dimension) {
            return Err(ConfigError::ValidationError(format!(
                "index row {bad} has dimension {}, expected {dimension}",
                rows[bad].len()
            )));
        }
        let matrix = rows.iter().flatten().copied().collect();
        Ok(Self {
            matrix,
            dimension,
            count: rows.len(),
        })
    }

    /// Load an index and its `.meta` sidecar.
    pub fn load(path: &Path) -> Result<(Self, IndexMeta), ConfigError> {
        let meta_path = path.with_extension("meta");
        if !path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "vector index".to_string(),
                path: path.to_path_buf(),
            });
        }
        if !meta_path.exists() {
            return Err(ConfigError::MissingArtifact {
                what: "vector index metadata".to_string(),
                path: meta_path,
            });
        }

        let meta_content = std::fs::read_to_string(&meta_path)?;
        let meta = IndexMeta::parse(&meta_content, &meta_path)?;

        // 4 bytes per f32
        let expected_len = meta
            .count
            .checked_mul(meta.dimension)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| ConfigError::CorruptIndex {
                path: meta_path.clone(),
                message: format!(
                    "{} vectors × {} dims does not fit in memory",
                    meta.count, meta.dimension
                ),
            })?;

        let bytes = std::fs::read(path)?;
        if bytes.len() != expected_len {
            return Err(ConfigError::CorruptIndex {
                path: path.to_path_buf(),
                message: format!(
                    "expected {} bytes ({} vectors × {} dims), got {} bytes",
                    expected_len,
                    meta.count,
                    meta.dimension,
                    bytes.len()
                ),
            });
        }

        let matrix: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        tracing::debug!(
            "Loaded flat index {:?}: {} vectors × {} dims",
            path,
            meta.count,
            meta.dimension
        );

        Ok((
            Self {
                matrix,
                dimension: meta.dimension,
                count: meta.count,
            },
            meta,
        ))
    }

    /// Save the index as raw f32 binary plus a `.meta` sidecar.
    pub fn save(&self, path: &Path, records_hash: Option<&str>) -> Result<(), ConfigError> {
        let bytes: Vec<u8> = self.matrix.iter().flat_map(|f| f.to_le_bytes()).collect();
        std::fs::write(path, &bytes)?;

        let meta = IndexMeta {
            dimension: self.dimension,
            count: self.count,
            records_hash: records_hash.map(String::from),
        };
        std::fs::write(path.with_extension("meta"), meta.render())?;
        Ok(())
    }

    fn row(&self, i: usize) -> &[f32] {
        let offset = i * self.dimension;
        &self.matrix[offset..offset + self.dimension]
    }
}

/// Best-first ordering; equal scores fall back to ascending id.
fn best_first(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.score.total_cmp(&a.score).then(a.id.cmp(&b.id))
}

impl VectorIndex for FlatIndex {
    fn len(&self) -> usize {
        self.count
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.count == 0 {
            return Vec::new();
        }
        if query.len() != self.dimension {
            tracing::warn!(
                "Query dimension {} does not match index dimension {}",
                query.len(),
                self.dimension
            );
            return Vec::new();
        }

        let mut hits: Vec<Neighbor> = (0..self.count)
            .map(|id| Neighbor {
                id,
                score: crate::math::dot(query, self.row(id)),
            })
            .collect();

        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, best_first);
            hits.truncate(k);
        }
        hits.sort_by(best_first);
        hits
    }
}
