//! Similarity index over chunk embeddings
//!
//! Small collections are scanned exactly; once a collection reaches the
//! configured threshold an HNSW graph is built instead. The cutoff exists
//! because approximate indexes train badly on tiny corpora, where an exact
//! scan is cheap anyway.
//!
//! Embeddings are assumed L2-normalized, so cosine similarity is a dot
//! product on the exact path and `1 - distance` on the HNSW path.

use hnsw_rs::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },
}

/// HNSW build/search parameters.
#[derive(Debug, Clone)]
pub struct AnnParams {
    /// Minimum collection size before an approximate index is built
    pub threshold: usize,
    /// HNSW construction parameter (higher = better recall, slower build)
    pub ef_construction: usize,
    /// HNSW M parameter (number of connections per layer)
    pub m: usize,
    /// HNSW search parameter (higher = better recall, slower search)
    pub ef_search: usize,
}

impl Default for AnnParams {
    fn default() -> Self {
        Self {
            threshold: 256,
            ef_construction: 200,
            m: 16,
            ef_search: 50,
        }
    }
}

enum IndexKind {
    Approximate {
        index: Hnsw<'static, f32, DistCosine>,
        ids: Vec<String>,
    },
    Exact {
        items: Vec<(String, Vec<f32>)>,
    },
}

/// In-memory similarity index for one collection, rebuilt from the stored
/// chunks after every `replace_all`.
pub struct VectorIndex {
    dimension: usize,
    kind: IndexKind,
    ef_search: usize,
}

impl VectorIndex {
    /// Build an index from (id, embedding) pairs. Items with empty
    /// embeddings are skipped.
    pub fn build(dimension: usize, items: Vec<(String, Vec<f32>)>, params: &AnnParams) -> Self {
        let items: Vec<(String, Vec<f32>)> = items
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .collect();

        let kind = if items.len() >= params.threshold {
            let index = Hnsw::<f32, DistCosine>::new(
                params.m,
                dimension,
                params.ef_construction,
                200, // max_nb_connection
                DistCosine,
            );
            let mut ids = Vec::with_capacity(items.len());
            for (ordinal, (id, vector)) in items.iter().enumerate() {
                index.insert((vector, ordinal));
                ids.push(id.clone());
            }
            IndexKind::Approximate { index, ids }
        } else {
            IndexKind::Exact { items }
        };

        Self {
            dimension,
            kind,
            ef_search: params.ef_search,
        }
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self.kind, IndexKind::Approximate { .. })
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            IndexKind::Approximate { ids, .. } => ids.len(),
            IndexKind::Exact { items } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k nearest ids by cosine similarity, sorted by score descending.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let results = match &self.kind {
            IndexKind::Approximate { index, ids } => index
                .search(query, k, self.ef_search)
                .into_iter()
                .map(|neighbour| (ids[neighbour.d_id].clone(), 1.0 - neighbour.distance))
                .collect(),
            IndexKind::Exact { items } => exact_top_k(query, items, k),
        };

        Ok(results)
    }
}

/// Exact cosine scan over pre-normalized vectors.
pub fn exact_top_k(
    query: &[f32],
    items: &[(String, Vec<f32>)],
    k: usize,
) -> Vec<(String, f32)> {
    let mut scored: Vec<(String, f32)> = items
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(id, vector)| (id.clone(), dot(query, vector)))
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    scored
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
