//! Reciprocal Rank Fusion for combining search result lists

use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid weight configuration: weights must be positive")]
    InvalidWeights,
}

/// Configuration for the fusion algorithm
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    /// Weight for semantic results
    pub semantic_weight: f32,

    /// Weight for keyword results
    pub keyword_weight: f32,
}

impl FusionConfig {
    pub fn new(rrf_k: f32, semantic_weight: f32, keyword_weight: f32) -> Result<Self, FusionError> {
        if semantic_weight <= 0.0 || keyword_weight <= 0.0 {
            return Err(FusionError::InvalidWeights);
        }

        Ok(Self {
            rrf_k,
            semantic_weight,
            keyword_weight,
        })
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            semantic_weight: 1.0,
            keyword_weight: 1.0,
        }
    }
}

/// Apply Reciprocal Rank Fusion to two ranked id lists.
///
/// RRF formula: score(id) = sum over rankings of: weight / (k + rank + 1),
/// rank being the 0-based position in that list. A candidate missing from
/// one list contributes only from the other.
///
/// Returns (id, fused_score) pairs, sorted by score descending.
pub fn reciprocal_rank_fusion(
    semantic_results: &[String],
    keyword_results: &[String],
    config: &FusionConfig,
) -> Vec<(String, f32)> {
    let mut scores: AHashMap<&str, f32> = AHashMap::new();

    for (rank, id) in semantic_results.iter().enumerate() {
        let rrf_score = config.semantic_weight / (config.rrf_k + (rank as f32) + 1.0);
        *scores.entry(id).or_insert(0.0) += rrf_score;
    }

    for (rank, id) in keyword_results.iter().enumerate() {
        let rrf_score = config.keyword_weight / (config.rrf_k + (rank as f32) + 1.0);
        *scores.entry(id).or_insert(0.0) += rrf_score;
    }

    let mut results: Vec<(String, f32)> = scores
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    results
}
