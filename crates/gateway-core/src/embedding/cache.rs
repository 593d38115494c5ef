//! Embedding cache: the authoritative store of unit-norm embedding vectors
//! for tools and capabilities, with an ANN index for `knn` once the
//! population is large enough to make one worthwhile.
//!
//! Below 32 points `knn` falls back to an exact linear scan (spec §4.A
//! "cold-start exact-scan fallback") since an HNSW graph built over a
//! handful of points gives unreliable recall and the exact scan is cheap
//! at that size anyway.

use std::collections::HashMap;

use super::{cosine_similarity, index::VectorIndexConfig, is_unit_norm, normalize, VectorIndex};
use crate::error::{GatewayError, Result};

/// Below this population, `knn` uses an exact scan instead of the ANN index.
pub const EXACT_SCAN_THRESHOLD: usize = 32;

pub struct EmbeddingCache {
    dimensions: usize,
    vectors: HashMap<String, Vec<f32>>,
    index: VectorIndex,
}

impl EmbeddingCache {
    pub fn new(dimensions: usize) -> Result<Self> {
        Ok(Self {
            dimensions,
            vectors: HashMap::new(),
            index: VectorIndex::new(VectorIndexConfig::new(dimensions))?,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Store `vector` for `id`, L2-normalizing first (I3: every stored
    /// embedding is unit-norm within ±1e-6).
    pub fn upsert(&mut self, id: &str, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        normalize(&mut vector);
        if !is_unit_norm(&vector) {
            return Err(GatewayError::IntegrityViolation(format!(
                "embedding for {id} could not be normalized (zero vector?)"
            )));
        }
        self.index.upsert(id, &vector)?;
        self.vectors.insert(id.to_string(), vector);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.vectors.get(id).map(|v| v.as_slice())
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        self.vectors.remove(id);
        self.index.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }

    /// k-nearest-neighbors to `query` by cosine similarity, descending.
    /// Uses the ANN index once the cache holds at least
    /// [`EXACT_SCAN_THRESHOLD`] vectors, otherwise an exact scan.
    pub fn knn(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(GatewayError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if self.vectors.len() < EXACT_SCAN_THRESHOLD {
            let mut scored: Vec<(String, f32)> = self
                .vectors
                .iter()
                .map(|(id, v)| (id.clone(), cosine_similarity(query, v)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(k);
            return Ok(scored);
        }
        self.index.search(query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(seed: f32, dims: usize) -> Vec<f32> {
        (0..dims).map(|i| (i as f32 + seed).sin()).collect()
    }

    #[test]
    fn upsert_normalizes_to_unit_length() {
        let mut cache = EmbeddingCache::new(8).unwrap();
        cache.upsert("a", raw(1.0, 8)).unwrap();
        let stored = cache.get("a").unwrap();
        let norm = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn knn_exact_scan_below_threshold_returns_self_first() {
        let mut cache = EmbeddingCache::new(8).unwrap();
        for i in 0..5 {
            cache.upsert(&format!("t{i}"), raw(i as f32, 8)).unwrap();
        }
        let query = cache.get("t2").unwrap().to_vec();
        let results = cache.knn(&query, 3).unwrap();
        assert_eq!(results[0].0, "t2");
        assert!((results[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn knn_uses_ann_index_above_threshold() {
        let mut cache = EmbeddingCache::new(8).unwrap();
        for i in 0..40 {
            cache.upsert(&format!("t{i}"), raw(i as f32, 8)).unwrap();
        }
        let query = cache.get("t10").unwrap().to_vec();
        let results = cache.knn(&query, 3).unwrap();
        assert!(!results.is_empty());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut cache = EmbeddingCache::new(8).unwrap();
        let result = cache.upsert("a", vec![1.0, 2.0]);
        assert!(matches!(result, Err(GatewayError::DimensionMismatch { expected: 8, got: 2 })));
    }

    #[test]
    fn remove_drops_from_cache() {
        let mut cache = EmbeddingCache::new(8).unwrap();
        cache.upsert("a", raw(1.0, 8)).unwrap();
        assert!(cache.remove("a").unwrap());
        assert!(!cache.contains("a"));
    }
}
