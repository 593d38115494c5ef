//! HNSW approximate nearest-neighbor index over tool/capability embeddings
//! (component A), backed by USearch. Grounded on the teacher's
//! `search/vector.rs`: cosine metric, reserve-before-add capacity doubling,
//! a string-key <-> numeric-id mapping, and JSON-sidecar persistence of
//! that mapping alongside the native USearch save format.

use std::collections::HashMap;
use std::path::Path;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::{GatewayError, Result};

/// HNSW connectivity parameter (higher = better recall, more memory).
pub const DEFAULT_CONNECTIVITY: usize = 16;
/// Expansion factor used while adding vectors.
pub const DEFAULT_EXPANSION_ADD: usize = 128;
/// Expansion factor used while searching.
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Index configuration. `dimensions` must match [`crate::config::GatewayConfig::embedding_dim`].
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub dimensions: usize,
    pub connectivity: usize,
    pub expansion_add: usize,
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

fn index_options(config: &VectorIndexConfig) -> IndexOptions {
    IndexOptions {
        dimensions: config.dimensions,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F32,
        connectivity: config.connectivity,
        expansion_add: config.expansion_add,
        expansion_search: config.expansion_search,
        multi: false,
    }
}

/// A USearch HNSW index keyed by tool/capability id.
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Result<Self> {
        let index = Index::new(&index_options(&config))
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch index creation failed: {e}")))?;
        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch reserve failed: {e}")))
    }

    /// Insert or replace the vector for `key`. Bounded batch callers (the
    /// graph sync controller's patch application, spec §5 "Suspension
    /// points") should cap the number of `upsert` calls per tick at
    /// [`crate::config::GatewayConfig::index_patch_batch_size`].
    pub fn upsert(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(GatewayError::DimensionMismatch {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }

        if let Some(&existing_id) = self.key_to_id.get(key) {
            self.index
                .remove(existing_id)
                .map_err(|e| GatewayError::StorageUnavailable(format!("usearch remove failed: {e}")))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing_id, vector)
                .map_err(|e| GatewayError::StorageUnavailable(format!("usearch add failed: {e}")))?;
            return Ok(());
        }

        let current_capacity = self.index.capacity();
        let current_size = self.index.size();
        if current_size >= current_capacity {
            let new_capacity = std::cmp::max(current_capacity * 2, 16);
            self.reserve(new_capacity)?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch add failed: {e}")))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<bool> {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            self.index
                .remove(id)
                .map_err(|e| GatewayError::StorageUnavailable(format!("usearch remove failed: {e}")))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// Approximate k-nearest-neighbors by cosine similarity, returned as
    /// `(key, similarity)` pairs sorted descending.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.config.dimensions {
            return Err(GatewayError::DimensionMismatch {
                expected: self.config.dimensions,
                got: query.len(),
            });
        }
        if self.is_empty() {
            return Ok(Vec::new());
        }
        let results = self
            .index
            .search(query, limit)
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch search failed: {e}")))?;

        let mut out = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(string_key) = self.id_to_key.get(key) {
                out.push((string_key.clone(), 1.0 - distance));
            }
        }
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| GatewayError::StorageUnavailable("non-utf8 index path".into()))?;
        self.index
            .save(path_str)
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch save failed: {e}")))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings = serde_json::json!({
            "key_to_id": self.key_to_id,
            "next_id": self.next_id,
        });
        let mappings_str = serde_json::to_string(&mappings)
            .map_err(|e| GatewayError::StorageUnavailable(e.to_string()))?;
        std::fs::write(&mappings_path, mappings_str)?;
        Ok(())
    }

    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| GatewayError::StorageUnavailable("non-utf8 index path".into()))?;
        let index = Index::new(&index_options(&config))
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch index creation failed: {e}")))?;
        index
            .load(path_str)
            .map_err(|e| GatewayError::StorageUnavailable(format!("usearch load failed: {e}")))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings_str = std::fs::read_to_string(&mappings_path)?;
        let mappings: serde_json::Value =
            serde_json::from_str(&mappings_str).map_err(|e| GatewayError::StorageUnavailable(e.to_string()))?;
        let key_to_id: HashMap<String, u64> = serde_json::from_value(mappings["key_to_id"].clone())
            .map_err(|e| GatewayError::StorageUnavailable(e.to_string()))?;
        let next_id = mappings["next_id"]
            .as_u64()
            .ok_or_else(|| GatewayError::StorageUnavailable("missing next_id".into()))?;
        let id_to_key = key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();

        Ok(Self {
            index,
            config,
            key_to_id,
            id_to_key,
            next_id,
        })
    }
}
