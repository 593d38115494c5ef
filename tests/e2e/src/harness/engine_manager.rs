//! Isolated [`Engine`] instances for tests: in-memory by default, with an
//! optional temp-file-backed persisted mirror for reload scenarios.
//!
//! Automatically cleaned up when dropped (the temp directory, if any, is
//! held alive only as long as the manager).

use std::path::PathBuf;

use gateway_core::{Engine, GatewayConfig};
use tempfile::TempDir;

/// A `GatewayConfig` scaled down to dimensions cheap enough to exercise in
/// a test process (the defaults target production-scale 1024-dim
/// embeddings and K up to 16 heads).
pub fn small_config(embedding_dim: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.embedding_dim = embedding_dim;
    config.adaptive_heads = false;
    config.num_heads = 4;
    config.hidden_dim = 16;
    config.num_layers = 2;
    config.mlp_hidden_dim = 8;
    config.min_traces_for_training = 20;
    config.max_buffer_size = 512;
    config.training_soft_budget_secs = 5;
    config
}

pub struct TestEngineManager {
    pub engine: Engine,
    _temp_dir: Option<TempDir>,
}

impl TestEngineManager {
    /// A fresh in-memory engine at `embedding_dim` with a fixed seed.
    pub fn new(embedding_dim: usize) -> Self {
        Self::with_config(small_config(embedding_dim))
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self::with_config_and_seed(config, 7)
    }

    pub fn with_config_and_seed(config: GatewayConfig, seed: u64) -> Self {
        let engine = Engine::with_seed(config, seed).expect("engine construction is infallible for valid config");
        Self { engine, _temp_dir: None }
    }

    /// An engine backed by a temp-file SQLite mirror, for reload-on-restart
    /// scenarios. The temp directory is removed when the manager drops.
    pub fn persisted(config: GatewayConfig) -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let db_path = temp_dir.path().join("gateway-test.db");
        let engine = Engine::with_persistence(config, Some(db_path)).expect("failed to open persisted engine");
        Self { engine, _temp_dir: Some(temp_dir) }
    }

    /// Reopen a persisted engine at the same path, simulating a restart.
    /// Only valid on a manager built with [`Self::persisted`].
    pub fn reopen(self, config: GatewayConfig) -> Self {
        let temp_dir = self._temp_dir.expect("reopen requires a persisted manager");
        let db_path: PathBuf = temp_dir.path().join("gateway-test.db");
        let engine = Engine::with_persistence(config, Some(db_path)).expect("failed to reopen persisted engine");
        Self { engine, _temp_dir: Some(temp_dir) }
    }
}
