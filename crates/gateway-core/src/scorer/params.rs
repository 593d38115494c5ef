//! SHGAT parameter storage: per-layer attention head weights and the fusion
//! MLP, deterministically seed-initialized, persisted as a versioned blob
//! keyed by architecture hash (spec §3 "SHGAT Parameters", §4.F "Persistence").

use std::io::Write;
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

fn random_matrix(rng: &mut ChaCha8Rng, rows: usize, cols: usize, scale: f32) -> Vec<Vec<f32>> {
    (0..rows)
        .map(|_| (0..cols).map(|_| rng.random_range(-scale..scale)).collect())
        .collect()
}

fn random_vector(rng: &mut ChaCha8Rng, len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-scale..scale)).collect()
}

/// One attention head's query/key/value projections and attention vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadParams {
    pub wq: Vec<Vec<f32>>,
    pub wk: Vec<Vec<f32>>,
    pub wv: Vec<Vec<f32>>,
    /// Length `2 * headDim`, split as `[query half | key half]`.
    pub a: Vec<f32>,
}

impl HeadParams {
    fn init(rng: &mut ChaCha8Rng, head_dim: usize, hidden_dim: usize) -> Self {
        let scale = (1.0 / hidden_dim as f32).sqrt();
        Self {
            wq: random_matrix(rng, head_dim, hidden_dim, scale),
            wk: random_matrix(rng, head_dim, hidden_dim, scale),
            wv: random_matrix(rng, head_dim, hidden_dim, scale),
            a: random_vector(rng, 2 * head_dim, scale),
        }
    }
}

/// One message-passing layer: K attention heads for the V→E step, K for
/// the E→V step, and the output projections that follow each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerParams {
    pub v_to_e: Vec<HeadParams>,
    pub e_to_v: Vec<HeadParams>,
    pub wo_ve: Vec<Vec<f32>>,
    pub wo_ev: Vec<Vec<f32>>,
}

impl LayerParams {
    fn init(rng: &mut ChaCha8Rng, num_heads: usize, head_dim: usize, hidden_dim: usize) -> Self {
        let scale = (1.0 / hidden_dim as f32).sqrt();
        Self {
            v_to_e: (0..num_heads).map(|_| HeadParams::init(rng, head_dim, hidden_dim)).collect(),
            e_to_v: (0..num_heads).map(|_| HeadParams::init(rng, head_dim, hidden_dim)).collect(),
            wo_ve: random_matrix(rng, hidden_dim, hidden_dim, scale),
            wo_ev: random_matrix(rng, hidden_dim, hidden_dim, scale),
        }
    }
}

/// The fusion MLP: `[K head scores ++ 17 TraceStats] -> hidden -> sigmoid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionParams {
    pub w1: Vec<Vec<f32>>,
    pub b1: Vec<f32>,
    pub w2: Vec<f32>,
    pub b2: f32,
}

impl FusionParams {
    fn init(rng: &mut ChaCha8Rng, input_dim: usize, mlp_hidden_dim: usize) -> Self {
        let scale = (1.0 / input_dim as f32).sqrt();
        Self {
            w1: random_matrix(rng, mlp_hidden_dim, input_dim, scale),
            b1: vec![0.0; mlp_hidden_dim],
            w2: random_vector(rng, mlp_hidden_dim, scale),
            b2: 0.0,
        }
    }
}

/// Full parameter set for one architecture (spec §3: "persist as a
/// versioned blob keyed by (embeddingDim, K, hiddenDim, layers)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerParams {
    pub embedding_dim: usize,
    pub num_heads: usize,
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub mlp_hidden_dim: usize,
    pub w_in: Vec<Vec<f32>>,
    pub layers: Vec<LayerParams>,
    pub fusion: FusionParams,
}

impl ScorerParams {
    /// Deterministically initialize from a fixed seed (spec §4.E "Cold-start
    /// behavior": "an untrained but deterministically-initialized network").
    pub fn initialize(
        embedding_dim: usize,
        num_heads: usize,
        hidden_dim: usize,
        num_layers: usize,
        mlp_hidden_dim: usize,
        seed: u64,
    ) -> Self {
        let head_dim = hidden_dim / num_heads.max(1);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let scale = (1.0 / embedding_dim as f32).sqrt();
        let w_in = random_matrix(&mut rng, hidden_dim, embedding_dim, scale);
        let layers = (0..num_layers)
            .map(|_| LayerParams::init(&mut rng, num_heads, head_dim, hidden_dim))
            .collect();
        let fusion = FusionParams::init(&mut rng, num_heads + 17, mlp_hidden_dim);
        Self {
            embedding_dim,
            num_heads,
            hidden_dim,
            head_dim,
            num_layers,
            mlp_hidden_dim,
            w_in,
            layers,
            fusion,
        }
    }

    /// `(embeddingDim, K, hiddenDim, layers)`, the cache key a parameter
    /// blob is addressed by.
    pub fn architecture_key(&self) -> (usize, usize, usize, usize) {
        (self.embedding_dim, self.num_heads, self.hidden_dim, self.num_layers)
    }

    pub fn matches_architecture(&self, embedding_dim: usize, num_heads: usize, hidden_dim: usize, num_layers: usize) -> bool {
        self.architecture_key() == (embedding_dim, num_heads, hidden_dim, num_layers)
    }

    /// Atomic save: write to a sibling temp file, then rename over the
    /// destination, so a concurrent reader never observes a partial write
    /// (spec §5 "Parameter writes are atomic").
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self).map_err(|e| GatewayError::StorageUnavailable(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Best-effort load: a shape mismatch against the requested architecture
    /// is treated as absent, not an error (spec §4.F "Load at startup is
    /// best-effort").
    pub fn load_from(
        path: &Path,
        embedding_dim: usize,
        num_heads: usize,
        hidden_dim: usize,
        num_layers: usize,
    ) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        let params: Self = serde_json::from_slice(&bytes).ok()?;
        if params.matches_architecture(embedding_dim, num_heads, hidden_dim, num_layers) {
            Some(params)
        } else {
            None
        }
    }
}
