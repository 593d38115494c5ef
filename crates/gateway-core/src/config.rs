//! Engine configuration.
//!
//! A single struct holding every recognized key from spec §6, loaded from
//! environment overrides the way `vestige-core`'s `embeddings/local.rs`
//! reads `FASTEMBED_CACHE_PATH`, falling back to the documented defaults.
//! No external config-file crate is introduced.

use serde::{Deserialize, Serialize};

/// Engine-wide configuration. `Default` matches the defaults named in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Dimension of every embedding the engine stores or accepts.
    pub embedding_dim: usize,

    /// SHGAT attention head count, overridden by trace volume when
    /// `adaptive_heads` is set.
    pub num_heads: usize,
    pub adaptive_heads: bool,
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub mlp_hidden_dim: usize,

    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub l2_lambda: f32,
    pub dropout: f32,
    pub leaky_relu_slope: f32,
    pub depth_decay: f32,
    pub grad_clip_norm: f32,

    pub max_buffer_size: usize,
    pub min_traces_for_training: usize,
    pub per_alpha: f32,
    pub per_beta_start: f32,
    pub per_beta_end: f32,
    pub per_beta_horizon: usize,

    pub pagerank_damping: f64,
    pub pagerank_tolerance: f64,
    pub pagerank_max_iterations: usize,

    pub heat_diffusion_steps: usize,
    pub heat_diffusion_coefficient: f64,

    pub adaptive_alpha_floor: f32,
    pub reliability_penalty_threshold: f32,
    pub reliability_penalty: f32,
    pub reliability_boost_threshold: f32,
    pub reliability_boost: f32,

    pub trace_retention_days: i64,

    /// Edges with observed_count below this are "tentative" and excluded
    /// from structural features (spec §4.B).
    pub edge_tentative_threshold: u32,

    /// Recency half-life used by `recencyScore` (TraceStats #6), in days.
    pub recency_tau_days: f64,

    /// Vector index patch batch size cap (spec §5 "Suspension points").
    pub index_patch_batch_size: usize,

    /// Training's soft wall-clock budget per invocation, in seconds.
    pub training_soft_budget_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 1024,
            num_heads: 8,
            adaptive_heads: true,
            hidden_dim: 128,
            head_dim: 16,
            num_layers: 2,
            mlp_hidden_dim: 64,
            learning_rate: 1e-3,
            batch_size: 32,
            epochs: 1,
            l2_lambda: 1e-4,
            dropout: 0.1,
            leaky_relu_slope: 0.2,
            depth_decay: 0.8,
            grad_clip_norm: 1.0,
            max_buffer_size: 50_000,
            min_traces_for_training: 100,
            per_alpha: 0.6,
            per_beta_start: 0.4,
            per_beta_end: 1.0,
            per_beta_horizon: 100_000,
            pagerank_damping: 0.85,
            pagerank_tolerance: 1e-6,
            pagerank_max_iterations: 100,
            heat_diffusion_steps: 3,
            heat_diffusion_coefficient: 0.5,
            adaptive_alpha_floor: 0.5,
            reliability_penalty_threshold: 0.5,
            reliability_penalty: 0.1,
            reliability_boost_threshold: 0.9,
            reliability_boost: 1.2,
            trace_retention_days: 30,
            edge_tentative_threshold: 3,
            recency_tau_days: 7.0,
            index_patch_batch_size: 256,
            training_soft_budget_secs: 30,
        }
    }
}

impl GatewayConfig {
    /// Load defaults, applying any recognized `GATEWAY_*` environment
    /// overrides. Unset or unparsable variables fall back to the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("GATEWAY_EMBEDDING_DIM") {
            if let Ok(parsed) = v.parse() {
                cfg.embedding_dim = parsed;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_NUM_HEADS") {
            if let Ok(parsed) = v.parse() {
                cfg.num_heads = parsed;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_ADAPTIVE_HEADS") {
            cfg.adaptive_heads = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("GATEWAY_MIN_TRACES_FOR_TRAINING") {
            if let Ok(parsed) = v.parse() {
                cfg.min_traces_for_training = parsed;
            }
        }
        if let Ok(v) = std::env::var("GATEWAY_TRACE_RETENTION_DAYS") {
            if let Ok(parsed) = v.parse() {
                cfg.trace_retention_days = parsed;
            }
        }
        cfg
    }

    /// The per-layer hidden dim used by the scorer scales with K as
    /// `16 * K` per spec §4.E, unless explicitly overridden.
    pub fn hidden_dim_for_heads(&self, k: usize) -> usize {
        16 * k
    }

    /// Adaptive-K tier table from spec §4.E / §9.
    pub fn heads_for_trace_volume(volume: usize) -> usize {
        if volume < 1_000 {
            4
        } else if volume < 10_000 {
            8
        } else if volume < 100_000 {
            12
        } else {
            16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.embedding_dim, 1024);
        assert_eq!(cfg.pagerank_damping, 0.85);
        assert_eq!(cfg.max_buffer_size, 50_000);
        assert_eq!(cfg.adaptive_alpha_floor, 0.5);
    }

    #[test]
    fn heads_for_trace_volume_tiers() {
        assert_eq!(GatewayConfig::heads_for_trace_volume(0), 4);
        assert_eq!(GatewayConfig::heads_for_trace_volume(999), 4);
        assert_eq!(GatewayConfig::heads_for_trace_volume(1_000), 8);
        assert_eq!(GatewayConfig::heads_for_trace_volume(9_999), 8);
        assert_eq!(GatewayConfig::heads_for_trace_volume(10_000), 12);
        assert_eq!(GatewayConfig::heads_for_trace_volume(99_999), 12);
        assert_eq!(GatewayConfig::heads_for_trace_volume(100_000), 16);
    }
}
