//! The SHGAT forward pass (component E): K-head attention message passing
//! between tools (vertices) and capabilities (hyperedges), fused with the
//! 17-scalar TraceStats into a single candidate score.

use std::collections::HashMap;

use crate::config::GatewayConfig;
use crate::embedding::cosine_similarity;
use crate::error::{GatewayError, Result};
use crate::graph::{GraphSnapshot, NodeKind};
use crate::trace::TraceStats;

use super::params::{HeadParams, LayerParams, ScorerParams};

/// Lifecycle state of the scorer (spec §4.E "States").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerState {
    Uninitialized,
    /// Below `minTracesForTraining`: untrained, deterministic weights.
    Cold,
    Trained,
    /// Mutually exclusive with serving a score from these parameters.
    Training,
    /// A graph mutation invalidated cached embeddings; requires a refresh
    /// before the next score.
    Stale,
}

/// Per-head attention output plus the final fused score.
#[derive(Debug, Clone)]
pub struct ScoreOutput {
    pub score: f32,
    /// Length K; inactive heads (ablation mask) are exactly 0.
    pub head_weights: Vec<f32>,
}

/// Scorer configuration: which heads are active (spec §4.E ablation mask),
/// dimensions, and the hyperparameters named in spec §4.E's training
/// protocol that also affect the forward pass (dropout, leaky-relu slope,
/// depth decay).
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub num_heads: usize,
    pub hidden_dim: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub mlp_hidden_dim: usize,
    pub active_heads: Vec<bool>,
    pub dropout: f32,
    pub leaky_relu_slope: f32,
    pub depth_decay: f32,
}

impl ScorerConfig {
    pub fn from_gateway_config(cfg: &GatewayConfig, num_heads: usize) -> Self {
        let hidden_dim = cfg.hidden_dim_for_heads(num_heads);
        Self {
            num_heads,
            hidden_dim,
            head_dim: hidden_dim / num_heads.max(1),
            num_layers: cfg.num_layers,
            mlp_hidden_dim: cfg.mlp_hidden_dim,
            active_heads: vec![true; num_heads],
            dropout: cfg.dropout,
            leaky_relu_slope: cfg.leaky_relu_slope,
            depth_decay: cfg.depth_decay,
        }
    }

    /// Builder for ablation studies (end-to-end scenario 4).
    pub fn with_active_heads(mut self, active: Vec<bool>) -> Self {
        assert_eq!(active.len(), self.num_heads, "active-heads mask must cover every head");
        self.active_heads = active;
        self
    }
}

fn matvec(matrix: &[Vec<f32>], x: &[f32]) -> Vec<f32> {
    matrix.iter().map(|row| row.iter().zip(x.iter()).map(|(w, v)| w * v).sum()).collect()
}

fn leaky_relu(x: f32, slope: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        slope * x
    }
}

fn softmax(scores: &mut [f32]) {
    if scores.is_empty() {
        return;
    }
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

/// One attention head's weighted aggregation of `members` relative to `query_src`.
fn head_attend(head: &HeadParams, query_src: &[f32], members: &[&Vec<f32>], slope: f32) -> Vec<f32> {
    let head_dim = head.wq.len();
    if members.is_empty() {
        return vec![0.0; head_dim];
    }
    let query = matvec(&head.wq, query_src);
    let mut scores = Vec::with_capacity(members.len());
    let mut values = Vec::with_capacity(members.len());
    for member in members {
        let key = matvec(&head.wk, member);
        let value = matvec(&head.wv, member);
        let concat: Vec<f32> = query.iter().chain(key.iter()).cloned().collect();
        let e = leaky_relu(concat.iter().zip(head.a.iter()).map(|(c, a)| c * a).sum(), slope);
        scores.push(e);
        values.push(value);
    }
    softmax(&mut scores);
    let mut out = vec![0.0; head_dim];
    for (alpha, value) in scores.iter().zip(values.iter()) {
        for (o, v) in out.iter_mut().zip(value.iter()) {
            *o += alpha * v;
        }
    }
    out
}

fn multi_head_attend(heads: &[HeadParams], query_src: &[f32], members: &[&Vec<f32>], wo: &[Vec<f32>], slope: f32) -> Vec<f32> {
    let mut concat = Vec::with_capacity(heads.iter().map(|h| h.wq.len()).sum());
    for head in heads {
        concat.extend(head_attend(head, query_src, members, slope));
    }
    matvec(wo, &concat)
}

/// A forward pass over the whole snapshot, producing final (depth-decayed,
/// layer-accumulated) hidden states for every tool and capability.
struct ForwardPass {
    tool_states: HashMap<String, Vec<f32>>,
    capability_states: HashMap<String, Vec<f32>>,
}

fn run_forward_pass(params: &ScorerParams, config: &ScorerConfig, snapshot: &GraphSnapshot) -> ForwardPass {
    let zero = vec![0.0_f32; params.hidden_dim];
    let mut h_v: HashMap<String, Vec<f32>> = snapshot
        .tools
        .values()
        .map(|t| {
            let h = t.embedding.as_ref().map_or_else(|| zero.clone(), |e| matvec(&params.w_in, e));
            (t.id.clone(), h)
        })
        .collect();
    let mut h_e: HashMap<String, Vec<f32>> = snapshot
        .capabilities
        .values()
        .map(|c| {
            let h = c.embedding.as_ref().map_or_else(|| zero.clone(), |e| matvec(&params.w_in, e));
            (c.id.clone(), h)
        })
        .collect();

    let mut acc_v: HashMap<String, Vec<f32>> = h_v.clone();
    let mut acc_e: HashMap<String, Vec<f32>> = h_e.clone();

    for (l, layer) in params.layers.iter().enumerate().take(config.num_layers) {
        let decay = config.depth_decay.powi(l as i32 + 1);

        // V -> E: each hyperedge attends over its tool/capability members.
        let mut new_h_e: HashMap<String, Vec<f32>> = HashMap::with_capacity(h_e.len());
        for cap in snapshot.capabilities.values() {
            let members: Vec<&Vec<f32>> = cap
                .members
                .iter()
                .filter_map(|m| h_v.get(m).or_else(|| h_e.get(m)))
                .collect();
            let query_src = h_e.get(&cap.id).unwrap_or(&zero);
            let out = multi_head_attend(&layer.v_to_e, query_src, &members, &layer.wo_ve, config.leaky_relu_slope);
            for (acc, v) in acc_e.entry(cap.id.clone()).or_insert_with(|| zero.clone()).iter_mut().zip(out.iter()) {
                *acc += decay * v;
            }
            new_h_e.insert(cap.id.clone(), out);
        }

        // E -> V: each tool attends over capabilities that contain it.
        let mut new_h_v: HashMap<String, Vec<f32>> = HashMap::with_capacity(h_v.len());
        for tool in snapshot.tools.values() {
            let containers = snapshot.hyperedges_containing(&tool.id);
            if containers.is_empty() {
                new_h_v.insert(tool.id.clone(), h_v.get(&tool.id).cloned().unwrap_or_else(|| zero.clone()));
                continue;
            }
            let members: Vec<&Vec<f32>> = containers
                .iter()
                .filter_map(|c| new_h_e.get(&c.id))
                .collect();
            let query_src = h_v.get(&tool.id).unwrap_or(&zero);
            let out = multi_head_attend(&layer.e_to_v, query_src, &members, &layer.wo_ev, config.leaky_relu_slope);
            for (acc, v) in acc_v.entry(tool.id.clone()).or_insert_with(|| zero.clone()).iter_mut().zip(out.iter()) {
                *acc += decay * v;
            }
            new_h_v.insert(tool.id.clone(), out);
        }

        h_v = new_h_v;
        h_e = new_h_e;
    }

    ForwardPass { tool_states: acc_v, capability_states: acc_e }
}

/// Per-head cosine score between an intent and a candidate's final hidden
/// state, masked by the active-heads ablation config.
fn head_scores(config: &ScorerConfig, intent_hidden: &[f32], candidate_hidden: &[f32]) -> Vec<f32> {
    (0..config.num_heads)
        .map(|k| {
            if !config.active_heads[k] {
                return 0.0;
            }
            let start = k * config.head_dim;
            let end = start + config.head_dim;
            cosine_similarity(&intent_hidden[start..end], &candidate_hidden[start..end])
        })
        .collect()
}

fn fusion_forward(params: &ScorerParams, input: &[f32], slope: f32) -> f32 {
    let hidden: Vec<f32> = params
        .fusion
        .w1
        .iter()
        .zip(params.fusion.b1.iter())
        .map(|(row, b)| leaky_relu(row.iter().zip(input.iter()).map(|(w, v)| w * v).sum::<f32>() + b, slope))
        .collect();
    let logit: f32 = params.fusion.w2.iter().zip(hidden.iter()).map(|(w, h)| w * h).sum::<f32>() + params.fusion.b2;
    1.0 / (1.0 + (-logit).exp())
}

/// The SHGAT scorer: holds the current parameter set, its lifecycle state,
/// and the forward-pass/fusion logic described above.
pub struct ShgatScorer {
    config: ScorerConfig,
    params: ScorerParams,
    state: ScorerState,
}

impl ShgatScorer {
    pub fn new(embedding_dim: usize, config: ScorerConfig, seed: u64) -> Self {
        let params = ScorerParams::initialize(
            embedding_dim,
            config.num_heads,
            config.hidden_dim,
            config.num_layers,
            config.mlp_hidden_dim,
            seed,
        );
        Self { config, params, state: ScorerState::Cold }
    }

    pub fn state(&self) -> ScorerState {
        self.state
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn params(&self) -> &ScorerParams {
        &self.params
    }

    /// Mutable access to the live parameters, for the trainer's in-place
    /// gradient updates (spec §4.F "Training holds an exclusive lock on
    /// SHGAT parameters").
    pub fn params_mut(&mut self) -> &mut ScorerParams {
        &mut self.params
    }

    /// Swap in freshly trained parameters, double-buffered: the old
    /// parameters remain valid for any in-flight scoring call since
    /// `score` takes `&self` and clones nothing until this returns.
    pub fn install_params(&mut self, params: ScorerParams) {
        self.params = params;
        self.state = ScorerState::Trained;
    }

    pub fn mark_training(&mut self) {
        self.state = ScorerState::Training;
    }

    /// Restore a state observed before a training attempt that ended up
    /// installing nothing (empty batch, or divergence on the very first
    /// batch) — leaves the scorer exactly as a caller would have found it.
    pub(crate) fn restore_state(&mut self, state: ScorerState) {
        self.state = state;
    }

    /// A graph mutation invalidated cached structural embeddings.
    pub fn mark_stale(&mut self) {
        if self.state != ScorerState::Uninitialized {
            self.state = ScorerState::Stale;
        }
    }

    /// After a cache refresh following a `stale` mark (spec §4.E transitions).
    pub fn mark_refreshed(&mut self) {
        if self.state == ScorerState::Stale {
            self.state = ScorerState::Trained;
        }
    }

    /// Run the message-passing layers and return the per-head cosine scores
    /// between `intent_embedding` and `candidate_id`'s final hidden state.
    /// Shared by [`Self::score`] and the trainer, which needs the raw head
    /// scores as the fusion MLP's input before it can backpropagate through
    /// just that MLP.
    pub fn raw_head_scores(
        &self,
        snapshot: &GraphSnapshot,
        intent_embedding: &[f32],
        candidate_id: &str,
        kind: NodeKind,
    ) -> Result<Vec<f32>> {
        if intent_embedding.len() != self.params.embedding_dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.params.embedding_dim,
                got: intent_embedding.len(),
            });
        }
        if snapshot.node_kind(candidate_id).is_none() {
            return Err(GatewayError::UnknownId(candidate_id.to_string()));
        }

        let pass = run_forward_pass(&self.params, &self.config, snapshot);
        let candidate_hidden = match kind {
            NodeKind::Tool => pass.tool_states.get(candidate_id),
            NodeKind::Capability => pass.capability_states.get(candidate_id),
        }
        .ok_or_else(|| GatewayError::UnknownId(candidate_id.to_string()))?;

        let intent_hidden = matvec(&self.params.w_in, intent_embedding);
        Ok(head_scores(&self.config, &intent_hidden, candidate_hidden))
    }

    /// Score a candidate (tool or capability) for an intent.
    pub fn score(
        &self,
        snapshot: &GraphSnapshot,
        intent_embedding: &[f32],
        candidate_id: &str,
        kind: NodeKind,
        trace_stats: &TraceStats,
    ) -> Result<ScoreOutput> {
        let heads = self.raw_head_scores(snapshot, intent_embedding, candidate_id, kind)?;

        let active_count = self.config.active_heads.iter().filter(|a| **a).count().max(1);
        let score = match self.state {
            ScorerState::Cold | ScorerState::Uninitialized => heads.iter().sum::<f32>() / active_count as f32,
            _ => {
                let mut input = heads.clone();
                input.extend(trace_stats.to_vec());
                fusion_forward(&self.params, &input, self.config.leaky_relu_slope)
            }
        };

        Ok(ScoreOutput { score: score.clamp(0.0, 1.0), head_weights: heads })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::graph::{CapabilityContent, EdgeSource, EdgeType, GraphStore};

    fn small_config() -> (GatewayConfig, ScorerConfig) {
        let mut cfg = GatewayConfig::default();
        cfg.embedding_dim = 8;
        cfg.num_heads = 4;
        cfg.hidden_dim = 16;
        cfg.num_layers = 2;
        cfg.mlp_hidden_dim = 8;
        let scorer_cfg = ScorerConfig::from_gateway_config(&cfg, 4);
        (cfg, scorer_cfg)
    }

    fn unit(seed: f32, dims: usize) -> Vec<f32> {
        let raw: Vec<f32> = (0..dims).map(|i| (i as f32 + seed).sin()).collect();
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-9);
        raw.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn cold_scorer_uses_mean_of_active_heads() {
        let (cfg, scorer_cfg) = small_config();
        let scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);
        assert_eq!(scorer.state(), ScorerState::Cold);

        let store = GraphStore::new(cfg.embedding_dim);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 8)).unwrap();
        let snap = store.snapshot();

        let out = scorer
            .score(&snap, &unit(1.0, 8), "fs:read", NodeKind::Tool, &TraceStats::default())
            .unwrap();
        assert!(out.score >= -1.0 && out.score <= 1.0);
        assert_eq!(out.head_weights.len(), 4);
    }

    #[test]
    fn inactive_heads_contribute_exactly_zero() {
        let (cfg, scorer_cfg) = small_config();
        let scorer_cfg = scorer_cfg.with_active_heads(vec![true, true, false, false]);
        let scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);

        let store = GraphStore::new(cfg.embedding_dim);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 8)).unwrap();
        let snap = store.snapshot();

        let out = scorer
            .score(&snap, &unit(1.0, 8), "fs:read", NodeKind::Tool, &TraceStats::default())
            .unwrap();
        assert_eq!(out.head_weights[2], 0.0);
        assert_eq!(out.head_weights[3], 0.0);
    }

    #[test]
    fn unknown_candidate_rejected() {
        let (cfg, scorer_cfg) = small_config();
        let scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);
        let store = GraphStore::new(cfg.embedding_dim);
        let snap = store.snapshot();
        let result = scorer.score(&snap, &unit(1.0, 8), "missing", NodeKind::Tool, &TraceStats::default());
        assert!(matches!(result, Err(GatewayError::UnknownId(_))));
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let (cfg, scorer_cfg) = small_config();
        let scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);
        let store = GraphStore::new(cfg.embedding_dim);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 8)).unwrap();
        let snap = store.snapshot();
        let result = scorer.score(&snap, &[0.1, 0.2], "fs:read", NodeKind::Tool, &TraceStats::default());
        assert!(matches!(result, Err(GatewayError::DimensionMismatch { .. })));
    }

    #[test]
    fn capability_scoring_aggregates_over_members() {
        let (cfg, scorer_cfg) = small_config();
        let scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);
        let store = GraphStore::new(cfg.embedding_dim);
        store.add_or_get_tool("fs:read", "read a file");
        store.add_or_get_tool("fs:write", "write a file");
        store.set_tool_embedding("fs:read", unit(1.0, 8)).unwrap();
        store.set_tool_embedding("fs:write", unit(2.0, 8)).unwrap();
        store
            .observe_edge("fs:read", "fs:write", EdgeSource::Learned, EdgeType::Sequence)
            .unwrap();
        let content = CapabilityContent::Sandboxed("edit".into());
        store
            .add_or_get_capability("org.p.ns.edit.aaaa", "edit a file", vec!["fs:read".into(), "fs:write".into()], &content)
            .unwrap();
        store.set_capability_embedding("org.p.ns.edit.aaaa", unit(3.0, 8)).unwrap();
        let snap = store.snapshot();

        let out = scorer
            .score(&snap, &unit(3.0, 8), "org.p.ns.edit.aaaa", NodeKind::Capability, &TraceStats::default())
            .unwrap();
        assert_eq!(out.head_weights.len(), 4);
    }

    #[test]
    fn determinism_same_seed_same_score() {
        let (cfg, scorer_cfg) = small_config();
        let scorer_a = ShgatScorer::new(cfg.embedding_dim, scorer_cfg.clone(), 99);
        let scorer_b = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 99);

        let store = GraphStore::new(cfg.embedding_dim);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 8)).unwrap();
        let snap = store.snapshot();

        let out_a = scorer_a.score(&snap, &unit(1.0, 8), "fs:read", NodeKind::Tool, &TraceStats::default()).unwrap();
        let out_b = scorer_b.score(&snap, &unit(1.0, 8), "fs:read", NodeKind::Tool, &TraceStats::default()).unwrap();
        assert_eq!(out_a.score, out_b.score);
        assert_eq!(out_a.head_weights, out_b.head_weights);
    }

    #[test]
    fn mark_stale_then_refreshed_transitions() {
        let (cfg, scorer_cfg) = small_config();
        let mut scorer = ShgatScorer::new(cfg.embedding_dim, scorer_cfg, 1);
        scorer.install_params(scorer.params().clone());
        assert_eq!(scorer.state(), ScorerState::Trained);
        scorer.mark_stale();
        assert_eq!(scorer.state(), ScorerState::Stale);
        scorer.mark_refreshed();
        assert_eq!(scorer.state(), ScorerState::Trained);
    }
}
