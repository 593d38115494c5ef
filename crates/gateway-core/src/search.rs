//! Component G: Unified Search (spec §4.G).
//!
//! Produces the candidate pool and `unified_score`, the value [`crate::Engine::rank`]
//! sorts by (spec §4.G steps 4-5; P4 bounds it to `[0, 0.95]`). The SHGAT
//! (component E) score is computed alongside and reported as interpretability
//! metadata (`head_weights`/`learned_score`) rather than substituted into the
//! sort key — see `DESIGN.md` for why. Kept separate from `Engine` so the
//! adaptive-alpha/reliability-band math can be unit tested against bare
//! [`GraphSnapshot`] fixtures without a full engine.

use std::collections::HashSet;

use tracing::warn;

use crate::config::GatewayConfig;
use crate::embedding::EmbeddingCache;
use crate::error::{GatewayError, Result};
use crate::graph::algorithms::heat_diffusion;
use crate::graph::{GraphSnapshot, NodeKind};

/// Candidate-set restriction (spec §4.G "optional filter").
#[derive(Debug, Clone, Default)]
pub enum CandidateFilter {
    #[default]
    Both,
    ToolsOnly,
    CapabilitiesOnly,
    /// An explicit allow-list of ids. Unknown ids are skipped with a warning,
    /// not an error (spec §4.G "Failures").
    Ids(Vec<String>),
}

/// Inputs to [`candidates`], mirroring spec §4.G minus the intent embedding
/// itself (passed separately since the caller may need it for SHGAT too).
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub filter: CandidateFilter,
    /// Seed nodes whose 1-hop neighborhood supplements the semantic kNN
    /// candidate set, per spec §4.G step 2.
    pub context_ids: Vec<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { filter: CandidateFilter::Both, context_ids: Vec::new() }
    }
}

/// One candidate's non-learned score components, before SHGAT re-scoring.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub kind: NodeKind,
    pub semantic: f32,
    pub graph: f32,
    pub reliability: f32,
    /// `(alpha*semantic + (1-alpha)*graph) * reliability`, clamped to 0.95
    /// (spec §4.G steps 4-5). This is the value [`crate::Engine::rank`]
    /// sorts candidates by.
    pub unified_score: f32,
}

const K_SEM: usize = 50;
const K_GRAPH: usize = 100;
const SCORE_CAP: f32 = 0.95;

/// Adaptive alpha: weight on the semantic term versus the graph term,
/// tightening toward 0.5 as the graph densifies (spec §4.G step 4).
fn adaptive_alpha(config: &GatewayConfig, snapshot: &GraphSnapshot) -> f32 {
    let density = snapshot.density(config.edge_tentative_threshold) as f32;
    (1.0 - density * 2.0).clamp(config.adaptive_alpha_floor, 1.0)
}

/// `f(successRate)`: a band function, not a continuous one (spec §4.G
/// "Reliability bands").
fn reliability_band(config: &GatewayConfig, success_rate: f32) -> f32 {
    if success_rate <= config.reliability_penalty_threshold {
        config.reliability_penalty
    } else if success_rate >= config.reliability_boost_threshold {
        config.reliability_boost
    } else {
        1.0
    }
}

fn success_rate_of(snapshot: &GraphSnapshot, id: &str) -> f32 {
    if let Some(t) = snapshot.tools.get(id) {
        t.success_rate()
    } else if let Some(c) = snapshot.capabilities.get(id) {
        c.success_rate()
    } else {
        0.5
    }
}

/// `reliability = f(successRate) * transitiveReliability`, where
/// `transitiveReliability` for a capability is the minimum of its direct
/// children's own `f(successRate)` bands (spec §4.G "Reliability bands");
/// for a tool (no children) `transitiveReliability` is 1.
fn reliability_of(config: &GatewayConfig, snapshot: &GraphSnapshot, id: &str) -> f32 {
    let own = reliability_band(config, success_rate_of(snapshot, id));
    let transitive = match snapshot.capabilities.get(id) {
        Some(cap) if !cap.members.is_empty() => cap
            .members
            .iter()
            .map(|m| reliability_band(config, success_rate_of(snapshot, m)))
            .fold(f32::INFINITY, f32::min),
        _ => 1.0,
    };
    own * transitive
}

/// Average heat-diffusion activation over a candidate and its immediate
/// neighborhood (direct tool-graph neighbors, or member tools for a
/// capability) — the "context-derived activations...restricted to the
/// candidate's neighborhood" of spec §4.G step 3. Open Question (spec §9):
/// resolved here as an average over the closed neighborhood rather than a
/// cosine between embeddings, since heat values are scalars, not vectors;
/// recorded in `DESIGN.md`.
fn graph_activation(snapshot: &GraphSnapshot, heat: &std::collections::HashMap<String, f64>, id: &str, tentative_threshold: u32) -> f32 {
    let mut neighborhood = HashSet::new();
    neighborhood.insert(id.to_string());
    for edge in snapshot.neighbors(id, false, tentative_threshold) {
        neighborhood.insert(edge.to.clone());
    }
    if let Some(cap) = snapshot.capabilities.get(id) {
        for member in &cap.members {
            neighborhood.insert(member.clone());
        }
    }
    let values: Vec<f64> = neighborhood.iter().filter_map(|n| heat.get(n).copied()).collect();
    if values.is_empty() {
        0.0
    } else {
        (values.iter().sum::<f64>() / values.len() as f64) as f32
    }
}

fn kind_allowed(filter: &CandidateFilter, kind: NodeKind) -> bool {
    match filter {
        CandidateFilter::Both | CandidateFilter::Ids(_) => true,
        CandidateFilter::ToolsOnly => kind == NodeKind::Tool,
        CandidateFilter::CapabilitiesOnly => kind == NodeKind::Capability,
    }
}

/// Build the candidate pool and score its non-learned components (spec
/// §4.G). `query_embedding` must already match `config.embedding_dim`.
pub fn candidates(
    config: &GatewayConfig,
    snapshot: &GraphSnapshot,
    embeddings: &EmbeddingCache,
    query_embedding: &[f32],
    options: &SearchOptions,
) -> Result<Vec<Candidate>> {
    if query_embedding.len() != config.embedding_dim {
        return Err(GatewayError::DimensionMismatch { expected: config.embedding_dim, got: query_embedding.len() });
    }

    let mut candidate_ids: HashSet<String> = if let CandidateFilter::Ids(ids) = &options.filter {
        let mut known = HashSet::new();
        for id in ids {
            if snapshot.node_kind(id).is_none() {
                warn!(id = %id, "unified search: unknown candidate id in filter skipped");
                continue;
            }
            known.insert(id.clone());
        }
        known
    } else {
        embeddings.knn(query_embedding, K_SEM)?.into_iter().map(|(id, _)| id).collect()
    };

    let mut graph_derived = HashSet::new();
    for seed in &options.context_ids {
        if snapshot.node_kind(seed).is_none() {
            warn!(id = %seed, "unified search: unknown context seed skipped");
            continue;
        }
        for edge in snapshot.neighbors(seed, false, config.edge_tentative_threshold) {
            graph_derived.insert(edge.to.clone());
        }
        for cap in snapshot.hyperedges_containing(seed) {
            graph_derived.insert(cap.id.clone());
        }
    }
    // Cap graph-derived additions deterministically (spec §4.G step 2: "1-hop
    // neighbors, capped at K_graph=100").
    let mut graph_derived: Vec<String> = graph_derived.into_iter().collect();
    graph_derived.sort();
    graph_derived.truncate(K_GRAPH);
    candidate_ids.extend(graph_derived);

    let context_seeds: HashSet<String> =
        options.context_ids.iter().filter(|s| snapshot.node_kind(s).is_some()).cloned().collect();
    let heat = heat_diffusion(
        snapshot,
        &context_seeds,
        config.heat_diffusion_steps,
        config.heat_diffusion_coefficient,
        config.edge_tentative_threshold,
    );

    let alpha = adaptive_alpha(config, snapshot);

    let mut out = Vec::with_capacity(candidate_ids.len());
    for id in candidate_ids {
        let Some(kind) = snapshot.node_kind(&id) else { continue };
        if !kind_allowed(&options.filter, kind) {
            continue;
        }
        // Supplemented feature (SPEC_FULL.md §3): quarantined capabilities and
        // deprecated tools are never surfaced by search or ranking.
        match kind {
            NodeKind::Capability => {
                if snapshot.capabilities.get(&id).is_some_and(|c| c.quarantined) {
                    continue;
                }
            }
            NodeKind::Tool => {
                if snapshot.tools.get(&id).is_some_and(|t| t.deprecated) {
                    continue;
                }
            }
        }
        let Some(candidate_embedding) = snapshot.embedding_of(&id) else { continue };
        let semantic = crate::embedding::cosine_similarity(query_embedding, candidate_embedding);
        let graph = graph_activation(snapshot, &heat, &id, config.edge_tentative_threshold);
        let reliability = reliability_of(config, snapshot, &id);
        let unified_score = ((alpha * semantic + (1.0 - alpha) * graph) * reliability).clamp(0.0, SCORE_CAP);
        out.push(Candidate { id, kind, semantic, graph, reliability, unified_score });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CapabilityContent, EdgeSource, EdgeType, GraphStore};

    fn cfg() -> GatewayConfig {
        let mut c = GatewayConfig::default();
        c.embedding_dim = 4;
        c
    }

    fn unit(seed: f32, dims: usize) -> Vec<f32> {
        let raw: Vec<f32> = (0..dims).map(|i| (i as f32 + seed).sin()).collect();
        let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-9);
        raw.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn empty_graph_has_alpha_one() {
        let store = GraphStore::new(4);
        let snap = store.snapshot();
        assert_eq!(adaptive_alpha(&cfg(), &snap), 1.0);
    }

    #[test]
    fn reliability_penalizes_low_success_rate() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        for _ in 0..10 {
            store.touch_tool_use("fs:read", false).unwrap();
        }
        let snap = store.snapshot();
        let r = reliability_of(&cfg(), &snap, "fs:read");
        assert_eq!(r, cfg().reliability_penalty);
    }

    #[test]
    fn reliability_boosts_high_success_rate() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        for _ in 0..10 {
            store.touch_tool_use("fs:read", true).unwrap();
        }
        let snap = store.snapshot();
        let r = reliability_of(&cfg(), &snap, "fs:read");
        assert_eq!(r, cfg().reliability_boost);
    }

    #[test]
    fn capability_reliability_is_min_over_children() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        store.add_or_get_tool("fs:write", "write a file");
        for _ in 0..10 {
            store.touch_tool_use("fs:read", true).unwrap();
        }
        for _ in 0..10 {
            store.touch_tool_use("fs:write", false).unwrap();
        }
        let content = CapabilityContent::Sandboxed("edit".into());
        store
            .add_or_get_capability("org.p.ns.edit.aaaa", "edit", vec!["fs:read".into(), "fs:write".into()], &content)
            .unwrap();
        let snap = store.snapshot();
        let r = reliability_of(&cfg(), &snap, "org.p.ns.edit.aaaa");
        // own factor (cold, 0.5 success rate -> 1.0) * min(boost, penalty) == penalty
        assert_eq!(r, cfg().reliability_penalty);
    }

    #[test]
    fn quarantined_capability_excluded_from_candidates() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 4)).unwrap();
        let content = CapabilityContent::Sandboxed("edit".into());
        store.add_or_get_capability("org.p.ns.edit.aaaa", "edit", vec!["fs:read".into()], &content).unwrap();
        store.set_capability_embedding("org.p.ns.edit.aaaa", unit(2.0, 4)).unwrap();
        store.quarantine_capability("org.p.ns.edit.aaaa").unwrap();
        let snap = store.snapshot();
        let mut cache = EmbeddingCache::new(4).unwrap();
        cache.upsert("fs:read", unit(1.0, 4)).unwrap();
        cache.upsert("org.p.ns.edit.aaaa", unit(2.0, 4)).unwrap();

        let found = candidates(&cfg(), &snap, &cache, &unit(1.0, 4), &SearchOptions::default()).unwrap();
        assert!(found.iter().all(|c| c.id != "org.p.ns.edit.aaaa"));
    }

    #[test]
    fn unknown_id_in_filter_is_skipped_not_errored() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 4)).unwrap();
        let snap = store.snapshot();
        let cache = EmbeddingCache::new(4).unwrap();
        let options = SearchOptions { filter: CandidateFilter::Ids(vec!["missing".into()]), context_ids: vec![] };
        let found = candidates(&cfg(), &snap, &cache, &unit(1.0, 4), &options).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn kind_filter_restricts_results() {
        let store = GraphStore::new(4);
        store.add_or_get_tool("fs:read", "read a file");
        store.set_tool_embedding("fs:read", unit(1.0, 4)).unwrap();
        let content = CapabilityContent::Sandboxed("edit".into());
        store.add_or_get_capability("org.p.ns.edit.aaaa", "edit", vec!["fs:read".into()], &content).unwrap();
        store.set_capability_embedding("org.p.ns.edit.aaaa", unit(2.0, 4)).unwrap();
        let snap = store.snapshot();
        let mut cache = EmbeddingCache::new(4).unwrap();
        cache.upsert("fs:read", unit(1.0, 4)).unwrap();
        cache.upsert("org.p.ns.edit.aaaa", unit(2.0, 4)).unwrap();

        let options = SearchOptions { filter: CandidateFilter::ToolsOnly, context_ids: vec![] };
        let found = candidates(&cfg(), &snap, &cache, &unit(1.0, 4), &options).unwrap();
        assert!(found.iter().all(|c| c.kind == NodeKind::Tool));
    }
}
