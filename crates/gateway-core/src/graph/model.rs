//! Core data model: tools (vertices), capabilities (hyperedges), and the
//! edges between tools. Mirrors spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A tagged variant distinguishing the two kinds of rankable node, per the
/// "polymorphism over tools/capabilities" design note in spec §9: a shared
/// id with a kind tag is simpler than an inheritance hierarchy, and unified
/// search treats both uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Tool,
    Capability,
}

/// An opaque error kind ∈ {timeout, permission, not-found, validation,
/// network, unknown} recorded on a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Permission,
    NotFound,
    Validation,
    Network,
    Unknown,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::Timeout,
        ErrorKind::Permission,
        ErrorKind::NotFound,
        ErrorKind::Validation,
        ErrorKind::Network,
        ErrorKind::Unknown,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|k| *k == self).unwrap_or(5)
    }
}

/// Cached structural features for a tool, refreshed by component C and
/// invalidated by the graph sync controller on relevant mutations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFeatures {
    pub pagerank: f64,
    pub louvain_community: Option<u32>,
    pub adamic_adar_digest: u64,
    pub heat_diffusion: f64,
    pub recency: f64,
}

/// A stable externally-callable operation. Vertex of the tool graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// `server:name`
    pub id: String,
    pub description: String,
    /// Unit-norm embedding, dimension equal to the engine's configured D.
    pub embedding: Option<Vec<f32>>,
    pub last_seen: DateTime<Utc>,
    pub usage_count: u64,
    pub success_count: u64,
    pub features: ToolFeatures,
    /// Lifecycle flag: tools are never destroyed, only deprecated.
    pub deprecated: bool,
}

impl Tool {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            embedding: None,
            last_seen: Utc::now(),
            usage_count: 0,
            success_count: 0,
            features: ToolFeatures::default(),
            deprecated: false,
        }
    }

    /// (I4) success_count <= usage_count must hold after every update.
    pub fn record_use(&mut self, success: bool) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        self.last_seen = Utc::now();
    }

    pub fn success_rate(&self) -> f32 {
        if self.usage_count == 0 {
            0.5 // cold start per TraceStats defaults
        } else {
            self.success_count as f32 / self.usage_count as f32
        }
    }
}

/// Cached hypergraph features for a capability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityFeatures {
    pub spectral_cluster: Option<u32>,
    pub hypergraph_pagerank: f64,
    pub cooccurrence: f64,
    pub recency: f64,
    pub adamic_adar_digest: u64,
    pub heat_diffusion: f64,
}

/// How a capability's content hash is computed (spec §3: "short hash =
/// first 4 hex of SHA-256 of the canonical content").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CapabilityContent {
    /// code for sandboxed execution
    Sandboxed(String),
    /// command+args for subprocess execution
    Subprocess { command: String, args: Vec<String> },
    /// url+env-keys for proxy execution
    Proxy { url: String, env_keys: Vec<String> },
}

impl CapabilityContent {
    /// Canonical UTF-8 content string hashed to produce the short hash.
    pub fn canonical(&self) -> String {
        match self {
            CapabilityContent::Sandboxed(code) => code.clone(),
            CapabilityContent::Subprocess { command, args } => {
                format!("{command} {}", args.join(" "))
            }
            CapabilityContent::Proxy { url, env_keys } => {
                let mut keys = env_keys.clone();
                keys.sort();
                format!("{url}|{}", keys.join(","))
            }
        }
    }
}

/// A named composition of tools and/or other capabilities. Hyperedge of the
/// capability superhypergraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// `org.project.namespace.action.shorthash`
    pub id: String,
    pub description: String,
    pub embedding: Option<Vec<f32>>,
    /// Ordered multiset of member tool or capability ids.
    pub members: Vec<String>,
    /// 0 = leaf, N = contains level-(N-1).
    pub hierarchy_level: u32,
    pub usage_count: u64,
    pub success_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub features: CapabilityFeatures,
    pub content_hash: String,
    /// Marked invalid and excluded from ranking until repaired (spec §7).
    pub quarantined: bool,
}

impl Capability {
    pub fn new(id: impl Into<String>, description: impl Into<String>, content_hash: String) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            embedding: None,
            members: Vec::new(),
            hierarchy_level: 0,
            usage_count: 0,
            success_count: 0,
            last_used: None,
            features: CapabilityFeatures::default(),
            content_hash,
            quarantined: false,
        }
    }

    pub fn record_use(&mut self, success: bool) {
        self.usage_count += 1;
        if success {
            self.success_count += 1;
        }
        self.last_used = Some(Utc::now());
    }

    pub fn success_rate(&self) -> f32 {
        if self.usage_count == 0 {
            0.5
        } else {
            self.success_count as f32 / self.usage_count as f32
        }
    }

    pub fn member_set(&self) -> HashSet<&str> {
        self.members.iter().map(|s| s.as_str()).collect()
    }
}

/// Source of an observed tool->tool edge; `user` carries a higher
/// confidence base than `learned` per the (from,to) invariant in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSource {
    User,
    Learned,
}

/// Semantic role of a tool->tool edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Data,
    Control,
    Sequence,
    Contains,
    Uses,
}

/// An observed directed relationship between two tools. Primary key is
/// `(from, to)`; `observeEdge` accumulates `observed_count` and recomputes
/// `confidence` as a monotone function of it, modulated by `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub observed_count: u32,
    pub confidence: f32,
    pub source: EdgeSource,
    pub last_observed: DateTime<Utc>,
    pub edge_type: EdgeType,
}

impl Edge {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        source: EdgeSource,
        edge_type: EdgeType,
    ) -> Self {
        let mut edge = Self {
            from: from.into(),
            to: to.into(),
            observed_count: 1,
            confidence: 0.0,
            source,
            last_observed: Utc::now(),
            edge_type,
        };
        edge.confidence = edge.compute_confidence();
        edge
    }

    /// Bump the observed count and recompute confidence, per the
    /// `observeEdge` contract in spec §4.B.
    pub fn observe(&mut self, source: EdgeSource) {
        self.observed_count += 1;
        // A user observation upgrades the source permanently; once
        // user-confirmed, an edge doesn't regress to learned-only trust.
        if source == EdgeSource::User {
            self.source = EdgeSource::User;
        }
        self.last_observed = Utc::now();
        self.confidence = self.compute_confidence();
    }

    /// confidence = f(observed_count, source), monotone in observed_count,
    /// clamped to [0,1], with `user` mapped to a higher base than `learned`.
    fn compute_confidence(&self) -> f32 {
        let base: f32 = match self.source {
            EdgeSource::User => 0.7,
            EdgeSource::Learned => 0.3,
        };
        let ceiling = match self.source {
            EdgeSource::User => 1.0,
            EdgeSource::Learned => 0.9,
        };
        let growth = 1.0 - (-(self.observed_count as f32) / 5.0).exp();
        (base + (ceiling - base) * growth).clamp(0.0, 1.0)
    }

    /// Below the tentative threshold, this edge is excluded from structural
    /// features (PageRank, Louvain, etc).
    pub fn is_tentative(&self, threshold: u32) -> bool {
        self.observed_count < threshold
    }

    /// Inverse-confidence edge weight used by Dijkstra: higher confidence
    /// means a shorter distance.
    pub fn distance_weight(&self) -> f64 {
        let c = self.confidence.max(1e-4) as f64;
        1.0 / c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_success_rate_cold_start_is_half() {
        let t = Tool::new("fs:read", "read a file");
        assert_eq!(t.success_rate(), 0.5);
    }

    #[test]
    fn tool_success_count_never_exceeds_usage_count() {
        let mut t = Tool::new("fs:read", "read a file");
        for _ in 0..10 {
            t.record_use(true);
        }
        for _ in 0..5 {
            t.record_use(false);
        }
        assert!(t.success_count <= t.usage_count);
        assert_eq!(t.usage_count, 15);
        assert_eq!(t.success_count, 10);
    }

    #[test]
    fn user_edge_confidence_exceeds_learned_at_same_count() {
        let user_edge = Edge::new("a", "b", EdgeSource::User, EdgeType::Sequence);
        let learned_edge = Edge::new("a", "b", EdgeSource::Learned, EdgeType::Sequence);
        assert!(user_edge.confidence > learned_edge.confidence);
    }

    #[test]
    fn edge_confidence_is_monotone_in_observed_count() {
        let mut edge = Edge::new("a", "b", EdgeSource::Learned, EdgeType::Sequence);
        let mut prev = edge.confidence;
        for _ in 0..20 {
            edge.observe(EdgeSource::Learned);
            assert!(edge.confidence >= prev);
            prev = edge.confidence;
        }
        assert!(edge.confidence <= 1.0);
    }

    #[test]
    fn edge_tentative_below_threshold() {
        let edge = Edge::new("a", "b", EdgeSource::Learned, EdgeType::Sequence);
        assert!(edge.is_tentative(3));
    }

    #[test]
    fn user_source_sticks_once_observed() {
        let mut edge = Edge::new("a", "b", EdgeSource::Learned, EdgeType::Sequence);
        edge.observe(EdgeSource::User);
        edge.observe(EdgeSource::Learned);
        assert_eq!(edge.source, EdgeSource::User);
    }
}
