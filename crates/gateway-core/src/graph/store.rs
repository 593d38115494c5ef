//! The in-memory tool graph and capability hypergraph (component B).
//!
//! Mutations build a new immutable [`GraphSnapshot`] and flip an atomic
//! pointer; reads follow the current pointer without blocking writers,
//! matching the single-writer/many-readers model in spec §4.B and §5.
//! Cycle detection for the `contains` relation uses DFS coloring over an
//! arena of handles, per the "Cyclic references" design note in spec §9.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use sha2::{Digest, Sha256};

use super::model::{Capability, CapabilityContent, Edge, EdgeSource, EdgeType, NodeKind, Tool};

/// Errors raised by graph mutations. Validation failures here leave the
/// snapshot pointer untouched (the "rollback" behavior of spec §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphStoreError {
    UnknownMember(String),
    CycleDetected(String),
    UnknownTool(String),
    UnknownCapability(String),
    DimensionMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for GraphStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphStoreError::UnknownMember(id) => write!(f, "unknown member: {id}"),
            GraphStoreError::CycleDetected(id) => write!(f, "cycle detected through {id}"),
            GraphStoreError::UnknownTool(id) => write!(f, "unknown tool: {id}"),
            GraphStoreError::UnknownCapability(id) => write!(f, "unknown capability: {id}"),
            GraphStoreError::DimensionMismatch { expected, got } => {
                write!(f, "dimension mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for GraphStoreError {}

pub type Result<T> = std::result::Result<T, GraphStoreError>;

/// An immutable point-in-time view of the graph, identified by a
/// monotonically increasing version. Graph algorithms (component C) cache
/// results keyed by this version.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub version: u64,
    pub tools: HashMap<String, Tool>,
    pub capabilities: HashMap<String, Capability>,
    /// Adjacency keyed by `from`, each entry a map `to -> Edge`.
    pub edges: HashMap<String, HashMap<String, Edge>>,
}

impl GraphSnapshot {
    pub fn node_kind(&self, id: &str) -> Option<NodeKind> {
        if self.tools.contains_key(id) {
            Some(NodeKind::Tool)
        } else if self.capabilities.contains_key(id) {
            Some(NodeKind::Capability)
        } else {
            None
        }
    }

    pub fn embedding_of(&self, id: &str) -> Option<&[f32]> {
        if let Some(t) = self.tools.get(id) {
            t.embedding.as_deref()
        } else {
            self.capabilities.get(id).and_then(|c| c.embedding.as_deref())
        }
    }

    /// Outbound neighbors of a tool, excluding tentative edges when
    /// `structural_only` is set (spec §4.B: tentative edges are excluded
    /// from structural features).
    pub fn neighbors(&self, id: &str, structural_only: bool, tentative_threshold: u32) -> Vec<&Edge> {
        self.edges
            .get(id)
            .map(|m| {
                m.values()
                    .filter(|e| !structural_only || !e.is_tentative(tentative_threshold))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Capabilities whose `members` include `id` (tool or nested capability).
    pub fn hyperedges_containing(&self, id: &str) -> Vec<&Capability> {
        self.capabilities
            .values()
            .filter(|c| c.members.iter().any(|m| m == id))
            .collect()
    }

    /// A restricted view containing only the given node ids and the edges
    /// between them. Used by heat diffusion and unified search's
    /// context-neighborhood restriction.
    pub fn subgraph(&self, ids: &HashSet<String>) -> GraphSnapshot {
        let tools = self
            .tools
            .iter()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let capabilities = self
            .capabilities
            .iter()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let edges = self
            .edges
            .iter()
            .filter(|(from, _)| ids.contains(*from))
            .map(|(from, m)| {
                let filtered: HashMap<String, Edge> = m
                    .iter()
                    .filter(|(to, _)| ids.contains(*to))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (from.clone(), filtered)
            })
            .collect();
        GraphSnapshot {
            version: self.version,
            tools,
            capabilities,
            edges,
        }
    }

    /// Non-tentative tool->tool edge count and node count, for unified
    /// search's adaptive-alpha density calculation.
    pub fn density(&self, tentative_threshold: u32) -> f64 {
        let nodes = self.tools.len() + self.capabilities.len();
        if nodes < 2 {
            return 0.0;
        }
        let edge_count: usize = self
            .edges
            .values()
            .flat_map(|m| m.values())
            .filter(|e| !e.is_tentative(tentative_threshold))
            .count();
        edge_count as f64 / (nodes as f64 * (nodes as f64 - 1.0))
    }
}

/// First 4 hex chars of SHA-256 over the canonical content, per spec §3/§6.
pub fn short_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 4)
}

fn hex_prefix(bytes: &[u8], nibbles: usize) -> String {
    let mut s = String::with_capacity(nibbles);
    for byte in bytes {
        if s.len() >= nibbles {
            break;
        }
        s.push_str(&format!("{:02x}", byte));
    }
    s.truncate(nibbles);
    s
}

/// Single-writer, many-reader graph store. Readers call [`GraphStore::snapshot`]
/// and operate lock-free on the returned `Arc`; writers hold the internal
/// lock only for the duration of building and installing the new snapshot.
pub struct GraphStore {
    current: RwLock<Arc<GraphSnapshot>>,
    embedding_dim: usize,
}

impl GraphStore {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            current: RwLock::new(Arc::new(GraphSnapshot::default())),
            embedding_dim,
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        Arc::clone(&self.current.read().expect("graph store lock poisoned"))
    }

    fn with_new_snapshot<F>(&self, f: F) -> Result<Arc<GraphSnapshot>>
    where
        F: FnOnce(&mut GraphSnapshot) -> Result<()>,
    {
        let mut guard = self.current.write().expect("graph store lock poisoned");
        let mut next = (**guard).clone();
        next.version += 1;
        f(&mut next)?;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        Ok(next)
    }

    fn validate_embedding(&self, embedding: &Option<Vec<f32>>) -> Result<()> {
        if let Some(v) = embedding {
            if v.len() != self.embedding_dim {
                return Err(GraphStoreError::DimensionMismatch {
                    expected: self.embedding_dim,
                    got: v.len(),
                });
            }
        }
        Ok(())
    }

    /// Create the tool if absent, or return the existing one unchanged.
    pub fn add_or_get_tool(&self, id: &str, description: &str) -> Arc<GraphSnapshot> {
        self.with_new_snapshot(|snap| {
            snap.tools
                .entry(id.to_string())
                .or_insert_with(|| Tool::new(id, description));
            Ok(())
        })
        .expect("add_or_get_tool is infallible")
    }

    pub fn set_tool_embedding(&self, id: &str, embedding: Vec<f32>) -> Result<Arc<GraphSnapshot>> {
        self.validate_embedding(&Some(embedding.clone()))?;
        self.with_new_snapshot(|snap| {
            let tool = snap
                .tools
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownTool(id.to_string()))?;
            tool.embedding = Some(embedding);
            Ok(())
        })
    }

    /// Record an invocation outcome against a tool, bumping usage/success
    /// counts (I4 is preserved by construction).
    pub fn touch_tool_use(&self, id: &str, success: bool) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let tool = snap
                .tools
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownTool(id.to_string()))?;
            tool.record_use(success);
            Ok(())
        })
    }

    pub fn deprecate_tool(&self, id: &str) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let tool = snap
                .tools
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownTool(id.to_string()))?;
            tool.deprecated = true;
            Ok(())
        })
    }

    /// Insert a capability after validating (I1) that every member exists,
    /// and (I2) that adding it introduces no `contains` cycle. `content`
    /// determines the integrity hash (I5): two capabilities with identical
    /// hashes share storage via [`GraphStore::merge_capabilities`].
    pub fn add_or_get_capability(
        &self,
        id: &str,
        description: &str,
        members: Vec<String>,
        content: &CapabilityContent,
    ) -> Result<Arc<GraphSnapshot>> {
        let hash = short_hash(&content.canonical());
        self.with_new_snapshot(|snap| {
            if snap.capabilities.contains_key(id) {
                return Ok(());
            }
            for member in &members {
                if !snap.tools.contains_key(member) && !snap.capabilities.contains_key(member) {
                    return Err(GraphStoreError::UnknownMember(member.clone()));
                }
            }
            let level = hierarchy_level(snap, &members)?;
            detect_contains_cycle(snap, id, &members)?;
            let mut cap = Capability::new(id, description, hash.clone());
            cap.members = members;
            cap.hierarchy_level = level;
            snap.capabilities.insert(id.to_string(), cap);
            Ok(())
        })
    }

    pub fn set_capability_embedding(
        &self,
        id: &str,
        embedding: Vec<f32>,
    ) -> Result<Arc<GraphSnapshot>> {
        self.validate_embedding(&Some(embedding.clone()))?;
        self.with_new_snapshot(|snap| {
            let cap = snap
                .capabilities
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownCapability(id.to_string()))?;
            cap.embedding = Some(embedding);
            Ok(())
        })
    }

    /// Replace a capability's members, re-validating I1/I2 and recomputing
    /// `hierarchy_level`.
    pub fn update_capability_members(
        &self,
        id: &str,
        members: Vec<String>,
    ) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            if !snap.capabilities.contains_key(id) {
                return Err(GraphStoreError::UnknownCapability(id.to_string()));
            }
            for member in &members {
                if !snap.tools.contains_key(member) && !snap.capabilities.contains_key(member) {
                    return Err(GraphStoreError::UnknownMember(member.clone()));
                }
            }
            let level = hierarchy_level(snap, &members)?;
            detect_contains_cycle(snap, id, &members)?;
            let cap = snap.capabilities.get_mut(id).unwrap();
            cap.members = members;
            cap.hierarchy_level = level;
            Ok(())
        })
    }

    pub fn touch_capability_use(&self, id: &str, success: bool) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let cap = snap
                .capabilities
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownCapability(id.to_string()))?;
            cap.record_use(success);
            Ok(())
        })
    }

    pub fn quarantine_capability(&self, id: &str) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let cap = snap
                .capabilities
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownCapability(id.to_string()))?;
            cap.quarantined = true;
            Ok(())
        })
    }

    pub fn repair_capability(&self, id: &str) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let cap = snap
                .capabilities
                .get_mut(id)
                .ok_or_else(|| GraphStoreError::UnknownCapability(id.to_string()))?;
            cap.quarantined = false;
            Ok(())
        })
    }

    /// Merge two capabilities sharing an integrity hash (I5): unify ids
    /// under the oldest FQDN, aggregate usage/success counts, and redirect
    /// every inbound member reference from `absorbed` to `surviving`.
    pub fn merge_capabilities(
        &self,
        surviving: &str,
        absorbed: &str,
    ) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            let absorbed_cap = snap
                .capabilities
                .remove(absorbed)
                .ok_or_else(|| GraphStoreError::UnknownCapability(absorbed.to_string()))?;
            let surviving_cap = snap
                .capabilities
                .get_mut(surviving)
                .ok_or_else(|| GraphStoreError::UnknownCapability(surviving.to_string()))?;
            surviving_cap.usage_count += absorbed_cap.usage_count;
            surviving_cap.success_count += absorbed_cap.success_count;
            if let Some(t) = absorbed_cap.last_used {
                surviving_cap.last_used = Some(surviving_cap.last_used.map_or(t, |s| s.max(t)));
            }
            for cap in snap.capabilities.values_mut() {
                for member in cap.members.iter_mut() {
                    if member == absorbed {
                        *member = surviving.to_string();
                    }
                }
            }
            Ok(())
        })
    }

    /// Insert a fully-formed tool as-is, bypassing the validation new
    /// mutations go through. Used only to rehydrate the graph from the
    /// persisted mirror at startup, where the row was already validated
    /// once on its way in.
    pub fn hydrate_tool(&self, tool: Tool) -> Arc<GraphSnapshot> {
        self.with_new_snapshot(|snap| {
            snap.tools.insert(tool.id.clone(), tool.clone());
            Ok(())
        })
        .expect("hydrate_tool is infallible")
    }

    /// Insert a fully-formed capability as-is. Callers must hydrate in
    /// `hierarchy_level` order (leaves first) so members already exist.
    pub fn hydrate_capability(&self, cap: Capability) -> Arc<GraphSnapshot> {
        self.with_new_snapshot(|snap| {
            snap.capabilities.insert(cap.id.clone(), cap.clone());
            Ok(())
        })
        .expect("hydrate_capability is infallible")
    }

    /// Insert a fully-formed edge as-is.
    pub fn hydrate_edge(&self, edge: Edge) -> Arc<GraphSnapshot> {
        self.with_new_snapshot(|snap| {
            snap.edges.entry(edge.from.clone()).or_default().insert(edge.to.clone(), edge.clone());
            Ok(())
        })
        .expect("hydrate_edge is infallible")
    }

    /// Accumulate an observation for a tool->tool edge, creating it (and
    /// both endpoint tools, if missing as bare placeholders is not done
    /// here — callers must `add_or_get_tool` first) if absent.
    pub fn observe_edge(
        &self,
        from: &str,
        to: &str,
        source: EdgeSource,
        edge_type: EdgeType,
    ) -> Result<Arc<GraphSnapshot>> {
        self.with_new_snapshot(|snap| {
            if !snap.tools.contains_key(from) {
                return Err(GraphStoreError::UnknownTool(from.to_string()));
            }
            if !snap.tools.contains_key(to) {
                return Err(GraphStoreError::UnknownTool(to.to_string()));
            }
            let bucket = snap.edges.entry(from.to_string()).or_default();
            match bucket.get_mut(to) {
                Some(edge) => edge.observe(source),
                None => {
                    bucket.insert(to.to_string(), Edge::new(from, to, source, edge_type));
                }
            }
            Ok(())
        })
    }
}

/// `hierarchy_level(c) = 0 iff no contains-outgoing edge; otherwise = 1 +
/// max(level of contained)` (I2, invariant form).
fn hierarchy_level(snap: &GraphSnapshot, members: &[String]) -> Result<u32> {
    let mut max_child_level: Option<u32> = None;
    for member in members {
        if let Some(cap) = snap.capabilities.get(member) {
            max_child_level = Some(max_child_level.map_or(cap.hierarchy_level, |m| m.max(cap.hierarchy_level)));
        }
    }
    Ok(max_child_level.map_or(0, |m| m + 1))
}

/// DFS-coloring cycle check: would inserting `id -> members` create a path
/// back to `id` through the `contains` relation?
fn detect_contains_cycle(snap: &GraphSnapshot, id: &str, members: &[String]) -> Result<()> {
    let mut stack: VecDeque<String> = members.iter().cloned().collect();
    let mut visited: HashSet<String> = HashSet::new();
    while let Some(current) = stack.pop_front() {
        if current == id {
            return Err(GraphStoreError::CycleDetected(id.to_string()));
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(cap) = snap.capabilities.get(&current) {
            for child in &cap.members {
                stack.push_back(child.clone());
            }
        }
    }
    Ok(())
}
