//! Deterministic fixture generators: embeddings, a stub embedding model,
//! and factories for seeding tools/capabilities/traces onto an [`Engine`].

use chrono::Utc;
use uuid::Uuid;

use gateway_core::graph::{short_hash, CapabilityContent, ErrorKind};
use gateway_core::{EmbeddingModel, Engine, Result, TraceRecord};

/// A deterministic unit-norm embedding from a scalar seed, the same
/// sin-based construction the crate's own unit tests use throughout
/// (`scorer/shgat.rs`, `search.rs`) so fixtures stay comparable across
/// suites.
pub fn unit_embedding(seed: f32, dims: usize) -> Vec<f32> {
    let raw: Vec<f32> = (0..dims).map(|i| (i as f32 + seed).sin()).collect();
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-9);
    raw.iter().map(|x| x / norm).collect()
}

/// A trivial in-process stand-in for the opaque embedding model spec §6
/// describes: deterministic and content-sensitive enough that distinct
/// texts land at distinct points, without pulling in a real model crate.
pub struct StubEmbeddingModel {
    pub dim: usize,
}

impl EmbeddingModel for StubEmbeddingModel {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let seed = text.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        Ok(unit_embedding(seed as f32, self.dim))
    }
}

pub struct TestDataFactory;

impl TestDataFactory {
    /// Seed `count` tools named `tool:0`..`tool:{count-1}`, each with a
    /// distinct deterministic embedding, returning their ids.
    pub fn seed_tools(engine: &Engine, count: usize, dim: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = format!("tool:{i}");
            engine.add_tool(&id, &format!("test tool number {i}")).expect("add_tool");
            engine.set_tool_embedding(&id, unit_embedding(i as f32, dim)).expect("set_tool_embedding");
            ids.push(id);
        }
        ids
    }

    /// Create a capability over `members` via the event-sink API (the only
    /// constructive path into the capability hypergraph), returning its
    /// computed fqdn.
    pub fn seed_capability(
        engine: &Engine,
        action: &str,
        members: Vec<String>,
        dim: Option<usize>,
    ) -> String {
        let content = CapabilityContent::Sandboxed(format!("test capability body for {action}"));
        let hash = short_hash(&content.canonical());
        let id = format!("org.test.ns.{action}.{hash}");
        let embedding = dim.map(|d| unit_embedding(action.len() as f32, d));
        engine.on_capability_created(&id, &format!("capability: {action}"), members, content, embedding);
        id
    }

    /// One trace record for a completed episode.
    #[allow(clippy::too_many_arguments)]
    pub fn trace(
        workflow_id: Uuid,
        step_index: u32,
        intent_text: &str,
        intent_embedding: Vec<f32>,
        context_tool_ids: Vec<String>,
        candidate_id: &str,
        success: bool,
    ) -> TraceRecord {
        TraceRecord {
            workflow_id,
            step_index,
            timestamp: Utc::now(),
            intent_text: intent_text.to_string(),
            intent_embedding,
            context_tool_ids,
            candidate_id: candidate_id.to_string(),
            success,
            duration_ms: 10,
            error_kind: if success { None } else { Some(ErrorKind::Unknown) },
        }
    }
}
