//! # gateway-core
//!
//! A context-optimization gateway: ranks tools and capabilities for an
//! agent's next step from a two-level graph (a simple tool graph plus a
//! capability superhypergraph) blended with a learned attention scorer.
//!
//! ## Architecture
//!
//! - **Embedding cache & vector index** ([`embedding`]) — unit-norm
//!   embeddings for every tool/capability, ANN retrieval via an HNSW index
//!   with exact-scan fallback below 32 points.
//! - **Tool graph & capability hypergraph** ([`graph`]) — the
//!   snapshot-pointer-flip [`graph::GraphStore`] and the structural
//!   algorithms (PageRank, Louvain, Adamic-Adar, heat diffusion, spectral
//!   clustering) that run over it.
//! - **Trace log & feature builder** ([`trace`]) — the append-only
//!   execution history and its 17-scalar feature projection.
//! - **SHGAT scorer & trainer** ([`scorer`]) — the K-head attention network
//!   and its prioritized-replay, Adam-optimized training loop.
//! - **Unified search** ([`search`]) — the adaptive-alpha semantic/graph
//!   blend with reliability banding that produces each candidate's
//!   non-learned score components.
//! - **Graph sync controller** ([`sync`]) — the single-writer event
//!   application path for capability lifecycle events.
//! - **Persisted relational mirror** ([`persistence`]) — the SQLite
//!   write-through copy used to rehydrate state across restarts.
//!
//! [`Engine`] wires all of the above into the three surfaces spec'd for
//! callers: ranking, training, and the capability event sink.

pub mod config;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod scorer;
pub mod search;
pub mod sync;
pub mod trace;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use graph::{Capability, CapabilityContent, Edge, EdgeSource, EdgeType, NodeKind, Tool};
pub use scorer::ScorerState;
pub use search::CandidateFilter;
pub use trace::TraceRecord;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use uuid::Uuid;

use embedding::EmbeddingCache;
use graph::{AlgorithmsCache, GraphStore};
use persistence::PersistenceMirror;
use scorer::{ScorerConfig, ShgatScorer, TrainResult, Trainer};
use sync::{GraphSyncController, SyncEvent, SyncHandles};
use trace::{TraceFeatureBuilder, TraceStore};

/// The caller's query: either raw text (requiring an [`EmbeddingModel`]) or
/// a precomputed embedding already matching the engine's configured
/// `embeddingDim`.
pub enum Intent {
    Text(String),
    Embedding(Vec<f32>),
}

/// The embedding model's interface, as spec'd: `encode`/`dispose`. Kept
/// external to the engine — the engine treats it as opaque, the way
/// `vestige-core`'s `embeddings/local.rs` wraps fastembed behind a narrow
/// trait rather than depending on a concrete model crate.
pub trait EmbeddingModel: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Release any model-held resources. Default no-op; most in-process
    /// embedders have nothing to release.
    fn dispose(&self) {}
}

/// Restricts and biases a ranking request.
#[derive(Debug, Clone)]
pub struct RankOptions {
    pub context_tool_ids: Vec<String>,
    pub filter: CandidateFilter,
    pub limit: usize,
    pub min_score: f32,
    /// Optional wall-clock deadline; on expiry the ranking returns early
    /// with `incomplete = true` rather than erroring (spec §5 "Cancellation
    /// and timeouts").
    pub deadline: Option<Instant>,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            context_tool_ids: Vec::new(),
            filter: CandidateFilter::default(),
            limit: 10,
            min_score: 0.3,
            deadline: None,
        }
    }
}

/// One ranked candidate. `score` is the component-G unified score (spec
/// §4.G steps 4-5, clamped to 0.95 per P4); `head_weights` and
/// `learned_score` are the SHGAT (component E) interpretability metadata
/// named in spec §6's `rank()` contract, not the sort key.
#[derive(Debug, Clone)]
pub struct RankedItem {
    pub id: String,
    pub kind: NodeKind,
    pub score: f32,
    pub head_weights: Vec<f32>,
    pub learned_score: f32,
    pub reliability: f32,
    pub semantic: f32,
    pub graph: f32,
}

/// The result of a [`Engine::rank`] call.
#[derive(Debug, Clone)]
pub struct RankResponse {
    pub items: Vec<RankedItem>,
    /// Set when a deadline cut the candidate pass short; `items` is a
    /// prefix of what a full pass would have returned, not a wrong answer.
    pub incomplete: bool,
}

/// Supplemented feature (SPEC_FULL.md §3): a coarse liveness/degradation
/// summary, in the spirit of `vestige-mcp`'s `tools/health.rs`.
#[derive(Debug, Clone)]
pub struct GatewayHealth {
    pub tool_count: usize,
    pub capability_count: usize,
    pub trace_count: usize,
    pub scorer_state: ScorerState,
    pub active_heads: usize,
    /// True once the persisted mirror has exhausted its retry budget and
    /// the engine is serving in-memory-only (spec §7).
    pub persistence_degraded: bool,
    pub persistence_enabled: bool,
}

/// Retry budget for persisted-mirror writes before degrading to
/// in-memory-only mode (spec §7 "Storage errors ... retried ... up to 3").
const PERSISTENCE_RETRY_BUDGET: u32 = 3;

/// The context-optimization gateway engine: owns every component and
/// exposes the Ranking API, Training API, and event-sink API named in spec
/// §6.
pub struct Engine {
    config: GatewayConfig,
    store: Arc<GraphStore>,
    embeddings: Arc<Mutex<EmbeddingCache>>,
    algorithms: Arc<Mutex<AlgorithmsCache>>,
    scorer: Arc<RwLock<ShgatScorer>>,
    trainer: Mutex<Trainer>,
    traces: Mutex<TraceStore>,
    rank_features: Mutex<TraceFeatureBuilder>,
    sync: Mutex<GraphSyncController>,
    sync_handles: SyncHandles,
    persistence: Option<PersistenceMirror>,
    degraded: AtomicBool,
    seed: u64,
}

impl Engine {
    /// Build an in-memory-only engine (no persisted mirror) with a fixed
    /// deterministic seed, matching the default most callers want for
    /// embedding in a larger process.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_seed(config, 0x5347_4154_5f47_4153)
    }

    /// As [`Self::new`], but with an explicit RNG seed — the knob the
    /// determinism property (P5) and the scenario/property test suite pin
    /// down to get reproducible Louvain/PER/Adam behavior.
    pub fn with_seed(config: GatewayConfig, seed: u64) -> Result<Self> {
        let store = Arc::new(GraphStore::new(config.embedding_dim));
        let embeddings = Arc::new(Mutex::new(EmbeddingCache::new(config.embedding_dim)?));
        let algorithms = Arc::new(Mutex::new(AlgorithmsCache::new()));

        let num_heads =
            if config.adaptive_heads { GatewayConfig::heads_for_trace_volume(0) } else { config.num_heads };
        let scorer_config = ScorerConfig::from_gateway_config(&config, num_heads);
        let scorer = Arc::new(RwLock::new(ShgatScorer::new(config.embedding_dim, scorer_config, seed)));

        let trainer = Mutex::new(Trainer::new(&config, seed));
        let traces = Mutex::new(TraceStore::new(config.trace_retention_days));
        let rank_features = Mutex::new(TraceFeatureBuilder::new(config.recency_tau_days));

        let (sync_controller, _sync_tx) = GraphSyncController::new(config.index_patch_batch_size);
        let sync_handles = SyncHandles {
            store: Arc::clone(&store),
            scorer: Arc::clone(&scorer),
            embeddings: Arc::clone(&embeddings),
            algorithms: Arc::clone(&algorithms),
        };

        Ok(Self {
            config,
            store,
            embeddings,
            algorithms,
            scorer,
            trainer,
            traces,
            rank_features,
            sync: Mutex::new(sync_controller),
            sync_handles,
            persistence: None,
            degraded: AtomicBool::new(false),
            seed,
        })
    }

    /// Build an engine backed by a persisted relational mirror at
    /// `db_path` (or the platform default data directory when `None`),
    /// rehydrating the in-memory graph and trace log from it.
    pub fn with_persistence(config: GatewayConfig, db_path: Option<PathBuf>) -> Result<Self> {
        let mirror = PersistenceMirror::open(db_path)?;
        let mut engine = Self::with_seed(config, 0x5347_4154_5f47_4153)?;
        engine.persistence = Some(mirror);
        engine.reload_from_persistence()?;
        Ok(engine)
    }

    /// As [`Self::with_persistence`], but against an already-open
    /// in-memory mirror — used by tests that want the write-through path
    /// exercised without a temp file.
    pub fn with_in_memory_persistence(config: GatewayConfig) -> Result<Self> {
        let mirror = PersistenceMirror::open_in_memory()?;
        let mut engine = Self::with_seed(config, 0x5347_4154_5f47_4153)?;
        engine.persistence = Some(mirror);
        Ok(engine)
    }

    fn reload_from_persistence(&mut self) -> Result<()> {
        let Some(mirror) = &self.persistence else { return Ok(()) };

        let mut tools = mirror.load_tools()?;
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        for tool in tools {
            if let Some(embedding) = tool.embedding.clone() {
                let mut cache = self.embeddings.lock().expect("embedding cache lock poisoned");
                let _ = cache.upsert(&tool.id, embedding);
            }
            self.store.hydrate_tool(tool);
        }

        let mut capabilities = mirror.load_capabilities()?;
        // Leaves (hierarchy_level 0) first so every capability's members
        // already exist by the time it is hydrated.
        capabilities.sort_by_key(|c| c.hierarchy_level);
        for cap in capabilities {
            if let Some(embedding) = cap.embedding.clone() {
                let mut cache = self.embeddings.lock().expect("embedding cache lock poisoned");
                let _ = cache.upsert(&cap.id, embedding);
            }
            self.store.hydrate_capability(cap);
        }

        for edge in mirror.load_edges()? {
            self.store.hydrate_edge(edge);
        }

        let mut traces = self.traces.lock().expect("trace store lock poisoned");
        for record in mirror.load_recent_traces(self.config.max_buffer_size)? {
            traces.append(record);
        }
        Ok(())
    }

    /// Retry a persisted-mirror write up to [`PERSISTENCE_RETRY_BUDGET`]
    /// times; on exhaustion, flip the engine into degraded (in-memory-only)
    /// mode and log it rather than surfacing an error to the caller (spec
    /// §7). The in-memory graph mutation that prompted the write has
    /// already succeeded by the time this runs.
    fn persist_with_retry<F>(&self, what: &str, op: F)
    where
        F: Fn() -> Result<()>,
    {
        let Some(_mirror) = &self.persistence else { return };
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }
        let mut last_err = None;
        for attempt in 0..PERSISTENCE_RETRY_BUDGET {
            match op() {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(what, attempt, error = %e, "persistence write failed, retrying");
                    last_err = Some(e);
                }
            }
        }
        tracing::error!(what, error = ?last_err, "persistence retry budget exhausted, degrading to in-memory-only");
        self.degraded.store(true, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Graph mutation surface (tool graph + capability hypergraph).
    // ------------------------------------------------------------------

    pub fn add_tool(&self, id: &str, description: &str) -> Result<()> {
        self.store.add_or_get_tool(id, description);
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(tool) = snap.tools.get(id) {
                self.persist_with_retry("upsert_tool", || mirror.upsert_tool(tool));
            }
        }
        Ok(())
    }

    pub fn set_tool_embedding(&self, id: &str, mut embedding: Vec<f32>) -> Result<()> {
        embedding::normalize(&mut embedding);
        self.store.set_tool_embedding(id, embedding.clone())?;
        self.embeddings.lock().expect("embedding cache lock poisoned").upsert(id, embedding)?;
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(tool) = snap.tools.get(id) {
                self.persist_with_retry("upsert_tool", || mirror.upsert_tool(tool));
            }
        }
        Ok(())
    }

    pub fn touch_tool_use(&self, id: &str, success: bool) -> Result<()> {
        self.store.touch_tool_use(id, success)?;
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(tool) = snap.tools.get(id) {
                self.persist_with_retry("upsert_tool", || mirror.upsert_tool(tool));
            }
        }
        Ok(())
    }

    /// Supplemented feature (SPEC_FULL.md §3): tools are never destroyed,
    /// only deprecated; ranking/search exclude them from then on.
    pub fn deprecate_tool(&self, id: &str) -> Result<()> {
        self.store.deprecate_tool(id)?;
        Ok(())
    }

    pub fn observe_edge(&self, from: &str, to: &str, source: EdgeSource, edge_type: EdgeType) -> Result<()> {
        self.store.observe_edge(from, to, source, edge_type)?;
        self.algorithms.lock().expect("algorithms cache lock poisoned").invalidate();
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(edge) = snap.edges.get(from).and_then(|m| m.get(to)) {
                self.persist_with_retry("upsert_edge", || mirror.upsert_edge(edge));
            }
        }
        Ok(())
    }

    pub fn quarantine_capability(&self, id: &str) -> Result<()> {
        self.store.quarantine_capability(id)?;
        Ok(())
    }

    pub fn repair_capability(&self, id: &str) -> Result<()> {
        self.store.repair_capability(id)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event-sink API (spec §6 "Event sink API", component H).
    // ------------------------------------------------------------------

    /// Apply a `capability.created` event. Serialized behind the same
    /// mutex the other two event handlers use, so concurrent callers see
    /// FIFO application order — the single-writer guarantee of spec §4.H,
    /// implemented as direct synchronous dispatch rather than a channel and
    /// background task so it works the same with or without a tokio
    /// runtime in scope (see `DESIGN.md`).
    pub fn on_capability_created(
        &self,
        id: &str,
        description: &str,
        members: Vec<String>,
        content: CapabilityContent,
        embedding: Option<Vec<f32>>,
    ) {
        let event = SyncEvent::CapabilityCreated {
            event_id: Uuid::new_v4(),
            id: id.to_string(),
            description: description.to_string(),
            members,
            content,
            embedding,
        };
        self.sync.lock().expect("sync controller lock poisoned").apply(event, &self.sync_handles);
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(cap) = snap.capabilities.get(id) {
                self.persist_with_retry("upsert_capability", || mirror.upsert_capability(cap));
            }
        }
    }

    pub fn on_capability_updated(&self, id: &str, members: Option<Vec<String>>, embedding: Option<Vec<f32>>) {
        let event =
            SyncEvent::CapabilityUpdated { event_id: Uuid::new_v4(), id: id.to_string(), members, embedding };
        self.sync.lock().expect("sync controller lock poisoned").apply(event, &self.sync_handles);
        if let Some(mirror) = &self.persistence {
            let snap = self.store.snapshot();
            if let Some(cap) = snap.capabilities.get(id) {
                self.persist_with_retry("upsert_capability", || mirror.upsert_capability(cap));
            }
        }
    }

    pub fn on_capability_merged(&self, surviving: &str, absorbed: &str) {
        let event =
            SyncEvent::CapabilityMerged { event_id: Uuid::new_v4(), surviving: surviving.to_string(), absorbed: absorbed.to_string() };
        self.sync.lock().expect("sync controller lock poisoned").apply(event, &self.sync_handles);
    }

    /// Clone of the bounded channel's sender for deployments that want to
    /// decouple event production from application via a background task
    /// (`tokio::spawn(GraphSyncController::run(...))`), instead of the
    /// direct synchronous dispatch the `on_capability_*` methods use. Not
    /// wired to anything inside `Engine` itself.
    pub fn clone_store_handle(&self) -> SyncHandles {
        self.sync_handles.clone()
    }

    // ------------------------------------------------------------------
    // Ranking API (spec §6 "Ranking API", component G + E).
    // ------------------------------------------------------------------

    pub fn rank(&self, intent: Intent, model: Option<&dyn EmbeddingModel>, options: &RankOptions) -> Result<RankResponse> {
        let mut query_embedding = match intent {
            Intent::Embedding(v) => v,
            Intent::Text(text) => {
                let model = model.ok_or(GatewayError::MissingEmbeddingModel)?;
                model.encode(&text)?
            }
        };
        if query_embedding.len() != self.config.embedding_dim {
            return Err(GatewayError::DimensionMismatch {
                expected: self.config.embedding_dim,
                got: query_embedding.len(),
            });
        }
        embedding::normalize(&mut query_embedding);

        let snapshot = self.store.snapshot();
        let search_options =
            search::SearchOptions { filter: options.filter.clone(), context_ids: options.context_tool_ids.clone() };
        let candidates = {
            let embeddings = self.embeddings.lock().expect("embedding cache lock poisoned");
            search::candidates(&self.config, &snapshot, &embeddings, &query_embedding, &search_options)?
        };

        let scorer = self.scorer.read().expect("scorer lock poisoned");
        let traces = self.traces.lock().expect("trace store lock poisoned");
        let mut feature_builder = self.rank_features.lock().expect("trace feature builder lock poisoned");

        let mut items = Vec::with_capacity(candidates.len());
        let mut incomplete = false;
        for candidate in candidates {
            if let Some(deadline) = options.deadline {
                if Instant::now() >= deadline {
                    incomplete = true;
                    break;
                }
            }
            if candidate.unified_score < options.min_score {
                continue;
            }
            let trace_stats =
                feature_builder.features_for(&traces, &query_embedding, &candidate.id, &options.context_tool_ids);
            let output = scorer.score(&snapshot, &query_embedding, &candidate.id, candidate.kind, &trace_stats)?;
            items.push(RankedItem {
                id: candidate.id,
                kind: candidate.kind,
                score: candidate.unified_score,
                head_weights: output.head_weights,
                learned_score: output.score,
                reliability: candidate.reliability,
                semantic: candidate.semantic,
                graph: candidate.graph,
            });
        }

        items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        items.truncate(options.limit);

        Ok(RankResponse { items, incomplete })
    }

    // ------------------------------------------------------------------
    // Training API (spec §6 "Training API", components D + E + F).
    // ------------------------------------------------------------------

    /// Record a completed execution episode: feeds the replay buffer,
    /// appends to the trace log, and learns a `sequence` edge between each
    /// consecutive pair of context tools (and from the last context tool to
    /// the chosen candidate) so the graph itself captures the co-occurrence
    /// pattern unified search's heat-diffusion term later rewards —
    /// independent of whether the SHGAT scorer has been trained yet.
    pub fn observe(&self, record: TraceRecord) -> Result<()> {
        let record = record.with_bounded_context();
        let snapshot = self.store.snapshot();

        {
            let scorer = self.scorer.read().expect("scorer lock poisoned");
            let mut traces = self.traces.lock().expect("trace store lock poisoned");
            let mut trainer = self.trainer.lock().expect("trainer lock poisoned");
            trainer.record(&scorer, &traces, &snapshot, &record)?;
            traces.append(record.clone());
        }

        for pair in record.context_tool_ids.windows(2) {
            let _ = self.store.observe_edge(&pair[0], &pair[1], EdgeSource::Learned, EdgeType::Sequence);
        }
        if let Some(last_context) = record.context_tool_ids.last() {
            if snapshot.node_kind(&record.candidate_id) == Some(NodeKind::Tool) {
                let _ = self.store.observe_edge(
                    last_context,
                    &record.candidate_id,
                    EdgeSource::Learned,
                    EdgeType::Sequence,
                );
            }
        }
        self.algorithms.lock().expect("algorithms cache lock poisoned").invalidate();

        match snapshot.node_kind(&record.candidate_id) {
            Some(NodeKind::Tool) => {
                self.store.touch_tool_use(&record.candidate_id, record.success)?;
            }
            Some(NodeKind::Capability) => {
                self.store.touch_capability_use(&record.candidate_id, record.success)?;
            }
            None => {}
        }

        if let Some(mirror) = &self.persistence {
            self.persist_with_retry("append_trace", || mirror.append_trace(&record));
        }
        Ok(())
    }

    /// Retier the scorer's head count if `adaptiveHeads` is set and the
    /// trace volume has crossed into a new tier, re-initializing parameters
    /// at the new architecture (spec §4.E "adaptive K", §9).
    fn maybe_retier(&self) {
        if !self.config.adaptive_heads {
            return;
        }
        let volume = self.traces.lock().expect("trace store lock poisoned").len();
        let target_heads = GatewayConfig::heads_for_trace_volume(volume);
        let mut scorer = self.scorer.write().expect("scorer lock poisoned");
        if scorer.config().num_heads == target_heads {
            return;
        }
        let new_config = ScorerConfig::from_gateway_config(&self.config, target_heads);
        let mut new_scorer = ShgatScorer::new(self.config.embedding_dim, new_config, self.seed);
        std::mem::swap(&mut *scorer, &mut new_scorer);
        tracing::info!(from = new_scorer.config().num_heads, to = target_heads, "scorer retiered for trace volume");
    }

    /// Train the fusion MLP on whatever the replay buffer has accumulated.
    /// A no-op (returns `trained: false`) below `minTracesForTraining`.
    pub fn train_now(&self) -> Result<TrainResult> {
        self.maybe_retier();
        let mut scorer = self.scorer.write().expect("scorer lock poisoned");
        let mut trainer = self.trainer.lock().expect("trainer lock poisoned");
        trainer.train_now(&mut scorer)
    }

    // ------------------------------------------------------------------
    // Introspection.
    // ------------------------------------------------------------------

    /// Supplemented feature (SPEC_FULL.md §3): a coarse liveness summary
    /// in the spirit of `vestige-mcp`'s `tools/health.rs`.
    pub fn health(&self) -> GatewayHealth {
        let snapshot = self.store.snapshot();
        let scorer = self.scorer.read().expect("scorer lock poisoned");
        GatewayHealth {
            tool_count: snapshot.tools.len(),
            capability_count: snapshot.capabilities.len(),
            trace_count: self.traces.lock().expect("trace store lock poisoned").len(),
            scorer_state: scorer.state(),
            active_heads: scorer.config().active_heads.iter().filter(|a| **a).count(),
            persistence_degraded: self.degraded.load(Ordering::Relaxed),
            persistence_enabled: self.persistence.is_some(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Snapshot of the current graph, for callers that need to inspect
    /// structure directly rather than through ranking (e.g. scenario tests,
    /// or a future dashboard built on top of this crate).
    pub fn graph_snapshot(&self) -> Arc<graph::GraphSnapshot> {
        self.store.snapshot()
    }
}
