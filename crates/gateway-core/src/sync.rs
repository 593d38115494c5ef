//! Component H: Graph Sync Controller (spec §4.H).
//!
//! A single background consumer applies capability lifecycle events to the
//! graph store, invalidates the affected SHGAT caches, and evicts stale
//! embeddings — the only writer path into [`crate::graph::GraphStore`]
//! besides direct engine calls, matching the "single writer advances the
//! snapshot pointer atomically" rule of spec §5.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::embedding::EmbeddingCache;
use crate::graph::{AlgorithmsCache, CapabilityContent, GraphStore};
use crate::scorer::ShgatScorer;

/// One of the three domain events the controller subscribes to (spec §4.H).
/// Each carries an `event_id` so duplicate delivery is a no-op (spec §4.H
/// "Ordering guarantee").
#[derive(Debug, Clone)]
pub enum SyncEvent {
    CapabilityCreated {
        event_id: Uuid,
        id: String,
        description: String,
        members: Vec<String>,
        content: CapabilityContent,
        embedding: Option<Vec<f32>>,
    },
    CapabilityUpdated {
        event_id: Uuid,
        id: String,
        members: Option<Vec<String>>,
        embedding: Option<Vec<f32>>,
    },
    CapabilityMerged {
        event_id: Uuid,
        surviving: String,
        absorbed: String,
    },
}

impl SyncEvent {
    fn id(&self) -> Uuid {
        match self {
            SyncEvent::CapabilityCreated { event_id, .. }
            | SyncEvent::CapabilityUpdated { event_id, .. }
            | SyncEvent::CapabilityMerged { event_id, .. } => *event_id,
        }
    }
}

/// The shared handles the controller patches. Bundled separately from
/// [`GraphSyncController`] so [`crate::Engine`] can clone the `Arc`s it
/// already owns without the controller borrowing the whole engine.
#[derive(Clone)]
pub struct SyncHandles {
    pub store: Arc<GraphStore>,
    pub scorer: Arc<RwLock<ShgatScorer>>,
    pub embeddings: Arc<Mutex<EmbeddingCache>>,
    pub algorithms: Arc<Mutex<AlgorithmsCache>>,
}

/// Event-driven incremental graph updates. Owns the consumer end of a
/// bounded channel; `Engine` owns the sender side and the one live instance
/// of this controller, matching "a single background task owns the consumer
/// position" (spec §4.H).
pub struct GraphSyncController {
    receiver: mpsc::Receiver<SyncEvent>,
    applied_event_ids: HashSet<Uuid>,
}

impl GraphSyncController {
    /// Bounded channel capacity matches `index_patch_batch_size` by
    /// convention but is not required to; the caller picks it.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<SyncEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { receiver: rx, applied_event_ids: HashSet::new() }, tx)
    }

    /// Drain events until the sender is dropped. Intended to be
    /// `tokio::spawn`ed once by the owner of the sender half.
    pub async fn run(mut self, handles: SyncHandles) {
        while let Some(event) = self.receiver.recv().await {
            self.apply(event, &handles);
        }
        debug!("graph sync controller: sender dropped, shutting down");
    }

    /// Apply a single event, synchronously. Exposed separately from [`Self::run`]
    /// so tests can drive the controller without a tokio runtime.
    pub fn apply(&mut self, event: SyncEvent, handles: &SyncHandles) {
        let id = event.id();
        if !self.applied_event_ids.insert(id) {
            debug!(event_id = %id, "graph sync controller: duplicate event ignored");
            return;
        }

        match event {
            SyncEvent::CapabilityCreated { id, description, members, content, embedding, .. } => {
                match handles.store.add_or_get_capability(&id, &description, members, &content) {
                    Ok(_) => {
                        if let Some(vector) = embedding {
                            if let Err(e) = handles.store.set_capability_embedding(&id, vector.clone()) {
                                warn!(capability = %id, error = %e, "sync: failed to set embedding on created capability");
                            } else if let Ok(mut cache) = handles.embeddings.lock() {
                                let _ = cache.upsert(&id, vector);
                            }
                        }
                        if let Ok(mut scorer) = handles.scorer.write() {
                            scorer.mark_stale();
                        }
                        if let Ok(mut algos) = handles.algorithms.lock() {
                            algos.invalidate();
                        }
                    }
                    Err(e) => warn!(capability = %id, error = %e, "sync: capability.created failed"),
                }
            }
            SyncEvent::CapabilityUpdated { id, members, embedding, .. } => {
                let members_changed = members.is_some();
                if let Some(new_members) = members {
                    if let Err(e) = handles.store.update_capability_members(&id, new_members) {
                        warn!(capability = %id, error = %e, "sync: capability.updated failed");
                        return;
                    }
                }
                if let Some(vector) = embedding {
                    if let Err(e) = handles.store.set_capability_embedding(&id, vector.clone()) {
                        warn!(capability = %id, error = %e, "sync: failed to update capability embedding");
                    } else if let Ok(mut cache) = handles.embeddings.lock() {
                        let _ = cache.upsert(&id, vector);
                    }
                }
                // The scorer tracks one crate-wide `Stale` flag rather than
                // per-hyperedge staleness, so marking it here already covers
                // this hyperedge and every ancestor that depends on it
                // (spec §4.H "E stale for this hyperedge and its ancestors").
                if let Ok(mut scorer) = handles.scorer.write() {
                    scorer.mark_stale();
                }
                if members_changed {
                    if let Ok(mut algos) = handles.algorithms.lock() {
                        algos.invalidate();
                    }
                }
            }
            SyncEvent::CapabilityMerged { surviving, absorbed, .. } => {
                match handles.store.merge_capabilities(&surviving, &absorbed) {
                    Ok(_) => {
                        if let Ok(mut cache) = handles.embeddings.lock() {
                            let _ = cache.remove(&absorbed);
                        }
                        if let Ok(mut scorer) = handles.scorer.write() {
                            scorer.mark_stale();
                        }
                        if let Ok(mut algos) = handles.algorithms.lock() {
                            algos.invalidate();
                        }
                    }
                    Err(e) => warn!(surviving = %surviving, absorbed = %absorbed, error = %e, "sync: capability.merged failed"),
                }
            }
        }
    }
}
