//! Component B/C: the tool graph, the capability superhypergraph, and the
//! structural algorithms that run over them.

pub mod algorithms;
pub mod model;
pub mod store;

pub use algorithms::AlgorithmsCache;
pub use model::{
    Capability, CapabilityContent, CapabilityFeatures, Edge, EdgeSource, EdgeType, ErrorKind, NodeKind, Tool,
    ToolFeatures,
};
pub use store::{short_hash, GraphSnapshot, GraphStore, GraphStoreError};
