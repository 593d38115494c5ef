//! Crate-wide error type.
//!
//! Component-local error enums (e.g. [`crate::embedding::index::VectorSearchError`],
//! [`crate::graph::store::GraphStoreError`]) cover narrow, recoverable failure
//! modes the way `vestige-core`'s `VectorSearchError` and
//! `HippocampalIndexError` do. [`GatewayError`] is the boundary type returned
//! from the public API (the Ranking API, the Training API, the event sink)
//! and carries the error kinds named in spec §7.

use thiserror::Error;

/// Top-level error type for the gateway engine.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An embedding (query, tool, or capability) did not match the
    /// engine's configured `embeddingDim`.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// A reference was made to a tool or capability id that does not exist.
    #[error("unknown id: {0}")]
    UnknownId(String),

    /// I1/I2/I3/I4/I5 violated.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A `contains` edge would create a cycle among capabilities (I2).
    #[error("cycle detected through capability {0}")]
    CycleDetected(String),

    /// The persisted relational mirror is unavailable (after retry budget
    /// exhausted); the engine degrades to in-memory-only mode.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// NaN/Inf encountered during a SHGAT forward or backward pass.
    #[error("training diverged: {0}")]
    TrainingDiverged(String),

    /// A scoring request's deadline elapsed before a full ranking could be
    /// produced.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The PER buffer or another bounded resource is exhausted.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// `rank()` was called with `Intent::Text` but no `EmbeddingModel` was
    /// supplied to encode it.
    #[error("text intent given without an embedding model")]
    MissingEmbeddingModel,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::graph::GraphStoreError> for GatewayError {
    fn from(err: crate::graph::GraphStoreError) -> Self {
        use crate::graph::GraphStoreError as E;
        match err {
            E::UnknownMember(id) | E::UnknownTool(id) | E::UnknownCapability(id) => GatewayError::UnknownId(id),
            E::CycleDetected(id) => GatewayError::CycleDetected(id),
            E::DimensionMismatch { expected, got } => GatewayError::DimensionMismatch { expected, got },
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
