//! Component D: the append-only trace log and the feature builder that
//! turns it into the 17-scalar [`features::TraceStats`] the scorer consumes.

pub mod features;
pub mod store;

pub use features::{TraceFeatureBuilder, TraceStats};
pub use store::{TraceRecord, TraceStore};
