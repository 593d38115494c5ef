//! Shared test support for the gateway-core black-box suite: an isolated
//! [`Engine`] manager and fixture factories, in the spirit of the teacher's
//! own `TestDatabaseManager`/`TestDataFactory` split.

pub mod harness;
pub mod mocks;

pub use harness::TestEngineManager;
pub use mocks::fixtures::{unit_embedding, StubEmbeddingModel, TestDataFactory};
