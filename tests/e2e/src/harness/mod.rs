//! Test harness: isolated [`gateway_core::Engine`] instances.

mod engine_manager;

pub use engine_manager::TestEngineManager;
