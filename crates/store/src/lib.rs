//! Storage backends for the orchestrator's persistence capability.

pub mod memory;

pub use memory::InMemoryStore;
