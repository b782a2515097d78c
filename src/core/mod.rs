pub mod engine;
pub mod memory;
pub mod rest;
pub mod types;

// exports for the reconciler and friends
pub use engine::EngineApi;
pub use memory::{MemoryEngine, Mutation};
pub use rest::RestEngine;
pub use types::{AffinityLabel, Entity, EntityKind, Link, ObjectRef, SearchQuery};
