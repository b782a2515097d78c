pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod module;
pub mod reconciler;

// Re-exports
pub use crate::core::{EngineApi, MemoryEngine, RestEngine};
pub use crate::errors::{EngineError, LabelError};
pub use crate::module::{ModuleParams, ModuleResult, State};
pub use crate::reconciler::{Outcome, Reconciler};
pub type AsyncMutex<T> = tokio::sync::Mutex<T>;
