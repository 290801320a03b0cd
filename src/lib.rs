//! Steward - agent execution and context retrieval
//!
//! The core of a personal work assistant: one tool-calling agent shared by
//! interactive chat and headless generation of recurring deliverables,
//! read-through access to connected platforms, scoped memory retrieval and
//! the triage that decides when a deliverable needs a new version.

pub mod agent;
pub mod embedding;
pub mod error;
pub mod orchestration;
pub mod platform;
pub mod primitives;
pub mod reconcile;
pub mod retrieval;
pub mod scheduler;
pub mod storage;
pub mod sync;
pub mod triage;
pub mod types;

pub use error::{Result, StewardError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
