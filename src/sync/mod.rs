//! Twin/device synchronization
//!
//! - `engine`: one reconciliation cycle, the conflict rule, `submit_desired`
//! - `scheduler`: per-twin sync tasks with jitter and early wake-up

pub mod engine;
pub mod scheduler;

pub use engine::{FailedChange, SyncEngine, SyncEngineConfig, SyncReport};
pub use scheduler::SyncScheduler;
