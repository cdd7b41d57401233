//! Digital twins - virtual records of physical devices
//!
//! - `models`: the twin record, pending changes, conflict records
//! - `store`: the authoritative per-twin-serialized registry
//! - `divergence`: the desired-vs-confirmed distance metric

pub mod divergence;
pub mod models;
pub mod store;

pub use models::{ConflictRecord, Connectivity, DigitalTwin, FidelityLevel, PendingChange};
pub use store::TwinStore;

/// Errors raised by twin store operations
#[derive(Debug, thiserror::Error)]
pub enum TwinError {
    #[error("twin not found: {0}")]
    NotFound(String),

    /// Data corruption or a broken invariant. Fatal for that twin only.
    #[error("twin invariant violated: {0}")]
    InvariantViolation(String),
}
