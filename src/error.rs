//! Error types shared across the runtime

use thiserror::Error;

pub use crate::adapter::AdapterError;
pub use crate::twin::TwinError;

/// Result alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::Storage(e.to_string())
    }
}

/// Top-level error
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Twin(#[from] TwinError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("decision not found: {0}")]
    DecisionNotFound(String),

    #[error("runtime is shut down")]
    ShutDown,
}
