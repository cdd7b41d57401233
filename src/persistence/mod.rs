//! Persistence - durable checkpoints of twins, decisions, models and weights
//!
//! The runtime checkpoints periodically and on shutdown, and recovers from the
//! latest checkpoint at startup.

mod memory;
mod sqlite;

pub use memory::MemoryPersistence;
pub use sqlite::SqlitePersistence;

use std::sync::Arc;

use crate::analyzer::SituationalModel;
use crate::config::{Config, PersistenceBackend};
use crate::decider::Decision;
use crate::error::PersistenceError;
use crate::learner::LearnedWeights;
use crate::models::ScopeId;
use crate::twin::DigitalTwin;

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Replace stored twins with this set
    async fn save_twins(&self, twins: &[DigitalTwin]) -> Result<()>;
    async fn load_twins(&self) -> Result<Vec<DigitalTwin>>;

    /// Insert or update decisions
    async fn save_decisions(&self, decisions: &[Decision]) -> Result<()>;
    /// Every stored decision, oldest first
    async fn load_decisions(&self) -> Result<Vec<Decision>>;
    async fn last_decision(&self, scope: &ScopeId) -> Result<Option<Decision>>;

    async fn save_models(&self, models: &[SituationalModel]) -> Result<()>;
    async fn load_models(&self) -> Result<Vec<SituationalModel>>;

    async fn save_weights(&self, weights: &LearnedWeights) -> Result<()>;
    async fn load_weights(&self) -> Result<Option<LearnedWeights>>;
}

/// Open the backend selected in configuration
pub fn open(config: &Config) -> Result<Arc<dyn Persistence>> {
    match config.persistence.backend {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryPersistence::new())),
        PersistenceBackend::Sqlite => Ok(Arc::new(SqlitePersistence::open(config.database_path())?)),
    }
}
