//! In-memory persistence, for tests and ephemeral nodes

use dashmap::DashMap;
use std::sync::RwLock;

use super::{Persistence, Result};
use crate::analyzer::SituationalModel;
use crate::decider::Decision;
use crate::learner::LearnedWeights;
use crate::models::{DecisionId, ScopeId, TwinId};
use crate::twin::DigitalTwin;

#[derive(Default)]
pub struct MemoryPersistence {
    twins: DashMap<TwinId, DigitalTwin>,
    decisions: DashMap<DecisionId, Decision>,
    models: DashMap<ScopeId, SituationalModel>,
    weights: RwLock<Option<LearnedWeights>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn save_twins(&self, twins: &[DigitalTwin]) -> Result<()> {
        self.twins.clear();
        for twin in twins {
            self.twins.insert(twin.id.clone(), twin.clone());
        }
        Ok(())
    }

    async fn load_twins(&self) -> Result<Vec<DigitalTwin>> {
        let mut twins: Vec<DigitalTwin> = self.twins.iter().map(|e| e.value().clone()).collect();
        twins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(twins)
    }

    async fn save_decisions(&self, decisions: &[Decision]) -> Result<()> {
        for decision in decisions {
            self.decisions.insert(decision.id.clone(), decision.clone());
        }
        Ok(())
    }

    async fn load_decisions(&self) -> Result<Vec<Decision>> {
        let mut decisions: Vec<Decision> = self.decisions.iter().map(|e| e.value().clone()).collect();
        decisions.sort_by_key(|d| d.created_at);
        Ok(decisions)
    }

    async fn last_decision(&self, scope: &ScopeId) -> Result<Option<Decision>> {
        Ok(self
            .decisions
            .iter()
            .filter(|e| &e.value().scope == scope)
            .max_by_key(|e| e.value().created_at)
            .map(|e| e.value().clone()))
    }

    async fn save_models(&self, models: &[SituationalModel]) -> Result<()> {
        for model in models {
            self.models.insert(model.scope.clone(), model.clone());
        }
        Ok(())
    }

    async fn load_models(&self) -> Result<Vec<SituationalModel>> {
        Ok(self.models.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_weights(&self, weights: &LearnedWeights) -> Result<()> {
        *self.weights.write().unwrap_or_else(|e| e.into_inner()) = Some(weights.clone());
        Ok(())
    }

    async fn load_weights(&self) -> Result<Option<LearnedWeights>> {
        Ok(self.weights.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
