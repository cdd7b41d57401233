//! Analyzer - turns observations into per-scope situational models
//!
//! - `stats`: rolling windows and z-scores
//! - `emotion`: the emotional vector and factor contributions
//! - `situation`: the per-scope model and its read-only snapshot

pub mod emotion;
pub mod situation;
pub mod stats;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

pub use emotion::{Dimension, EmotionalState, Factor, FactorContribution, FactorWeights};
pub use situation::{AnomalyFlag, SituationSnapshot, SituationalModel};

use crate::bus::{Observation, ObservationKind};
use crate::config::AnalyzerConfig;
use crate::models::ScopeId;

/// Owner of every scope's situational model
pub struct Analyzer {
    config: AnalyzerConfig,
    models: DashMap<ScopeId, SituationalModel>,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            models: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Whether an observation can move a situational model.
    ///
    /// The core's own bookkeeping (twin mutations, situation updates, decision
    /// records) never feeds back into analysis.
    pub fn is_relevant(obs: &Observation) -> bool {
        !matches!(
            obs.kind,
            ObservationKind::TwinChanged { .. }
                | ObservationKind::SituationUpdated { .. }
                | ObservationKind::DecisionRecorded { .. }
        )
    }

    /// Advance the scope's model. `None` for observations the analyzer ignores.
    pub fn observe(
        &self,
        scope: &ScopeId,
        obs: &Observation,
        weights: &FactorWeights,
    ) -> Option<SituationSnapshot> {
        if !Self::is_relevant(obs) {
            return None;
        }
        let mut model = self
            .models
            .entry(scope.clone())
            .or_insert_with(|| SituationalModel::new(scope.clone(), &self.config, obs.timestamp));
        Some(model.observe(obs, &self.config, weights))
    }

    /// Snapshot for an explicit trigger, creating the model if needed
    pub fn touch(&self, scope: &ScopeId, reason: &str) -> SituationSnapshot {
        let now = Utc::now();
        let mut model = self
            .models
            .entry(scope.clone())
            .or_insert_with(|| SituationalModel::new(scope.clone(), &self.config, now));
        model.touch(reason, now, &self.config)
    }

    /// Idle decay of one scope
    pub fn decay(&self, scope: &ScopeId, now: DateTime<Utc>) {
        if let Some(mut model) = self.models.get_mut(scope) {
            model.decay_to(now, &self.config);
            debug!(scope = %scope, intensity = model.emotion().intensity, "Situation decayed");
        }
    }

    pub fn snapshot(&self, scope: &ScopeId) -> Option<SituationSnapshot> {
        self.models.get(scope).map(|m| m.snapshot(Utc::now()))
    }

    pub fn emotional_state(&self, scope: &ScopeId) -> Option<EmotionalState> {
        self.models.get(scope).map(|m| m.emotion().clone())
    }

    pub fn scopes(&self) -> Vec<ScopeId> {
        let mut scopes: Vec<ScopeId> = self.models.iter().map(|e| e.key().clone()).collect();
        scopes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        scopes
    }

    /// Clone every model, for checkpointing
    pub fn models(&self) -> Vec<SituationalModel> {
        self.models.iter().map(|e| e.value().clone()).collect()
    }

    /// Reinstate a model loaded from persistence
    pub fn restore(&self, model: SituationalModel) {
        self.models.insert(model.scope.clone(), model);
    }
}
