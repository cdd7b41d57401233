//! Learner - closes the loop from outcomes back to weights
//!
//! Listens for decision outcomes and user feedback, completes decisions in the
//! log, and nudges the weight of the rule that produced the decision and of
//! the situation factor that dominated it. Weights only scale scores; safety
//! constraints are applied after scoring and are unaffected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::analyzer::{Factor, FactorWeights};
use crate::bus::{Observation, ObservationKind, Subscription};
use crate::config::LearnerConfig;
use crate::decider::{Decision, DecisionLog};

/// Learned scaling factors for rules and situation factors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnedWeights {
    #[serde(default)]
    pub rule_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub factor_weights: FactorWeights,
    #[serde(default)]
    pub updates: u64,
}

impl LearnedWeights {
    pub fn rule_weight(&self, rule: &str) -> f64 {
        self.rule_weights.get(rule).copied().unwrap_or(1.0)
    }

    pub fn factor_weight(&self, factor: Factor) -> f64 {
        self.factor_weights.get(&factor).copied().unwrap_or(1.0)
    }

    fn adjust(&mut self, decision: &Decision, delta: f64, config: &LearnerConfig) {
        if let Some(rule) = decision.rule() {
            let w = (self.rule_weight(rule) + delta).clamp(config.min_weight, config.max_weight);
            self.rule_weights.insert(rule.to_string(), w);
        }
        if let Some(factor) = decision.top_factor {
            let w = (self.factor_weight(factor) + delta).clamp(config.min_weight, config.max_weight);
            self.factor_weights.insert(factor, w);
        }
        self.updates += 1;
    }
}

pub struct Learner {
    config: LearnerConfig,
    weights: Arc<RwLock<LearnedWeights>>,
    log: Arc<DecisionLog>,
}

impl Learner {
    pub fn new(config: LearnerConfig, log: Arc<DecisionLog>) -> Self {
        Self {
            config,
            weights: Arc::new(RwLock::new(LearnedWeights::default())),
            log,
        }
    }

    /// Current weights; each decision step works on its own copy
    pub async fn weights(&self) -> LearnedWeights {
        self.weights.read().await.clone()
    }

    pub async fn restore(&self, weights: LearnedWeights) {
        *self.weights.write().await = weights;
    }

    /// Process one observation. Returns the decision it touched, if any.
    pub async fn handle(&self, obs: &Observation) -> Option<Decision> {
        match &obs.kind {
            ObservationKind::DecisionOutcome {
                decision_id,
                success,
                detail,
            } => {
                let (decision, first) = self.log.complete(decision_id, *success, detail)?;
                if !first {
                    debug!(decision_id = %decision_id, "Outcome already recorded, weights unchanged");
                    return Some(decision);
                }
                let sign = if *success { 1.0 } else { -1.0 };
                self.learn(&decision, sign).await;
                Some(decision)
            }
            ObservationKind::UserFeedback {
                decision_id: Some(decision_id),
                satisfaction,
                ..
            } => {
                let decision = self.log.get(decision_id)?;
                // Satisfaction 0.5 is neutral
                let signed = 2.0 * satisfaction.clamp(0.0, 1.0) - 1.0;
                self.learn(&decision, signed).await;
                Some(decision)
            }
            _ => None,
        }
    }

    async fn learn(&self, decision: &Decision, signed_magnitude: f64) {
        let delta = self.config.rate * signed_magnitude;
        if delta == 0.0 {
            return;
        }
        let mut weights = self.weights.write().await;
        weights.adjust(decision, delta, &self.config);
        info!(
            decision_id = %decision.id,
            rule = ?decision.rule(),
            factor = ?decision.top_factor,
            delta,
            "Weights adjusted"
        );
    }

    /// Consume outcomes and feedback until shutdown
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                obs = subscription.recv() => match obs {
                    Some(obs) => {
                        self.handle(&obs).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Learner stopped");
    }

    /// Filter for the observations the learner consumes
    pub fn wants(obs: &Observation) -> bool {
        matches!(
            obs.kind,
            ObservationKind::DecisionOutcome { .. } | ObservationKind::UserFeedback { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::{CandidateAction, DecisionStatus, Trigger};
    use crate::models::ScopeId;
    use chrono::Utc;

    fn dispatched(id: &str) -> Decision {
        Decision {
            id: id.into(),
            scope: ScopeId::house(),
            trigger: Trigger::Manual { reason: "test".into() },
            context: String::new(),
            candidates: vec![],
            chosen: Some(CandidateAction {
                rule: "cool".into(),
                source: "rules".into(),
                target: "thermostat".into(),
                changes: Default::default(),
                impact: 1.0,
                relieves: None,
                resource_cost: 1.0,
                order: 0,
            }),
            confidence: 1.0,
            expected_outcome: String::new(),
            reasoning: String::new(),
            status: DecisionStatus::Dispatched,
            outcome: None,
            top_factor: Some(Factor::Comfort),
            created_at: Utc::now(),
        }
    }

    fn outcome(id: &str, success: bool) -> Observation {
        Observation::internal(
            "thermostat",
            ObservationKind::DecisionOutcome {
                decision_id: id.into(),
                success,
                detail: String::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_success_raises_rule_and_factor_weight() {
        let log = Arc::new(DecisionLog::default());
        log.record(dispatched("d1"));
        let learner = Learner::new(LearnerConfig::default(), log.clone());

        let decision = learner.handle(&outcome("d1", true)).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Completed);

        let weights = learner.weights().await;
        assert!(weights.rule_weight("cool") > 1.0);
        assert!(weights.factor_weight(Factor::Comfort) > 1.0);
        assert_eq!(weights.factor_weight(Factor::Novelty), 1.0);
    }

    #[tokio::test]
    async fn test_duplicate_outcome_learns_once() {
        let log = Arc::new(DecisionLog::default());
        log.record(dispatched("d1"));
        let learner = Learner::new(LearnerConfig::default(), log);

        learner.handle(&outcome("d1", true)).await;
        let once = learner.weights().await;
        learner.handle(&outcome("d1", true)).await;
        assert_eq!(learner.weights().await, once);
    }

    #[tokio::test]
    async fn test_weights_stay_within_bounds() {
        let log = Arc::new(DecisionLog::default());
        let config = LearnerConfig {
            rate: 0.5,
            min_weight: 0.2,
            max_weight: 2.0,
        };
        let learner = Learner::new(config, log.clone());

        for i in 0..50 {
            let id = format!("d{}", i);
            log.record(dispatched(&id));
            learner.handle(&outcome(&id, i % 7 != 1)).await;
        }
        let w = learner.weights().await.rule_weight("cool");
        assert!((0.2..=2.0).contains(&w));
        assert_eq!(w, 2.0);

        for i in 50..100 {
            let id = format!("d{}", i);
            log.record(dispatched(&id));
            learner.handle(&outcome(&id, false)).await;
        }
        assert_eq!(learner.weights().await.rule_weight("cool"), 0.2);
    }

    #[tokio::test]
    async fn test_unknown_decision_is_ignored() {
        let learner = Learner::new(LearnerConfig::default(), Arc::new(DecisionLog::default()));
        assert!(learner.handle(&outcome("ghost", true)).await.is_none());
        assert_eq!(learner.weights().await.updates, 0);
    }
}
