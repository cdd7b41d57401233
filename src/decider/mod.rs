//! Decider - candidate generation, scoring, safety filtering and selection
//!
//! - `rules`: conditions, action templates and the rule-set candidate source
//! - `constraints`: safety constraints and their shared registry
//! - `models`: decisions, candidates and outcomes
//! - `log`: the decision log
//!
//! The decider never touches a device: chosen actions are dispatched through
//! the sync engine by the runtime.

pub mod constraints;
pub mod log;
pub mod models;
pub mod rules;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub use constraints::{ConstraintPredicate, ConstraintRegistry, SafetyConstraint};
pub use log::DecisionLog;
pub use models::{CandidateAction, Decision, DecisionOutcome, DecisionStatus, ScoredCandidate, Trigger};
pub use rules::{ActionTemplate, CandidateContext, CandidateSource, Condition, Rule, RuleSet};

use crate::analyzer::SituationSnapshot;
use crate::learner::LearnedWeights;
use crate::models::{ScopeId, TwinId};
use crate::twin::{DigitalTwin, FidelityLevel, TwinStore};

/// Predicts how much better or worse an action leaves a modeled twin.
/// The returned value is added to the candidate's score.
pub trait ForwardModel: Send + Sync {
    fn adjustment(&self, twin: &DigitalTwin, action: &CandidateAction, snapshot: &SituationSnapshot) -> f64;
}

/// Forward model for a numeric attribute with a set point: rewards actions
/// that move the attribute toward `target`
pub struct SetPointModel {
    pub attribute: String,
    pub target: f64,
    /// Distance treated as one unit of improvement
    pub scale: f64,
    pub gain: f64,
}

impl ForwardModel for SetPointModel {
    fn adjustment(&self, twin: &DigitalTwin, action: &CandidateAction, _snapshot: &SituationSnapshot) -> f64 {
        let Some(next) = action.changes.get(&self.attribute).and_then(|v| v.as_f64()) else {
            return 0.0;
        };
        let Some(current) = twin.projected_value(&self.attribute).and_then(|v| v.as_f64()) else {
            return 0.0;
        };
        let scale = self.scale.max(f64::EPSILON);
        let improvement = ((current - self.target).abs() - (next - self.target).abs()) / scale;
        self.gain * improvement.clamp(-1.0, 1.0)
    }
}

pub struct Decider {
    sources: RwLock<Vec<Arc<dyn CandidateSource>>>,
    constraints: Arc<ConstraintRegistry>,
    forward_models: DashMap<TwinId, Arc<dyn ForwardModel>>,
    store: Arc<TwinStore>,
}

impl Decider {
    pub fn new(store: Arc<TwinStore>, constraints: Arc<ConstraintRegistry>) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            constraints,
            forward_models: DashMap::new(),
            store,
        }
    }

    pub fn register_source(&self, source: Arc<dyn CandidateSource>) {
        info!(source = source.name(), "Candidate source registered");
        self.sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(source);
    }

    pub fn register_forward_model(&self, twin_id: &str, model: Arc<dyn ForwardModel>) {
        self.forward_models.insert(twin_id.to_string(), model);
    }

    pub fn constraints(&self) -> &Arc<ConstraintRegistry> {
        &self.constraints
    }

    fn sources(&self) -> Vec<Arc<dyn CandidateSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run one decision cycle for a scope.
    ///
    /// Returns `None` when nothing was proposed and the trigger wasn't an
    /// explicit request. A decision with no admissible candidate comes back
    /// as `NoAction`.
    pub async fn decide(
        &self,
        scope: &ScopeId,
        snapshot: &SituationSnapshot,
        trigger: Trigger,
        weights: &LearnedWeights,
    ) -> Option<Decision> {
        let now = Utc::now();
        let ctx = CandidateContext { scope, snapshot, now };

        // Generate, skipping candidates that wouldn't change anything
        let mut generated: Vec<(Arc<dyn CandidateSource>, CandidateAction)> = Vec::new();
        for source in self.sources() {
            for action in source.candidates(&ctx) {
                generated.push((Arc::clone(&source), action));
            }
        }

        let mut scored = Vec::new();
        let mut owners = Vec::new();
        for (source, mut action) in generated {
            let twin = match self.store.get(&action.target).await {
                Ok(twin) => twin,
                Err(_) => {
                    debug!(rule = %action.rule, target = %action.target, "Candidate targets unknown twin");
                    continue;
                }
            };
            if is_noop(&twin, &action) {
                debug!(rule = %action.rule, target = %action.target, "Candidate is a no-op");
                continue;
            }
            action.order = scored.len();

            let score = self.score(&twin, &action, snapshot, weights);
            let rejected_by = self.constraints.violations(&action, snapshot);
            if !rejected_by.is_empty() {
                info!(
                    scope = %scope,
                    rule = %action.rule,
                    constraints = ?rejected_by,
                    "Candidate rejected by safety constraints"
                );
            }
            scored.push(ScoredCandidate {
                action,
                score,
                rejected_by,
            });
            owners.push(source);
        }

        if scored.is_empty() && !trigger.is_manual() {
            return None;
        }

        let selection = select(&scored);
        let (chosen, confidence, status) = match selection {
            Some((best, confidence)) => {
                let action = scored[best].action.clone();
                owners[best].chosen(scope, &action, now);
                (Some(action), confidence, DecisionStatus::Dispatched)
            }
            None => (None, 0.0, DecisionStatus::NoAction),
        };

        let reasoning = reasoning(&scored, chosen.as_ref(), snapshot);
        let expected_outcome = match &chosen {
            Some(action) => format!("{} set", action.describe()),
            None => "no change".to_string(),
        };

        let mut candidates = scored;
        candidates.sort_by(rank);

        let decision = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            scope: scope.clone(),
            trigger,
            context: snapshot.summary(),
            candidates,
            chosen,
            confidence,
            expected_outcome,
            reasoning,
            status,
            outcome: None,
            top_factor: snapshot.top_factor(),
            created_at: now,
        };

        match &decision.chosen {
            Some(action) => info!(
                decision_id = %decision.id,
                scope = %scope,
                rule = %action.rule,
                confidence = decision.confidence,
                "Decision made"
            ),
            None => info!(
                decision_id = %decision.id,
                scope = %scope,
                reasoning = %decision.reasoning,
                "No admissible action"
            ),
        }
        Some(decision)
    }

    fn score(
        &self,
        twin: &DigitalTwin,
        action: &CandidateAction,
        snapshot: &SituationSnapshot,
        weights: &LearnedWeights,
    ) -> f64 {
        let relief = action
            .relieves
            .map(|d| snapshot.emotion.get(d))
            .unwrap_or(0.0);
        let base = weights.rule_weight(&action.rule) * (action.impact + relief);

        let forward = if twin.fidelity == FidelityLevel::Basic {
            0.0
        } else {
            self.forward_models
                .get(&twin.id)
                .map(|m| m.adjustment(twin, action, snapshot))
                .unwrap_or(0.0)
        };
        base + forward
    }
}

/// Every change matches where the device already is, or is already headed
fn is_noop(twin: &DigitalTwin, action: &CandidateAction) -> bool {
    action
        .changes
        .iter()
        .all(|(attr, value)| twin.projected_value(attr) == Some(value))
}

/// Best first: score, then lower resource cost, then generation order
fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(
            a.action
                .resource_cost
                .partial_cmp(&b.action.resource_cost)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
        .then(a.action.order.cmp(&b.action.order))
}

/// Index of the winning admissible candidate and the decision confidence
fn select(scored: &[ScoredCandidate]) -> Option<(usize, f64)> {
    let mut admissible: Vec<(usize, &ScoredCandidate)> =
        scored.iter().enumerate().filter(|(_, c)| c.is_admissible()).collect();
    admissible.sort_by(|a, b| rank(a.1, b.1));

    let (best_idx, best) = *admissible.first()?;
    let confidence = match admissible.get(1) {
        None => 1.0,
        Some((_, runner_up)) => {
            let total = best.score + runner_up.score;
            if total > 0.0 {
                (best.score / total).clamp(0.0, 1.0)
            } else {
                0.5
            }
        }
    };
    Some((best_idx, confidence))
}

fn reasoning(scored: &[ScoredCandidate], chosen: Option<&CandidateAction>, snapshot: &SituationSnapshot) -> String {
    if let Some(action) = chosen {
        let alternatives = scored.len().saturating_sub(1);
        return format!(
            "rule {} chosen over {} alternative(s); {}",
            action.rule, alternatives, snapshot.emotion.reasoning
        );
    }
    if scored.is_empty() {
        return "no candidate actions".to_string();
    }

    let mut blocking: Vec<&str> = scored
        .iter()
        .flat_map(|c| c.rejected_by.iter().map(String::as_str))
        .collect();
    blocking.sort_unstable();
    blocking.dedup();
    format!(
        "all {} candidate(s) blocked by constraints: {}",
        scored.len(),
        blocking.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SituationalModel;
    use crate::bus::ObservationBus;
    use crate::config::AnalyzerConfig;
    use crate::models::{AttrValue, Severity};
    use std::collections::BTreeMap;

    fn candidate(rule: &str, score: f64, cost: f64, order: usize, rejected: bool) -> ScoredCandidate {
        ScoredCandidate {
            action: CandidateAction {
                rule: rule.into(),
                source: "test".into(),
                target: "t".into(),
                changes: BTreeMap::new(),
                impact: 0.0,
                relieves: None,
                resource_cost: cost,
                order,
            },
            score,
            rejected_by: if rejected { vec!["c1".into()] } else { vec![] },
        }
    }

    #[test]
    fn test_select_prefers_score_then_cost_then_order() {
        let scored = vec![
            candidate("a", 1.0, 2.0, 0, false),
            candidate("b", 1.0, 1.0, 1, false),
            candidate("c", 1.0, 1.0, 2, false),
            candidate("d", 5.0, 1.0, 3, true),
        ];
        let (best, confidence) = select(&scored).unwrap();
        assert_eq!(scored[best].action.rule, "b");
        assert_eq!(confidence, 0.5);
    }

    #[test]
    fn test_select_single_survivor_is_certain() {
        let scored = vec![candidate("a", 0.3, 1.0, 0, false), candidate("b", 9.0, 1.0, 1, true)];
        assert_eq!(select(&scored), Some((0, 1.0)));
    }

    #[test]
    fn test_select_nothing_admissible() {
        let scored = vec![candidate("a", 1.0, 1.0, 0, true)];
        assert!(select(&scored).is_none());
        assert!(reasoning(&scored, None, &snapshot()).contains("c1"));
    }

    fn snapshot() -> SituationSnapshot {
        SituationalModel::new(ScopeId::house(), &AnalyzerConfig::default(), Utc::now())
            .snapshot(Utc::now())
    }

    fn rule(name: &str, temp: f64, impact: f64) -> Rule {
        Rule {
            name: name.into(),
            description: String::new(),
            scope: None,
            condition: Condition::Always,
            action: ActionTemplate {
                target: "thermostat".into(),
                set: [("temp".to_string(), AttrValue::Number(temp))].into(),
                impact,
                relieves: None,
                resource_cost: 1.0,
            },
            priority: 0,
            cooldown_secs: None,
            enabled: true,
        }
    }

    async fn decider(rules: Vec<Rule>, constraints: Vec<SafetyConstraint>) -> Decider {
        let store = Arc::new(TwinStore::new(ObservationBus::new(64)));
        store
            .upsert(DigitalTwin::new("thermostat", "dev-1").with_state("temp", 72.0))
            .await;
        let decider = Decider::new(store, Arc::new(ConstraintRegistry::new(constraints)));
        decider.register_source(Arc::new(RuleSet::new(rules, 300)));
        decider
    }

    #[tokio::test]
    async fn test_constraint_blocks_higher_scoring_candidate() {
        let decider = decider(
            vec![rule("hot", 85.0, 2.0), rule("mild", 70.0, 1.0)],
            vec![SafetyConstraint {
                id: "max-temp".into(),
                description: String::new(),
                severity: Severity::Critical,
                enabled: true,
                predicate: ConstraintPredicate::MaxValue {
                    attribute: "temp".into(),
                    value: 78.0,
                    twin: None,
                },
            }],
        )
        .await;

        let decision = decider
            .decide(
                &ScopeId::house(),
                &snapshot(),
                Trigger::Manual { reason: "test".into() },
                &LearnedWeights::default(),
            )
            .await
            .unwrap();

        assert_eq!(decision.status, DecisionStatus::Dispatched);
        assert_eq!(decision.chosen.unwrap().rule, "mild");
        assert_eq!(decision.candidates.len(), 2);
        assert_eq!(decision.candidates[0].rejected_by, vec!["max-temp".to_string()]);
    }

    #[tokio::test]
    async fn test_noop_candidates_are_skipped() {
        let decider = decider(vec![rule("same", 72.0, 1.0)], vec![]).await;
        let trigger = Trigger::Observation {
            observation_id: "o1".into(),
            kind: "reading".into(),
            subject: "thermostat".into(),
        };
        let decision = decider
            .decide(&ScopeId::house(), &snapshot(), trigger, &LearnedWeights::default())
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_stale_intent_does_not_hide_a_needed_change() {
        let store = Arc::new(TwinStore::new(ObservationBus::new(64)));
        let mut twin = DigitalTwin::new("thermostat", "dev-1").with_state("temp", 72.0);
        // Intent left over from a change the device never took
        twin.desired_state.insert("temp".into(), AttrValue::Number(70.0));
        store.upsert(twin).await;
        let decider = Decider::new(Arc::clone(&store), Arc::new(ConstraintRegistry::new(vec![])));
        decider.register_source(Arc::new(RuleSet::new(vec![rule("retry", 70.0, 1.0)], 300)));

        let decision = decider
            .decide(
                &ScopeId::house(),
                &snapshot(),
                Trigger::Manual { reason: "test".into() },
                &LearnedWeights::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.status, DecisionStatus::Dispatched);
        assert_eq!(decision.chosen.unwrap().rule, "retry");
    }

    #[tokio::test]
    async fn test_in_flight_change_is_a_noop() {
        let store = Arc::new(TwinStore::new(ObservationBus::new(64)));
        store
            .upsert(DigitalTwin::new("thermostat", "dev-1").with_state("temp", 72.0))
            .await;
        store
            .append_pending_change("thermostat", "temp", AttrValue::Number(70.0), None)
            .await
            .unwrap();
        let decider = Decider::new(Arc::clone(&store), Arc::new(ConstraintRegistry::new(vec![])));
        decider.register_source(Arc::new(RuleSet::new(vec![rule("again", 70.0, 1.0)], 300)));

        let trigger = Trigger::Observation {
            observation_id: "o1".into(),
            kind: "reading".into(),
            subject: "thermostat".into(),
        };
        let decision = decider
            .decide(&ScopeId::house(), &snapshot(), trigger, &LearnedWeights::default())
            .await;
        assert!(decision.is_none());
    }

    #[tokio::test]
    async fn test_all_blocked_is_no_action() {
        let decider = decider(
            vec![rule("hot", 85.0, 2.0)],
            vec![SafetyConstraint {
                id: "deny-thermostat".into(),
                description: String::new(),
                severity: Severity::Critical,
                enabled: true,
                predicate: ConstraintPredicate::DenyTwin {
                    twin: "thermostat".into(),
                },
            }],
        )
        .await;

        let decision = decider
            .decide(
                &ScopeId::house(),
                &snapshot(),
                Trigger::Manual { reason: "test".into() },
                &LearnedWeights::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.status, DecisionStatus::NoAction);
        assert!(decision.chosen.is_none());
        assert!(decision.reasoning.contains("deny-thermostat"));
    }

    #[tokio::test]
    async fn test_forward_model_applies_to_modeled_twins_only() {
        let store = Arc::new(TwinStore::new(ObservationBus::new(64)));
        store
            .upsert(
                DigitalTwin::new("thermostat", "dev-1")
                    .with_state("temp", 80.0)
                    .with_fidelity(FidelityLevel::Modeled),
            )
            .await;
        let decider = Decider::new(store, Arc::new(ConstraintRegistry::default()));
        decider.register_source(Arc::new(RuleSet::new(
            vec![rule("toward", 70.0, 1.0), rule("away", 90.0, 1.0)],
            300,
        )));
        decider.register_forward_model(
            "thermostat",
            Arc::new(SetPointModel {
                attribute: "temp".into(),
                target: 70.0,
                scale: 10.0,
                gain: 0.5,
            }),
        );

        let decision = decider
            .decide(
                &ScopeId::house(),
                &snapshot(),
                Trigger::Manual { reason: "test".into() },
                &LearnedWeights::default(),
            )
            .await
            .unwrap();
        assert_eq!(decision.chosen.unwrap().rule, "toward");
        assert_eq!(decision.candidates[0].score, 1.5);
        assert_eq!(decision.candidates[1].score, 0.5);
    }
}
