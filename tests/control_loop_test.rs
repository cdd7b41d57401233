//! Analyze, decide and learn: properties and an end-to-end run

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use safla_node::analyzer::{Analyzer, Dimension, Factor};
use safla_node::bus::{Observation, ObservationBus, ObservationKind, ObservationSource};
use safla_node::config::{AnalyzerConfig, Config, LearnerConfig};
use safla_node::decider::{
    ActionTemplate, CandidateAction, Condition, ConstraintPredicate, ConstraintRegistry, Decider,
    Decision, DecisionLog, DecisionStatus, Rule, RuleSet, SafetyConstraint, Trigger,
};
use safla_node::learner::{LearnedWeights, Learner};
use safla_node::models::Severity;
use safla_node::persistence::MemoryPersistence;
use safla_node::twin::{Connectivity, DigitalTwin, TwinStore};
use safla_node::{AttrValue, Runtime, RuntimeError, ScopeId, SimulatedAdapter};
use tokio_test::{assert_err, assert_ok};

const TWINS: [&str; 3] = ["heater", "fan", "lamp"];

fn random_rule(rng: &mut StdRng, i: usize) -> Rule {
    let target = TWINS[rng.gen_range(0..TWINS.len())];
    let mut set = BTreeMap::new();
    set.insert("level".to_string(), AttrValue::Number(rng.gen_range(0..=100) as f64));
    if rng.gen_bool(0.3) {
        set.insert("on".to_string(), AttrValue::Bool(rng.gen_bool(0.5)));
    }
    Rule {
        name: format!("rule-{}", i),
        description: String::new(),
        scope: None,
        condition: Condition::Always,
        action: ActionTemplate {
            target: target.to_string(),
            set,
            impact: rng.gen_range(-1.0..2.0),
            relieves: None,
            resource_cost: rng.gen_range(0.5..2.0),
        },
        priority: rng.gen_range(0..10),
        cooldown_secs: None,
        enabled: true,
    }
}

fn random_constraint(rng: &mut StdRng, i: usize) -> SafetyConstraint {
    let twin = if rng.gen_bool(0.5) {
        Some(TWINS[rng.gen_range(0..TWINS.len())].to_string())
    } else {
        None
    };
    let predicate = match rng.gen_range(0..4) {
        0 => ConstraintPredicate::MaxValue {
            attribute: "level".into(),
            value: rng.gen_range(0..=100) as f64,
            twin,
        },
        1 => ConstraintPredicate::MinValue {
            attribute: "level".into(),
            value: rng.gen_range(0..=100) as f64,
            twin,
        },
        2 => ConstraintPredicate::ForbidValue {
            attribute: "on".into(),
            value: AttrValue::Bool(true),
            twin,
        },
        _ => ConstraintPredicate::DenyTwin {
            twin: TWINS[rng.gen_range(0..TWINS.len())].to_string(),
        },
    };
    SafetyConstraint {
        id: format!("constraint-{}", i),
        description: String::new(),
        severity: Severity::Critical,
        enabled: true,
        predicate,
    }
}

#[tokio::test]
async fn test_no_decision_selects_a_violating_candidate() {
    let mut rng = StdRng::seed_from_u64(0x5AF1A);
    let scope = ScopeId::house();

    for round in 0..200 {
        let store = Arc::new(TwinStore::new(ObservationBus::new(16)));
        for twin in TWINS {
            store
                .upsert(DigitalTwin::new(twin, format!("dev-{}", twin)).with_state("level", 50.0))
                .await;
        }

        let constraints: Vec<SafetyConstraint> =
            (0..rng.gen_range(0..5)).map(|i| random_constraint(&mut rng, i)).collect();
        let registry = Arc::new(ConstraintRegistry::new(constraints));
        let decider = Decider::new(store, registry.clone());
        let rules: Vec<Rule> = (0..rng.gen_range(1..8)).map(|i| random_rule(&mut rng, i)).collect();
        decider.register_source(Arc::new(RuleSet::new(rules, 0)));

        // Learned weights may favor anything; constraints still apply
        let mut weights = LearnedWeights::default();
        for i in 0..8 {
            weights
                .rule_weights
                .insert(format!("rule-{}", i), rng.gen_range(0.1..3.0));
        }

        let analyzer = Analyzer::new(AnalyzerConfig::default());
        let snapshot = analyzer.touch(&scope, "property");
        let decision = decider
            .decide(
                &scope,
                &snapshot,
                Trigger::Manual {
                    reason: "property".into(),
                },
                &weights,
            )
            .await
            .expect("manual triggers always produce a decision");

        if let Some(chosen) = &decision.chosen {
            assert!(
                registry.violations(chosen, &snapshot).is_empty(),
                "round {}: chose violating {:?}",
                round,
                chosen
            );
        }
        let any_admissible = decision.candidates.iter().any(|c| c.is_admissible());
        assert_eq!(decision.chosen.is_some(), any_admissible, "round {}", round);
        for candidate in &decision.candidates {
            let violations = registry.violations(&candidate.action, &snapshot);
            assert_eq!(candidate.rejected_by, violations, "round {}", round);
        }
    }
}

fn random_observation(rng: &mut StdRng) -> Observation {
    let twin = TWINS[rng.gen_range(0..TWINS.len())];
    match rng.gen_range(0..6) {
        0 | 1 => {
            // Mostly steady with the occasional spike
            let value: f64 = if rng.gen_bool(0.1) {
                rng.gen_range(200.0..500.0)
            } else {
                rng.gen_range(68.0..72.0)
            };
            Observation::reading(twin, "temp", value, ObservationSource::Sensor)
        }
        2 => Observation::internal(
            twin,
            ObservationKind::ConnectivityChanged {
                previous: Connectivity::Online,
                current: if rng.gen_bool(0.5) {
                    Connectivity::Offline
                } else {
                    Connectivity::Online
                },
            },
        ),
        3 => Observation::internal(
            twin,
            ObservationKind::DivergenceAlert {
                score: rng.gen_range(0.1..1.0),
                threshold: 0.1,
            },
        ),
        4 => Observation::internal(
            twin,
            ObservationKind::DecisionOutcome {
                decision_id: "d".into(),
                success: rng.gen_bool(0.5),
                detail: String::new(),
            },
        ),
        _ => Observation::new(
            "house",
            ObservationSource::User,
            ObservationKind::UserFeedback {
                decision_id: None,
                satisfaction: rng.gen_range(0.0..=1.0),
                comment: None,
            },
        ),
    }
}

#[test]
fn test_emotions_stay_bounded_and_decay_to_baseline() {
    let mut rng = StdRng::seed_from_u64(7);
    let config = AnalyzerConfig {
        step_gain: 0.4,
        ..Default::default()
    };
    let baseline = config.baseline;
    let analyzer = Analyzer::new(config);
    let scope = ScopeId::house();

    let mut weights = BTreeMap::new();
    for factor in Factor::ALL {
        weights.insert(factor, rng.gen_range(0.1..3.0));
    }

    for _ in 0..500 {
        let snapshot = analyzer
            .observe(&scope, &random_observation(&mut rng), &weights)
            .expect("relevant observation");
        for dimension in Dimension::ALL {
            let v = snapshot.emotion.get(dimension);
            assert!((0.0..=1.0).contains(&v), "{} = {}", dimension, v);
        }
        assert!((0.0..=1.0).contains(&snapshot.emotion.intensity));
    }

    let distance = |analyzer: &Analyzer| -> f64 {
        let state = analyzer.emotional_state(&scope).unwrap();
        Dimension::ALL
            .iter()
            .map(|d| (state.get(*d) - baseline).abs())
            .sum()
    };

    let mut now = analyzer.emotional_state(&scope).unwrap().updated_at;
    let mut previous = distance(&analyzer);
    for _ in 0..10 {
        now += chrono::Duration::seconds(30);
        analyzer.decay(&scope, now);
        let current = distance(&analyzer);
        assert!(current < previous || previous == 0.0, "{} -> {}", previous, current);
        previous = current;
    }
}

fn dispatched(id: &str, rule: &str) -> Decision {
    Decision {
        id: id.into(),
        scope: ScopeId::house(),
        trigger: Trigger::Manual { reason: "test".into() },
        context: String::new(),
        candidates: vec![],
        chosen: Some(CandidateAction {
            rule: rule.into(),
            source: "rules".into(),
            target: "heater".into(),
            changes: BTreeMap::new(),
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
        top_factor: Some(Factor::SystemHealth),
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_learned_weights_stay_within_bounds() {
    let mut rng = StdRng::seed_from_u64(42);
    let config = LearnerConfig {
        rate: 0.3,
        min_weight: 0.25,
        max_weight: 2.5,
    };
    let log = Arc::new(DecisionLog::default());
    let learner = Learner::new(config, log.clone());

    for i in 0..300 {
        let id = format!("d{}", i);
        let rule = ["warm", "cool"][rng.gen_range(0..2)];
        log.record(dispatched(&id, rule));

        let obs = if rng.gen_bool(0.5) {
            Observation::internal(
                "heater",
                ObservationKind::DecisionOutcome {
                    decision_id: id.clone(),
                    success: rng.gen_bool(0.5),
                    detail: String::new(),
                },
            )
        } else {
            Observation::new(
                "house",
                ObservationSource::User,
                ObservationKind::UserFeedback {
                    decision_id: Some(id.clone()),
                    satisfaction: rng.gen_range(0.0..=1.0),
                    comment: None,
                },
            )
        };
        learner.handle(&obs).await;

        let weights = learner.weights().await;
        for w in weights.rule_weights.values().chain(weights.factor_weights.values()) {
            assert!((0.25..=2.5).contains(w), "weight {} out of bounds", w);
        }
    }
}

//=============================================================================
// END TO END
//=============================================================================

const NODE_CONFIG: &str = r#"
[node]
id = "test-node"

[sync]
default_interval_ms = 50
jitter_ms = 0

[analyzer]
decay_tick_ms = 100

[persistence]
backend = "memory"
checkpoint_interval_secs = 0

[[twins]]
id = "thermostat"
device_id = "dev-thermo"
scope = "house"

[twins.initial_state]
temp = 72.0
mode = "off"

[[rules]]
name = "cool_down"
priority = 10

[rules.condition]
type = "attribute_above"
twin = "thermostat"
attribute = "temp"
value = 75.0

[rules.action]
target = "thermostat"
impact = 1.0

[rules.action.set]
mode = "cool"

[[constraints]]
id = "never-heat"
severity = "critical"

[constraints.predicate]
type = "forbid_value"
attribute = "mode"
value = "heat"
"#;

async fn start_node() -> (Runtime, Arc<SimulatedAdapter>) {
    let config = Config::from_toml_str(NODE_CONFIG).unwrap();
    let adapter = Arc::new(SimulatedAdapter::new());
    for twin in &config.twins {
        adapter.add_device(&twin.device_id, twin.initial_state.clone());
    }
    let runtime = Runtime::new(config, adapter.clone(), Arc::new(MemoryPersistence::new())).unwrap();
    runtime.start().await.unwrap();
    (runtime, adapter)
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

async fn wait_until<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_external_heat_drives_decision_to_completion() {
    let (runtime, adapter) = start_node().await;
    let scope = ScopeId::house();

    adapter.set_external("dev-thermo", "temp", 80.0);
    runtime.engine().request_sync("thermostat");

    let completed = wait_for(|| {
        runtime
            .decisions(&scope, 10)
            .iter()
            .any(|d| d.rule() == Some("cool_down") && d.status == DecisionStatus::Completed)
    })
    .await;
    assert!(completed, "decision never completed: {:?}", runtime.decisions(&scope, 10));

    let decision = runtime
        .decisions(&scope, 10)
        .into_iter()
        .find(|d| d.rule() == Some("cool_down"))
        .unwrap();
    assert!(decision.outcome.as_ref().unwrap().success);
    assert!(matches!(decision.trigger, Trigger::Observation { .. }));
    assert_eq!(adapter.device_state("dev-thermo").unwrap()["mode"], AttrValue::from("cool"));

    let twin = runtime.twin("thermostat").await.unwrap();
    assert_eq!(twin.last_known_state["mode"], AttrValue::from("cool"));
    assert!(twin.pending_changes.is_empty());

    let situation = runtime.situation(&scope).unwrap();
    assert_eq!(situation.value("thermostat", "temp"), Some(&AttrValue::Number(80.0)));

    let rt = &runtime;
    assert!(wait_until(|| async move { rt.learner().weights().await.rule_weight("cool_down") > 1.0 }).await);

    runtime.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_trigger_without_candidates_records_no_action() {
    let (runtime, _adapter) = start_node().await;
    let scope = ScopeId::house();

    let decision = runtime.trigger(&scope, "user asked").await.unwrap().unwrap();
    assert_eq!(decision.status, DecisionStatus::NoAction);
    assert!(decision.chosen.is_none());
    assert_eq!(decision.trigger, Trigger::Manual { reason: "user asked".into() });
    assert_eq!(runtime.decisions(&scope, 1)[0].id, decision.id);
    assert!(runtime.emotional_state(&scope).is_some());

    assert_ok!(runtime.submit_feedback(&scope, Some(decision.id.clone()), 0.9, None));
    let unknown = runtime.submit_feedback(&scope, Some("nope".into()), 0.9, None);
    assert!(matches!(assert_err!(unknown), RuntimeError::DecisionNotFound(_)));

    runtime.shutdown().await.unwrap();
    assert!(matches!(
        runtime.trigger(&scope, "late").await,
        Err(RuntimeError::ShutDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_quarantined_twin_recovers_after_reset() {
    let (runtime, adapter) = start_node().await;

    runtime
        .add_twin(DigitalTwin::new("ghost", "dev-ghost").with_sync_interval(Duration::from_millis(20)))
        .await;
    let rt = &runtime;
    assert!(wait_until(|| async move {
        rt.twin("ghost").await.map(|t| t.connectivity.is_error()).unwrap_or(false)
    })
    .await);

    adapter.add_device("dev-ghost", BTreeMap::new());
    runtime.reset_twin("ghost").await.unwrap();
    assert!(wait_until(|| async move {
        rt.twin("ghost")
            .await
            .map(|t| t.connectivity == Connectivity::Online)
            .unwrap_or(false)
    })
    .await);
    assert_eq!(runtime.dropped_observations(), 0);

    runtime.shutdown().await.unwrap();
}
