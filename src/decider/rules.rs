//! Rule-based candidate generation
//!
//! Rules are data: a condition tree evaluated against the scope's situation
//! and an action template. They load from YAML or TOML.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::models::CandidateAction;
use crate::analyzer::{Dimension, SituationSnapshot};
use crate::error::ConfigError;
use crate::models::{span_secs, AttrValue, ScopeId, TwinId};

/// Inputs available to a candidate source
pub struct CandidateContext<'a> {
    pub scope: &'a ScopeId,
    pub snapshot: &'a SituationSnapshot,
    pub now: DateTime<Utc>,
}

/// Plug-in producer of candidate actions
pub trait CandidateSource: Send + Sync {
    fn name(&self) -> &str;

    /// Propose actions for the current situation
    fn candidates(&self, ctx: &CandidateContext<'_>) -> Vec<CandidateAction>;

    /// Called when one of this source's candidates is chosen
    fn chosen(&self, _scope: &ScopeId, _action: &CandidateAction, _at: DateTime<Utc>) {}
}

/// Condition evaluated against a situation snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Latest numeric reading above a value
    AttributeAbove {
        twin: TwinId,
        attribute: String,
        value: f64,
    },
    AttributeBelow {
        twin: TwinId,
        attribute: String,
        value: f64,
    },
    AttributeEquals {
        twin: TwinId,
        attribute: String,
        value: AttrValue,
    },
    EmotionAbove {
        dimension: Dimension,
        value: f64,
    },
    /// An anomaly is flagged (optionally on a specific twin/attribute)
    AnomalyActive {
        #[serde(default)]
        twin: Option<TwinId>,
        #[serde(default)]
        attribute: Option<String>,
    },
    DeviceOffline {
        twin: TwinId,
    },
    /// A twin (or any twin) has a recent divergence alert
    DivergenceActive {
        #[serde(default)]
        twin: Option<TwinId>,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
    Always,
}

impl Condition {
    pub fn evaluate(&self, snapshot: &SituationSnapshot) -> bool {
        match self {
            Condition::AttributeAbove { twin, attribute, value } => snapshot
                .value(twin, attribute)
                .and_then(|v| v.as_f64())
                .map_or(false, |v| v > *value),
            Condition::AttributeBelow { twin, attribute, value } => snapshot
                .value(twin, attribute)
                .and_then(|v| v.as_f64())
                .map_or(false, |v| v < *value),
            Condition::AttributeEquals { twin, attribute, value } => {
                snapshot.value(twin, attribute) == Some(value)
            }
            Condition::EmotionAbove { dimension, value } => {
                snapshot.emotion.get(*dimension) > *value
            }
            Condition::AnomalyActive { twin, attribute } => snapshot.anomalies.iter().any(|a| {
                let (a_twin, a_attr) = a.key.split_once('/').unwrap_or((a.key.as_str(), ""));
                twin.as_deref().map_or(true, |t| t == a_twin)
                    && attribute.as_deref().map_or(true, |at| at == a_attr)
            }),
            Condition::DeviceOffline { twin } => snapshot.is_offline(twin),
            Condition::DivergenceActive { twin } => match twin {
                Some(t) => snapshot.divergent.contains_key(t),
                None => !snapshot.divergent.is_empty(),
            },
            Condition::And { conditions } => conditions.iter().all(|c| c.evaluate(snapshot)),
            Condition::Or { conditions } => conditions.iter().any(|c| c.evaluate(snapshot)),
            Condition::Not { condition } => !condition.evaluate(snapshot),
            Condition::Always => true,
        }
    }
}

/// The action a rule proposes when it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub target: TwinId,
    pub set: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub impact: f64,
    #[serde(default)]
    pub relieves: Option<Dimension>,
    #[serde(default = "default_resource_cost")]
    pub resource_cost: f64,
}

fn default_resource_cost() -> f64 {
    1.0
}

/// A decision rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Scope the rule applies to; any scope when unset
    #[serde(default)]
    pub scope: Option<ScopeId>,
    pub condition: Condition,
    pub action: ActionTemplate,
    /// Higher priority rules generate first
    #[serde(default)]
    pub priority: u8,
    /// Overrides the decider's default cooldown
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Load rules from a YAML file: either a bare list or a `rules:` mapping
pub fn load_rules_file(path: impl AsRef<Path>) -> Result<Vec<Rule>, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let rules = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            toml::from_str::<RuleFile>(&content)
                .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?
                .rules
        }
        _ => parse_yaml_rules(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?,
    };

    info!(count = rules.len(), path = %path.display(), "Loaded rules");
    Ok(rules)
}

fn parse_yaml_rules(content: &str) -> Result<Vec<Rule>, serde_yaml::Error> {
    match serde_yaml::from_str::<Vec<Rule>>(content) {
        Ok(rules) => Ok(rules),
        Err(_) => serde_yaml::from_str::<RuleFile>(content).map(|f| f.rules),
    }
}

/// The default candidate source
pub struct RuleSet {
    rules: Vec<Rule>,
    default_cooldown: Duration,
    /// Last time each rule's candidate was chosen, per scope
    last_fired: DashMap<(String, ScopeId), DateTime<Utc>>,
}

impl RuleSet {
    /// Rules are kept in generation order: priority descending, then declaration order
    pub fn new(mut rules: Vec<Rule>, default_cooldown_secs: u64) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            default_cooldown: span_secs(default_cooldown_secs),
            last_fired: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn cooldown(&self, rule: &Rule) -> Duration {
        rule.cooldown_secs.map(span_secs).unwrap_or(self.default_cooldown)
    }

    fn cooling_down(&self, rule: &Rule, scope: &ScopeId, now: DateTime<Utc>) -> bool {
        self.last_fired
            .get(&(rule.name.clone(), scope.clone()))
            .map_or(false, |last| {
                // A cooldown reaching past the calendar never ends
                last.checked_add_signed(self.cooldown(rule))
                    .map_or(true, |until| now < until)
            })
    }
}

impl CandidateSource for RuleSet {
    fn name(&self) -> &str {
        "rules"
    }

    fn candidates(&self, ctx: &CandidateContext<'_>) -> Vec<CandidateAction> {
        let mut out = Vec::new();
        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }
            if rule.scope.as_ref().map_or(false, |s| s != ctx.scope) {
                continue;
            }
            if self.cooling_down(rule, ctx.scope, ctx.now) {
                debug!(rule = %rule.name, scope = %ctx.scope, "Rule on cooldown");
                continue;
            }
            if !rule.condition.evaluate(ctx.snapshot) {
                continue;
            }

            debug!(rule = %rule.name, scope = %ctx.scope, "Rule matched");
            out.push(CandidateAction {
                rule: rule.name.clone(),
                source: self.name().to_string(),
                target: rule.action.target.clone(),
                changes: rule.action.set.clone(),
                impact: rule.action.impact,
                relieves: rule.action.relieves,
                resource_cost: rule.action.resource_cost,
                order: 0,
            });
        }
        out
    }

    fn chosen(&self, scope: &ScopeId, action: &CandidateAction, at: DateTime<Utc>) {
        self.last_fired.insert((action.rule.clone(), scope.clone()), at);
    }
}
