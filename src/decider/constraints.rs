//! Safety constraints - hard filters on candidate actions
//!
//! Constraints are data loaded from configuration. They run after scoring on
//! every decision, so no learned weight can ever admit a violating action.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::models::CandidateAction;
use super::rules::Condition;
use crate::analyzer::SituationSnapshot;
use crate::models::{AttrValue, Severity, TwinId};

/// What a constraint forbids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintPredicate {
    /// Numeric attribute may not be set above `value`
    MaxValue {
        attribute: String,
        value: f64,
        #[serde(default)]
        twin: Option<TwinId>,
    },
    /// Numeric attribute may not be set below `value`
    MinValue {
        attribute: String,
        value: f64,
        #[serde(default)]
        twin: Option<TwinId>,
    },
    ForbidValue {
        attribute: String,
        value: AttrValue,
        #[serde(default)]
        twin: Option<TwinId>,
    },
    /// No automated action may target this twin
    DenyTwin { twin: TwinId },
    /// While `when` holds, forbid actions (on `attribute`, if given)
    ForbidWhen {
        when: Condition,
        #[serde(default)]
        attribute: Option<String>,
        #[serde(default)]
        twin: Option<TwinId>,
    },
}

fn twin_matches(filter: &Option<TwinId>, target: &str) -> bool {
    filter.as_deref().map_or(true, |t| t == target)
}

impl ConstraintPredicate {
    pub fn violated_by(&self, action: &CandidateAction, snapshot: &SituationSnapshot) -> bool {
        match self {
            ConstraintPredicate::MaxValue { attribute, value, twin } => {
                twin_matches(twin, &action.target)
                    && action
                        .changes
                        .get(attribute)
                        .filter(|v| v.is_number())
                        .and_then(|v| v.as_f64())
                        .map_or(false, |v| v > *value)
            }
            ConstraintPredicate::MinValue { attribute, value, twin } => {
                twin_matches(twin, &action.target)
                    && action
                        .changes
                        .get(attribute)
                        .filter(|v| v.is_number())
                        .and_then(|v| v.as_f64())
                        .map_or(false, |v| v < *value)
            }
            ConstraintPredicate::ForbidValue { attribute, value, twin } => {
                twin_matches(twin, &action.target) && action.changes.get(attribute) == Some(value)
            }
            ConstraintPredicate::DenyTwin { twin } => &action.target == twin,
            ConstraintPredicate::ForbidWhen { when, attribute, twin } => {
                twin_matches(twin, &action.target)
                    && attribute
                        .as_ref()
                        .map_or(true, |a| action.changes.contains_key(a))
                    && when.evaluate(snapshot)
            }
        }
    }
}

/// A named safety rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConstraint {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub predicate: ConstraintPredicate,
}

fn default_true() -> bool {
    true
}

impl SafetyConstraint {
    pub fn violated_by(&self, action: &CandidateAction, snapshot: &SituationSnapshot) -> bool {
        self.enabled && self.predicate.violated_by(action, snapshot)
    }
}

/// Shared constraint set.
///
/// Readers take an `Arc` of the current set and evaluate without holding any
/// lock; `replace` swaps in a new set atomically.
pub struct ConstraintRegistry {
    current: RwLock<Arc<Vec<SafetyConstraint>>>,
}

impl ConstraintRegistry {
    pub fn new(constraints: Vec<SafetyConstraint>) -> Self {
        Self {
            current: RwLock::new(Arc::new(constraints)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<SafetyConstraint>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn replace(&self, constraints: Vec<SafetyConstraint>) {
        let count = constraints.len();
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(constraints);
        info!(count, "Safety constraints replaced");
    }

    /// Ids of every enabled constraint the action violates
    pub fn violations(&self, action: &CandidateAction, snapshot: &SituationSnapshot) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|c| c.violated_by(action, snapshot))
            .map(|c| c.id.clone())
            .collect()
    }
}

impl Default for ConstraintRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
