//! Decision records and candidate actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyzer::{Dimension, Factor};
use crate::models::{AttrValue, DecisionId, ScopeId, TwinId};

/// A concrete action a candidate source proposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    /// Rule (or other producer) that generated the action
    pub rule: String,
    /// Candidate source that produced it
    pub source: String,
    pub target: TwinId,
    pub changes: BTreeMap<String, AttrValue>,
    /// Baseline benefit of the action
    pub impact: f64,
    /// Emotional dimension the action is meant to relieve
    pub relieves: Option<Dimension>,
    pub resource_cost: f64,
    /// Position in generation order, the final tie-breaker
    pub order: usize,
}

impl CandidateAction {
    /// Human-readable effect, e.g. `thermostat: mode=cool, temp=68`
    pub fn describe(&self) -> String {
        let changes: Vec<String> = self
            .changes
            .iter()
            .map(|(attr, value)| format!("{}={}", attr, value))
            .collect();
        format!("{}: {}", self.target, changes.join(", "))
    }
}

/// A candidate with its score and the constraints that rejected it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub action: CandidateAction,
    pub score: f64,
    /// Ids of violated constraints; empty means admissible
    pub rejected_by: Vec<String>,
}

impl ScoredCandidate {
    pub fn is_admissible(&self) -> bool {
        self.rejected_by.is_empty()
    }
}

/// What caused a decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Observation {
        observation_id: String,
        kind: String,
        subject: String,
    },
    Manual {
        reason: String,
    },
}

impl Trigger {
    pub fn is_manual(&self) -> bool {
        matches!(self, Trigger::Manual { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Nothing admissible to do
    NoAction,
    /// Chosen action handed to the sync engine
    Dispatched,
    /// Outcome known
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub success: bool,
    pub detail: String,
    pub completed_at: DateTime<Utc>,
}

/// The record of one decision cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub scope: ScopeId,
    pub trigger: Trigger,
    /// Situation summary at decision time
    pub context: String,
    /// Every generated candidate, best first
    pub candidates: Vec<ScoredCandidate>,
    pub chosen: Option<CandidateAction>,
    pub confidence: f64,
    pub expected_outcome: String,
    pub reasoning: String,
    pub status: DecisionStatus,
    pub outcome: Option<DecisionOutcome>,
    /// Strongest situation factor when the decision was made
    pub top_factor: Option<Factor>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    /// Record the outcome. Returns `false` when an outcome was already known;
    /// the outcome fields are still replaced.
    pub fn complete(&mut self, success: bool, detail: impl Into<String>) -> bool {
        let first = self.status != DecisionStatus::Completed;
        self.status = DecisionStatus::Completed;
        self.outcome = Some(DecisionOutcome {
            success,
            detail: detail.into(),
            completed_at: Utc::now(),
        });
        first
    }

    pub fn rule(&self) -> Option<&str> {
        self.chosen.as_ref().map(|c| c.rule.as_str())
    }
}
