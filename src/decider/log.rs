//! Decision log - the record of every decision, by id and by scope

use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

use super::models::Decision;
use crate::models::{DecisionId, ScopeId};

/// Decisions kept per scope before the oldest are forgotten
pub const DEFAULT_DECISIONS_PER_SCOPE: usize = 500;

pub struct DecisionLog {
    decisions: DashMap<DecisionId, Decision>,
    by_scope: DashMap<ScopeId, VecDeque<DecisionId>>,
    per_scope: usize,
}

impl DecisionLog {
    pub fn new(per_scope: usize) -> Self {
        Self {
            decisions: DashMap::new(),
            by_scope: DashMap::new(),
            per_scope: per_scope.max(1),
        }
    }

    pub fn record(&self, decision: Decision) {
        let evicted = {
            let mut ids = self.by_scope.entry(decision.scope.clone()).or_default();
            ids.retain(|id| id != &decision.id);
            ids.push_back(decision.id.clone());
            let mut evicted = Vec::new();
            while ids.len() > self.per_scope {
                if let Some(old) = ids.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };
        for id in evicted {
            self.decisions.remove(&id);
        }
        debug!(decision_id = %decision.id, scope = %decision.scope, "Decision recorded");
        self.decisions.insert(decision.id.clone(), decision);
    }

    pub fn get(&self, id: &str) -> Option<Decision> {
        self.decisions.get(id).map(|d| d.clone())
    }

    /// Set the outcome of a decision. Returns the updated decision and whether
    /// this was its first outcome.
    pub fn complete(&self, id: &str, success: bool, detail: &str) -> Option<(Decision, bool)> {
        let mut decision = self.decisions.get_mut(id)?;
        let first = decision.complete(success, detail);
        Some((decision.clone(), first))
    }

    /// Up to `n` most recent decisions for a scope, newest first
    pub fn recent(&self, scope: &ScopeId, n: usize) -> Vec<Decision> {
        let Some(ids) = self.by_scope.get(scope) else {
            return Vec::new();
        };
        ids.iter()
            .rev()
            .filter_map(|id| self.get(id))
            .take(n)
            .collect()
    }

    pub fn last_for_scope(&self, scope: &ScopeId) -> Option<Decision> {
        self.recent(scope, 1).into_iter().next()
    }

    /// Every logged decision, oldest first within each scope
    pub fn all(&self) -> Vec<Decision> {
        let mut out = Vec::new();
        for entry in self.by_scope.iter() {
            for id in entry.value() {
                if let Some(d) = self.get(id) {
                    out.push(d);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(DEFAULT_DECISIONS_PER_SCOPE)
    }
}
