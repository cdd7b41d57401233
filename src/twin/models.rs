//! Digital twin records - the virtual side of every physical device

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::models::{AttrValue, DecisionId, DeviceId, ScopeId, TwinId};

/// Reachability of the physical counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
    #[default]
    Unknown,
    /// Quarantined after a data-corruption or invariant violation.
    /// Excluded from automatic sync until explicitly reset.
    Error { reason: String },
}

impl Connectivity {
    pub fn is_error(&self) -> bool {
        matches!(self, Connectivity::Error { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Connectivity::Online => "online",
            Connectivity::Offline => "offline",
            Connectivity::Unknown => "unknown",
            Connectivity::Error { .. } => "error",
        }
    }
}

/// How much modeling a twin carries beyond mirrored state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FidelityLevel {
    #[default]
    Basic,
    Modeled,
    Predictive,
}

/// A queued mutation destined for the physical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Per-twin sequence number, strictly increasing
    pub seq: u64,
    pub attribute: String,
    pub value: AttrValue,
    pub submitted_at: DateTime<Utc>,
    /// Device rejections seen so far
    #[serde(default)]
    pub retries: u32,
    /// Decision that produced this change, if any
    #[serde(default)]
    pub decision_id: Option<DecisionId>,
}

/// Record of a pending change dropped because physical reality disagreed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub attribute: String,
    pub dropped_seq: u64,
    pub dropped_value: AttrValue,
    pub observed_value: AttrValue,
    pub decision_id: Option<DecisionId>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The digital twin of one physical device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitalTwin {
    pub id: TwinId,
    pub device_id: DeviceId,
    #[serde(default)]
    pub scope: ScopeId,

    /// Last confirmed truth from the device
    #[serde(default)]
    pub last_known_state: BTreeMap<String, AttrValue>,
    /// Intent set by the decision engine; attributes absent here default to
    /// `last_known_state`
    #[serde(default)]
    pub desired_state: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub pending_changes: VecDeque<PendingChange>,
    /// Next sequence number to hand out; never reused
    #[serde(default = "first_seq")]
    pub next_seq: u64,

    #[serde(default)]
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms")]
    pub sync_interval: Duration,

    #[serde(default)]
    pub divergence_score: f64,
    pub divergence_threshold: f64,
    /// Relative weight of each attribute in the divergence score (default 1.0)
    #[serde(default)]
    pub attribute_weights: BTreeMap<String, f64>,
    /// Distance at which a numeric attribute counts as fully diverged (default 1.0)
    #[serde(default)]
    pub attribute_scales: BTreeMap<String, f64>,

    #[serde(default)]
    pub connectivity: Connectivity,
    #[serde(default)]
    pub fidelity: FidelityLevel,

    /// Bounded history of conflict-rule drops
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
}

fn first_seq() -> u64 {
    1
}

impl DigitalTwin {
    pub fn new(id: impl Into<TwinId>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            scope: ScopeId::default(),
            last_known_state: BTreeMap::new(),
            desired_state: BTreeMap::new(),
            pending_changes: VecDeque::new(),
            next_seq: first_seq(),
            last_sync_timestamp: None,
            sync_interval: Duration::from_secs(30),
            divergence_score: 0.0,
            divergence_threshold: 0.1,
            attribute_weights: BTreeMap::new(),
            attribute_scales: BTreeMap::new(),
            connectivity: Connectivity::Unknown,
            fidelity: FidelityLevel::Basic,
            conflicts: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: ScopeId) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_state(mut self, attribute: &str, value: impl Into<AttrValue>) -> Self {
        self.last_known_state.insert(attribute.to_string(), value.into());
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_divergence_threshold(mut self, threshold: f64) -> Self {
        self.divergence_threshold = threshold;
        self
    }

    pub fn with_scale(mut self, attribute: &str, scale: f64) -> Self {
        self.attribute_scales.insert(attribute.to_string(), scale);
        self
    }

    pub fn with_fidelity(mut self, fidelity: FidelityLevel) -> Self {
        self.fidelity = fidelity;
        self
    }

    /// Where the device is headed: the newest queued value for the attribute,
    /// or its last confirmed value when nothing is in flight
    pub fn projected_value(&self, attribute: &str) -> Option<&AttrValue> {
        self.pending_changes
            .iter()
            .rev()
            .find(|c| c.attribute == attribute)
            .map(|c| &c.value)
            .or_else(|| self.last_known_state.get(attribute))
    }

    /// Realign intent after queued changes for `attribute` were dropped.
    ///
    /// Intent follows the newest change still queued; with none left it falls
    /// back to the confirmed value.
    pub fn settle_desired(&mut self, attribute: &str) {
        let queued = self
            .pending_changes
            .iter()
            .rev()
            .find(|c| c.attribute == attribute)
            .map(|c| c.value.clone());
        match queued {
            Some(value) => {
                self.desired_state.insert(attribute.to_string(), value);
            }
            None => {
                self.desired_state.remove(attribute);
            }
        }
    }

    /// Whether the divergence score currently exceeds the twin's trip point
    pub fn divergence_exceeded(&self) -> bool {
        self.divergence_score > self.divergence_threshold
    }

    /// Whether any pending change still belongs to the given decision
    pub fn has_pending_for(&self, decision_id: &str) -> bool {
        self.pending_changes
            .iter()
            .any(|c| c.decision_id.as_deref() == Some(decision_id))
    }

    /// Check that pending changes are in strictly increasing sequence order and
    /// below `next_seq`. Returns a description of the first violation.
    pub fn check_sequence_order(&self) -> Result<(), String> {
        let mut prev: Option<u64> = None;
        for change in &self.pending_changes {
            if let Some(p) = prev {
                if change.seq <= p {
                    return Err(format!(
                        "pending change seq {} follows seq {} out of order",
                        change.seq, p
                    ));
                }
            }
            if change.seq >= self.next_seq {
                return Err(format!(
                    "pending change seq {} is not below next_seq {}",
                    change.seq, self.next_seq
                ));
            }
            prev = Some(change.seq);
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(seq: u64) -> PendingChange {
        PendingChange {
            seq,
            attribute: "temp".into(),
            value: AttrValue::Number(70.0),
            submitted_at: Utc::now(),
            retries: 0,
            decision_id: None,
        }
    }

    #[test]
    fn test_projected_value_prefers_newest_queued_change() {
        let mut twin = DigitalTwin::new("t1", "d1").with_state("temp", 72.0);
        assert_eq!(twin.projected_value("temp"), Some(&AttrValue::Number(72.0)));

        twin.pending_changes.push_back(change(1));
        let mut later = change(2);
        later.value = AttrValue::Number(68.0);
        twin.pending_changes.push_back(later);
        twin.next_seq = 3;
        assert_eq!(twin.projected_value("temp"), Some(&AttrValue::Number(68.0)));
        assert_eq!(twin.projected_value("mode"), None);
    }

    #[test]
    fn test_settle_desired_falls_back_to_confirmed_state() {
        let mut twin = DigitalTwin::new("t1", "d1").with_state("temp", 72.0);
        twin.desired_state.insert("temp".into(), AttrValue::Number(68.0));
        twin.pending_changes.push_back(change(1));
        twin.next_seq = 2;

        twin.settle_desired("temp");
        assert_eq!(twin.desired_state["temp"], AttrValue::Number(70.0));

        twin.pending_changes.clear();
        twin.settle_desired("temp");
        assert!(!twin.desired_state.contains_key("temp"));
    }

    #[test]
    fn test_sequence_order_check() {
        let mut twin = DigitalTwin::new("t1", "d1");
        twin.next_seq = 4;
        twin.pending_changes.extend([change(1), change(2), change(3)]);
        assert!(twin.check_sequence_order().is_ok());

        twin.pending_changes.push_back(change(2));
        assert!(twin.check_sequence_order().is_err());
    }

    #[test]
    fn test_sequence_beyond_next_seq_is_violation() {
        let mut twin = DigitalTwin::new("t1", "d1");
        twin.pending_changes.push_back(change(5));
        assert!(twin.check_sequence_order().is_err());
    }

    #[test]
    fn test_twin_json_roundtrip_keeps_interval() {
        let twin = DigitalTwin::new("t1", "d1").with_sync_interval(Duration::from_millis(1500));
        let json = serde_json::to_string(&twin).unwrap();
        let back: DigitalTwin = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sync_interval, Duration::from_millis(1500));
        assert_eq!(back.connectivity, Connectivity::Unknown);
    }
}
