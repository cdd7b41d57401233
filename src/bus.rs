//! Observation Bus - best-effort fan-out of observations to subscribers
//!
//! Built on a `tokio::sync::broadcast` channel:
//! - Delivery order per publisher is preserved (the channel is FIFO).
//! - Producers never block. A subscriber that falls behind loses its oldest
//!   unconsumed observations; the loss is counted in `dropped_observations`.
//! - The bus retains nothing beyond the channel ring buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::analyzer::SituationSnapshot;
use crate::decider::Decision;
use crate::models::{AttrValue, DecisionId};
use crate::twin::{ConflictRecord, Connectivity};

/// Default per-subscriber buffer
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

//=============================================================================
// OBSERVATIONS
//=============================================================================

/// Where an observation originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    /// Physical sensor or device report
    Sensor,
    /// Explicit user input or feedback
    User,
    /// Produced inside the core (twin store, analyzer, decider)
    Internal,
}

/// What changed on a twin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TwinChange {
    Upserted,
    StateUpdated { attributes: Vec<String> },
    DesiredUpdated { attributes: Vec<String> },
    PendingAppended { seq: u64 },
    PendingDrained { seqs: Vec<u64> },
    PendingDropped { seq: u64, reason: String },
    RetryRecorded { seq: u64, retries: u32 },
    ConnectivityUpdated,
    DivergenceUpdated { score: f64 },
    Reset,
}

/// Category and payload of an observation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationKind {
    /// Attribute reading (`attribute` / `value` are set)
    Reading,
    /// A twin record was mutated
    TwinChanged { change: TwinChange },
    ConnectivityChanged {
        previous: Connectivity,
        current: Connectivity,
    },
    /// Desired and confirmed state have drifted past the twin's threshold
    DivergenceAlert { score: f64, threshold: f64 },
    /// A pending change lost to an externally observed value
    ConflictResolved { record: ConflictRecord },
    /// A scope's situational model advanced
    SituationUpdated { snapshot: Box<SituationSnapshot> },
    DecisionRecorded { decision: Box<Decision> },
    /// A dispatched decision finished draining, or failed
    DecisionOutcome {
        decision_id: DecisionId,
        success: bool,
        detail: String,
    },
    /// Explicit user feedback, `satisfaction` in `[0, 1]`
    UserFeedback {
        decision_id: Option<DecisionId>,
        satisfaction: f64,
        #[serde(default)]
        comment: Option<String>,
    },
}

impl ObservationKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObservationKind::Reading => "reading",
            ObservationKind::TwinChanged { .. } => "twin_changed",
            ObservationKind::ConnectivityChanged { .. } => "connectivity_changed",
            ObservationKind::DivergenceAlert { .. } => "divergence_alert",
            ObservationKind::ConflictResolved { .. } => "conflict_resolved",
            ObservationKind::SituationUpdated { .. } => "situation_updated",
            ObservationKind::DecisionRecorded { .. } => "decision_recorded",
            ObservationKind::DecisionOutcome { .. } => "decision_outcome",
            ObservationKind::UserFeedback { .. } => "user_feedback",
        }
    }
}

/// An immutable, timestamped observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// Twin id for device-level observations, scope id for situation updates
    pub subject: String,
    pub attribute: Option<String>,
    pub value: Option<AttrValue>,
    /// Reading quality (0.0 - 1.0)
    pub quality: f32,
    pub timestamp: DateTime<Utc>,
    pub source: ObservationSource,
    pub kind: ObservationKind,
}

impl Observation {
    pub fn new(subject: impl Into<String>, source: ObservationSource, kind: ObservationKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.into(),
            attribute: None,
            value: None,
            quality: 1.0,
            timestamp: Utc::now(),
            source,
            kind,
        }
    }

    /// A single attribute reading
    pub fn reading(
        subject: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<AttrValue>,
        source: ObservationSource,
    ) -> Self {
        let mut obs = Self::new(subject, source, ObservationKind::Reading);
        obs.attribute = Some(attribute.into());
        obs.value = Some(value.into());
        obs
    }

    /// An internally generated event about `subject`
    pub fn internal(subject: impl Into<String>, kind: ObservationKind) -> Self {
        Self::new(subject, ObservationSource::Internal, kind)
    }

    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn is_divergence_alert(&self) -> bool {
        matches!(self.kind, ObservationKind::DivergenceAlert { .. })
    }
}

//=============================================================================
// BUS
//=============================================================================

/// Broadcast bus shared by every producer and consumer in the runtime
#[derive(Clone)]
pub struct ObservationBus {
    tx: broadcast::Sender<Observation>,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ObservationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an observation. Never blocks; having no subscribers is fine.
    pub fn publish(&self, observation: Observation) {
        trace!(
            subject = %observation.subject,
            kind = observation.kind.name(),
            "Publishing observation"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(observation);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped_total: self.dropped.clone(),
            dropped: 0,
            filter: None,
        }
    }

    /// Observations dropped across all subscribers because they fell behind
    pub fn dropped_observations(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ObservationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

type ObservationFilter = Box<dyn Fn(&Observation) -> bool + Send + Sync>;

/// A subscriber's view of the bus
pub struct Subscription {
    rx: broadcast::Receiver<Observation>,
    dropped_total: Arc<AtomicU64>,
    dropped: u64,
    filter: Option<ObservationFilter>,
}

impl Subscription {
    /// Only deliver observations matching `filter`
    pub fn filtered(mut self, filter: impl Fn(&Observation) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Wait for the next observation. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Observation> {
        loop {
            match self.rx.recv().await {
                Ok(obs) => {
                    if self.accepts(&obs) {
                        return Some(obs);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is buffered
    pub fn try_recv(&mut self) -> Option<Observation> {
        loop {
            match self.rx.try_recv() {
                Ok(obs) => {
                    if self.accepts(&obs) {
                        return Some(obs);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered
    pub fn drain(&mut self) -> Vec<Observation> {
        let mut out = Vec::new();
        while let Some(obs) = self.try_recv() {
            out.push(obs);
        }
        out
    }

    /// Observations this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn accepts(&self, obs: &Observation) -> bool {
        self.filter.as_ref().map_or(true, |f| f(obs))
    }

    fn record_lag(&mut self, n: u64) {
        debug!(dropped = n, "Subscriber lagged, oldest observations dropped");
        self.dropped += n;
        self.dropped_total.fetch_add(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = ObservationBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Observation::reading("t1", "temp", 70.0, ObservationSource::Sensor));

        assert_eq!(a.recv().await.unwrap().subject, "t1");
        assert_eq!(b.recv().await.unwrap().subject, "t1");
    }

    #[tokio::test]
    async fn test_per_source_order_preserved() {
        let bus = ObservationBus::new(64);
        let mut sub = bus.subscribe();

        for i in 0..20 {
            bus.publish(Observation::reading("t1", "temp", i as f64, ObservationSource::Sensor));
        }

        for i in 0..20 {
            let obs = sub.recv().await.unwrap();
            assert_eq!(obs.value, Some(AttrValue::Number(i as f64)));
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_counts() {
        let bus = ObservationBus::new(4);
        let mut sub = bus.subscribe();

        for i in 0..10 {
            bus.publish(Observation::reading("t1", "temp", i as f64, ObservationSource::Sensor));
        }

        let received = sub.drain();
        // Newest observations survive, oldest were dropped
        assert_eq!(received.len(), 4);
        assert_eq!(received[0].value, Some(AttrValue::Number(6.0)));
        assert_eq!(received[3].value, Some(AttrValue::Number(9.0)));
        assert_eq!(sub.dropped(), 6);
        assert_eq!(bus.dropped_observations(), 6);
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = ObservationBus::new(4);
        bus.publish(Observation::reading("t1", "temp", 1.0, ObservationSource::Sensor));
        assert_eq!(bus.published_count(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_filtered_subscription() {
        let bus = ObservationBus::new(16);
        let mut alerts = bus.subscribe().filtered(|o| o.is_divergence_alert());

        bus.publish(Observation::reading("t1", "temp", 1.0, ObservationSource::Sensor));
        bus.publish(Observation::internal(
            "t1",
            ObservationKind::DivergenceAlert { score: 0.5, threshold: 0.1 },
        ));

        let got = alerts.drain();
        assert_eq!(got.len(), 1);
        assert!(got[0].is_divergence_alert());
    }

    #[test]
    fn test_quality_is_clamped() {
        let obs = Observation::reading("t1", "temp", 1.0, ObservationSource::Sensor).with_quality(3.0);
        assert_eq!(obs.quality, 1.0);
    }
}
