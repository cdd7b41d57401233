//! Sync Engine - reconciles each twin with its physical device
//!
//! One reconciliation cycle:
//! 1. Read the device (bounded by `io_timeout`). Unreachable means offline,
//!    which is a normal steady state, not an error.
//! 2. Fold device state into `last_known_state`. Differences that no queued
//!    change explains are external changes; they win over queued intent on the
//!    same attribute (conflict rule).
//! 3. Write queued changes in sequence order, draining each on acknowledgement.
//! 4. Recompute divergence and raise at most one alert for the cycle.
//!
//! Every twin mutation happens after an awaited device result, so dropping a
//! cycle mid-I/O (shutdown) leaves the twin untouched.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterError, DeviceAdapter, DeviceSnapshot};
use crate::bus::{Observation, ObservationBus, ObservationKind, ObservationSource, TwinChange};
use crate::models::{AttrValue, DecisionId, TwinId};
use crate::twin::divergence::twin_divergence;
use crate::twin::{ConflictRecord, Connectivity, DigitalTwin, PendingChange, TwinError, TwinStore};

/// Sync engine tuning
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Bound on each device read or write
    pub io_timeout: Duration,
    /// Device rejections tolerated before a change is failed
    pub max_retries: u32,
    /// Conflict records kept per twin
    pub conflict_history: usize,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(3),
            max_retries: 3,
            conflict_history: 50,
        }
    }
}

/// A pending change that exhausted its retries
#[derive(Debug, Clone, PartialEq)]
pub struct FailedChange {
    pub seq: u64,
    pub attribute: String,
    pub decision_id: Option<DecisionId>,
    pub reason: String,
}

/// What one reconciliation cycle did
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub twin_id: TwinId,
    /// Twin is quarantined and was not synced
    pub skipped: bool,
    pub reachable: bool,
    /// Set when this cycle quarantined the twin
    pub quarantined: Option<String>,
    /// Attributes changed outside the control loop
    pub external_changes: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
    /// Sequence numbers acknowledged by the device this cycle
    pub applied: Vec<u64>,
    pub failed: Vec<FailedChange>,
    pub divergence_score: f64,
    pub divergence_alert: bool,
}

impl SyncReport {
    fn new(twin_id: &str) -> Self {
        Self {
            twin_id: twin_id.to_string(),
            ..Default::default()
        }
    }
}

/// Result of folding a device snapshot into a twin
struct FoldOutcome {
    readings: Vec<(String, AttrValue)>,
    conflicts: Vec<ConflictRecord>,
    superseded: BTreeSet<DecisionId>,
}

/// Reconciles twins with devices
pub struct SyncEngine {
    store: Arc<TwinStore>,
    adapter: Arc<dyn DeviceAdapter>,
    bus: ObservationBus,
    config: SyncEngineConfig,
    nudges: DashMap<TwinId, Arc<Notify>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<TwinStore>,
        adapter: Arc<dyn DeviceAdapter>,
        bus: ObservationBus,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            bus,
            config,
            nudges: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<TwinStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Wake-up handle the scheduler waits on for a twin
    pub fn notifier(&self, twin_id: &str) -> Arc<Notify> {
        self.nudges
            .entry(twin_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Ask the scheduler to run the twin's next cycle now
    pub fn request_sync(&self, twin_id: &str) {
        self.notifier(twin_id).notify_one();
    }

    /// Entry point for the decision engine: record intent on the twin and
    /// queue the changes for the device. Works the same whether or not the
    /// device is reachable.
    pub async fn submit_desired(
        &self,
        twin_id: &str,
        changes: &BTreeMap<String, AttrValue>,
        decision_id: Option<DecisionId>,
    ) -> Result<Vec<u64>, TwinError> {
        self.store.set_desired(twin_id, changes).await?;

        let mut seqs = Vec::with_capacity(changes.len());
        for (attribute, value) in changes {
            let seq = self
                .store
                .append_pending_change(twin_id, attribute, value.clone(), decision_id.clone())
                .await?;
            seqs.push(seq);
        }

        debug!(twin_id, ?seqs, decision_id = ?decision_id, "Desired state submitted");
        self.request_sync(twin_id);
        Ok(seqs)
    }

    /// Lift a quarantine. Changes discarded from a corrupt queue fail their
    /// decisions; the twin is synced again right away.
    pub async fn reset_twin(&self, twin_id: &str) -> Result<Vec<PendingChange>, TwinError> {
        let discarded = self.store.reset_twin(twin_id).await?;

        let decisions: BTreeSet<&DecisionId> =
            discarded.iter().filter_map(|c| c.decision_id.as_ref()).collect();
        for decision_id in decisions {
            self.publish_outcome(
                twin_id,
                decision_id,
                false,
                "pending changes discarded when the twin was reset".to_string(),
            );
        }

        self.request_sync(twin_id);
        Ok(discarded)
    }

    /// Run one reconciliation cycle for a twin
    pub async fn reconcile(&self, twin_id: &str) -> Result<SyncReport, TwinError> {
        let _guard = self.store.sync_guard(twin_id).await?;
        let twin = self.store.get(twin_id).await?;
        let mut report = SyncReport::new(twin_id);

        if twin.connectivity.is_error() {
            debug!(twin_id, "Twin quarantined, skipping sync");
            report.skipped = true;
            report.divergence_score = twin.divergence_score;
            return Ok(report);
        }

        // 1. Read
        let snapshot = match timeout(self.config.io_timeout, self.adapter.read_state(&twin.device_id)).await {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(AdapterError::UnknownDevice(device))) => {
                let reason = format!("device {} unknown to adapter", device);
                self.store.quarantine(twin_id, reason.clone()).await?;
                report.quarantined = Some(reason);
                return Ok(report);
            }
            Ok(Err(e)) => {
                debug!(twin_id, error = %e, "Device read failed");
                self.set_connectivity(twin_id, Connectivity::Offline).await?;
                self.store.record_sync(twin_id, Utc::now()).await?;
                report.divergence_score = twin.divergence_score;
                return Ok(report);
            }
            Err(_) => {
                debug!(twin_id, "Device read timed out");
                self.set_connectivity(twin_id, Connectivity::Offline).await?;
                self.store.record_sync(twin_id, Utc::now()).await?;
                report.divergence_score = twin.divergence_score;
                return Ok(report);
            }
        };

        report.reachable = true;
        self.set_connectivity(twin_id, Connectivity::Online).await?;

        // 2. Compare and resolve conflicts
        self.fold_snapshot(twin_id, &snapshot, &mut report).await?;

        // 3. Apply pending changes in order
        if self.apply_pending(twin_id, &twin.device_id, &mut report).await? {
            return Ok(report);
        }

        // 4. Divergence
        self.refresh_divergence(twin_id, &mut report).await?;
        self.store.record_sync(twin_id, Utc::now()).await?;

        debug!(
            twin_id,
            applied = report.applied.len(),
            external = report.external_changes.len(),
            conflicts = report.conflicts.len(),
            divergence = report.divergence_score,
            "Sync cycle complete"
        );
        Ok(report)
    }

    async fn set_connectivity(&self, twin_id: &str, next: Connectivity) -> Result<(), TwinError> {
        let previous = self
            .store
            .mutate(twin_id, |twin| {
                if twin.connectivity == next {
                    return (None, vec![]);
                }
                let previous = std::mem::replace(&mut twin.connectivity, next.clone());
                (Some(previous), vec![TwinChange::ConnectivityUpdated])
            })
            .await?;

        if let Some(previous) = previous {
            match next {
                Connectivity::Offline => warn!(twin_id, "Device went offline"),
                _ => info!(twin_id, state = next.label(), "Device connectivity changed"),
            }
            self.bus.publish(Observation::internal(
                twin_id,
                ObservationKind::ConnectivityChanged {
                    previous,
                    current: next,
                },
            ));
        }
        Ok(())
    }

    async fn fold_snapshot(
        &self,
        twin_id: &str,
        snapshot: &DeviceSnapshot,
        report: &mut SyncReport,
    ) -> Result<(), TwinError> {
        let history = self.config.conflict_history;
        let attributes = snapshot.attributes.clone();

        let fold = self
            .store
            .mutate(twin_id, move |twin| {
                let fold = fold_into_twin(twin, &attributes, history);
                let mut changes = Vec::new();
                if !fold.readings.is_empty() || !fold.conflicts.is_empty() {
                    changes.push(TwinChange::StateUpdated {
                        attributes: fold.readings.iter().map(|(a, _)| a.clone()).collect(),
                    });
                }
                for record in &fold.conflicts {
                    changes.push(TwinChange::PendingDropped {
                        seq: record.dropped_seq,
                        reason: record.reason.clone(),
                    });
                }
                (fold, changes)
            })
            .await?;

        for (attribute, value) in &fold.readings {
            report.external_changes.push(attribute.clone());
            self.bus.publish(
                Observation::reading(twin_id, attribute.clone(), value.clone(), ObservationSource::Sensor)
                    .at(snapshot.as_of),
            );
        }

        for record in &fold.conflicts {
            warn!(
                twin_id,
                attribute = %record.attribute,
                seq = record.dropped_seq,
                observed = %record.observed_value,
                dropped = %record.dropped_value,
                "Pending change dropped by external change"
            );
            self.bus.publish(
                Observation::internal(
                    twin_id,
                    ObservationKind::ConflictResolved {
                        record: record.clone(),
                    },
                )
                .with_attribute(record.attribute.clone()),
            );
        }

        for decision_id in &fold.superseded {
            self.publish_outcome(
                twin_id,
                decision_id,
                false,
                "superseded by an externally observed change".to_string(),
            );
        }

        report.conflicts.extend(fold.conflicts);
        Ok(())
    }

    /// Returns `true` when the twin was quarantined and the cycle must stop
    async fn apply_pending(
        &self,
        twin_id: &str,
        device_id: &str,
        report: &mut SyncReport,
    ) -> Result<bool, TwinError> {
        loop {
            let twin = self.store.get(twin_id).await?;
            let change = match twin.pending_changes.front() {
                Some(c) => c.clone(),
                None => return Ok(false),
            };

            let write: BTreeMap<String, AttrValue> =
                [(change.attribute.clone(), change.value.clone())].into();

            match timeout(self.config.io_timeout, self.adapter.write_state(device_id, &write)).await {
                Ok(Ok(())) => {
                    let seq = change.seq;
                    match self.store.pop_pending_change(twin_id, seq).await {
                        Ok(Some(_)) => {
                            report.applied.push(seq);
                            debug!(twin_id, seq, attribute = %change.attribute, "Pending change applied");
                            if let Some(decision_id) = &change.decision_id {
                                let remaining = self.store.get(twin_id).await?.has_pending_for(decision_id);
                                if !remaining {
                                    self.publish_outcome(
                                        twin_id,
                                        decision_id,
                                        true,
                                        "all changes acknowledged by device".to_string(),
                                    );
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(twin_id, seq, "Pending change removed concurrently");
                        }
                        Err(TwinError::InvariantViolation(reason)) => {
                            self.store.quarantine(twin_id, reason.clone()).await?;
                            report.quarantined = Some(reason);
                            return Ok(true);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(Err(AdapterError::UnknownDevice(device))) => {
                    let reason = format!("device {} unknown to adapter", device);
                    self.store.quarantine(twin_id, reason.clone()).await?;
                    report.quarantined = Some(reason);
                    return Ok(true);
                }
                Ok(Err(AdapterError::Rejected { reason, .. })) => {
                    self.record_rejection(twin_id, &change, &reason, report).await?;
                    return Ok(false);
                }
                Ok(Err(AdapterError::Unreachable(_))) | Err(_) => {
                    debug!(twin_id, seq = change.seq, "Device unreachable during write");
                    self.set_connectivity(twin_id, Connectivity::Offline).await?;
                    report.reachable = false;
                    return Ok(false);
                }
            }
        }
    }

    async fn record_rejection(
        &self,
        twin_id: &str,
        change: &PendingChange,
        reason: &str,
        report: &mut SyncReport,
    ) -> Result<(), TwinError> {
        let max_retries = self.config.max_retries;
        let seq = change.seq;
        let decision_id = change.decision_id.clone();

        let (retries, abandoned) = self
            .store
            .mutate(twin_id, |twin| {
                let retries = match twin.pending_changes.iter_mut().find(|c| c.seq == seq) {
                    Some(c) => {
                        c.retries += 1;
                        c.retries
                    }
                    None => return ((0, Vec::new()), vec![]),
                };
                if retries < max_retries {
                    return ((retries, Vec::new()), vec![TwinChange::RetryRecorded { seq, retries }]);
                }

                // Failed for good: drop it along with the rest of its decision
                let mut dropped = Vec::new();
                let mut attributes = BTreeSet::new();
                twin.pending_changes.retain(|c| {
                    let same_decision = decision_id.is_some() && c.decision_id == decision_id;
                    if c.seq == seq || same_decision {
                        dropped.push(c.seq);
                        attributes.insert(c.attribute.clone());
                        false
                    } else {
                        true
                    }
                });
                for attribute in &attributes {
                    twin.settle_desired(attribute);
                }
                let changes = dropped
                    .iter()
                    .map(|s| TwinChange::PendingDropped {
                        seq: *s,
                        reason: "retries exhausted".to_string(),
                    })
                    .collect();
                ((retries, dropped), changes)
            })
            .await?;

        if abandoned.is_empty() {
            debug!(twin_id, seq, retries, reason, "Device rejected change, will retry");
            return Ok(());
        }

        warn!(twin_id, seq, retries, reason, "Pending change failed after retries");
        report.failed.push(FailedChange {
            seq,
            attribute: change.attribute.clone(),
            decision_id: decision_id.clone(),
            reason: reason.to_string(),
        });
        if let Some(decision_id) = &decision_id {
            self.publish_outcome(
                twin_id,
                decision_id,
                false,
                format!("change to {} rejected {} times: {}", change.attribute, retries, reason),
            );
        }
        Ok(())
    }

    async fn refresh_divergence(&self, twin_id: &str, report: &mut SyncReport) -> Result<(), TwinError> {
        let (score, threshold) = self
            .store
            .mutate(twin_id, |twin| {
                let score = twin_divergence(twin);
                let changed = (score - twin.divergence_score).abs() > f64::EPSILON;
                twin.divergence_score = score;
                let changes = if changed {
                    vec![TwinChange::DivergenceUpdated { score }]
                } else {
                    vec![]
                };
                ((score, twin.divergence_threshold), changes)
            })
            .await?;

        report.divergence_score = score;
        if score > threshold {
            report.divergence_alert = true;
            info!(twin_id, score, threshold, "Divergence threshold exceeded");
            self.bus.publish(Observation::internal(
                twin_id,
                ObservationKind::DivergenceAlert { score, threshold },
            ));
        }
        Ok(())
    }

    fn publish_outcome(&self, twin_id: &str, decision_id: &str, success: bool, detail: String) {
        self.bus.publish(Observation::internal(
            twin_id,
            ObservationKind::DecisionOutcome {
                decision_id: decision_id.to_string(),
                success,
                detail,
            },
        ));
    }
}

/// Fold a device snapshot into the twin, applying the conflict rule.
///
/// A difference is explained when some queued change carries the reported
/// value; explained differences update state silently. Unexplained
/// differences on known attributes are external changes and drop every
/// queued change for that attribute. First-seen attributes are recorded but
/// never conflict.
fn fold_into_twin(
    twin: &mut DigitalTwin,
    attributes: &BTreeMap<String, AttrValue>,
    history: usize,
) -> FoldOutcome {
    let mut readings = Vec::new();
    let mut conflicts = Vec::new();
    let mut superseded = BTreeSet::new();
    let now = Utc::now();

    for (attribute, observed) in attributes {
        let known = twin.last_known_state.get(attribute).cloned();
        if known.as_ref() == Some(observed) {
            continue;
        }

        let explained = twin
            .pending_changes
            .iter()
            .any(|c| &c.attribute == attribute && &c.value == observed);

        twin.last_known_state.insert(attribute.clone(), observed.clone());
        if explained {
            continue;
        }
        readings.push((attribute.clone(), observed.clone()));

        if known.is_none() {
            continue;
        }

        // Conflict rule: physical reality wins over queued intent
        let mut dropped = Vec::new();
        twin.pending_changes.retain(|c| {
            if &c.attribute == attribute {
                dropped.push(c.clone());
                false
            } else {
                true
            }
        });
        if dropped.is_empty() {
            continue;
        }

        twin.desired_state.insert(attribute.clone(), observed.clone());
        for change in dropped {
            if let Some(decision_id) = &change.decision_id {
                superseded.insert(decision_id.clone());
            }
            conflicts.push(ConflictRecord {
                attribute: attribute.clone(),
                dropped_seq: change.seq,
                dropped_value: change.value,
                observed_value: observed.clone(),
                decision_id: change.decision_id,
                reason: format!(
                    "device reported {} = {} outside the control loop",
                    attribute, observed
                ),
                at: now,
            });
        }
    }

    // A superseded decision's remaining changes are abandoned with it
    if !superseded.is_empty() {
        let mut abandoned = BTreeSet::new();
        twin.pending_changes.retain(|c| {
            let keep = c
                .decision_id
                .as_ref()
                .map_or(true, |d| !superseded.contains(d));
            if !keep {
                abandoned.insert(c.attribute.clone());
            }
            keep
        });
        for attribute in &abandoned {
            twin.settle_desired(attribute);
        }
    }

    twin.conflicts.extend(conflicts.iter().cloned());
    if twin.conflicts.len() > history {
        let excess = twin.conflicts.len() - history;
        twin.conflicts.drain(0..excess);
    }

    FoldOutcome {
        readings,
        conflicts,
        superseded,
    }
}
