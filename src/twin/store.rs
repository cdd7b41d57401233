//! Twin Store - authoritative in-memory registry of digital twins
//!
//! Each twin lives in its own slot with its own mutex, so mutations on one twin
//! are serialized while different twins never contend. A second per-twin
//! guard lets the sync engine hold a twin for a whole reconciliation cycle.
//!
//! Every mutation that changes twin content publishes a `twin_changed`
//! observation tagged `source=internal`. The one exception is `record_sync`:
//! the sync timestamp is scheduling metadata and publishes nothing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::divergence::twin_divergence;
use super::models::{Connectivity, DigitalTwin, PendingChange};
use super::TwinError;
use crate::bus::{Observation, ObservationBus, ObservationKind, TwinChange};
use crate::models::{AttrValue, DecisionId, TwinId};

struct TwinSlot {
    twin: Mutex<DigitalTwin>,
    sync_guard: Arc<Mutex<()>>,
}

/// Registry of all digital twins
pub struct TwinStore {
    twins: DashMap<TwinId, Arc<TwinSlot>>,
    bus: ObservationBus,
}

impl TwinStore {
    pub fn new(bus: ObservationBus) -> Self {
        Self {
            twins: DashMap::new(),
            bus,
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<TwinSlot>, TwinError> {
        self.twins
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| TwinError::NotFound(id.to_string()))
    }

    fn emit(&self, twin_id: &str, change: TwinChange) {
        self.bus.publish(Observation::internal(
            twin_id,
            ObservationKind::TwinChanged { change },
        ));
    }

    /// Insert or replace a twin.
    ///
    /// A twin whose pending queue violates sequence ordering is accepted but
    /// quarantined in `Connectivity::Error`.
    pub async fn upsert(&self, mut twin: DigitalTwin) {
        if let Err(reason) = twin.check_sequence_order() {
            error!(twin_id = %twin.id, %reason, "Twin failed sequence check, quarantining");
            twin.connectivity = Connectivity::Error { reason };
        }
        let id = twin.id.clone();

        let existing = self.twins.get(&id).map(|s| Arc::clone(s.value()));
        match existing {
            Some(slot) => {
                *slot.twin.lock().await = twin;
            }
            None => {
                self.twins.insert(
                    id.clone(),
                    Arc::new(TwinSlot {
                        twin: Mutex::new(twin),
                        sync_guard: Arc::new(Mutex::new(())),
                    }),
                );
            }
        }

        debug!(twin_id = %id, "Twin upserted");
        self.emit(&id, TwinChange::Upserted);
    }

    pub async fn get(&self, id: &str) -> Result<DigitalTwin, TwinError> {
        let slot = self.slot(id)?;
        let twin = slot.twin.lock().await;
        Ok(twin.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.twins.contains_key(id)
    }

    pub fn ids(&self) -> Vec<TwinId> {
        let mut ids: Vec<TwinId> = self.twins.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.twins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.twins.is_empty()
    }

    /// Clone every twin, ordered by id
    pub async fn snapshot_all(&self) -> Vec<DigitalTwin> {
        let mut out = Vec::with_capacity(self.twins.len());
        for id in self.ids() {
            if let Ok(twin) = self.get(&id).await {
                out.push(twin);
            }
        }
        out
    }

    /// Twins whose divergence does (`true`) or does not (`false`) exceed their threshold
    pub async fn list_by_divergence(&self, threshold_exceeded: bool) -> Vec<DigitalTwin> {
        self.snapshot_all()
            .await
            .into_iter()
            .filter(|t| t.divergence_exceeded() == threshold_exceeded)
            .collect()
    }

    /// Queue a change for the device. Returns the assigned sequence number.
    pub async fn append_pending_change(
        &self,
        id: &str,
        attribute: &str,
        value: AttrValue,
        decision_id: Option<DecisionId>,
    ) -> Result<u64, TwinError> {
        let slot = self.slot(id)?;
        let seq = {
            let mut twin = slot.twin.lock().await;
            let seq = twin.next_seq;
            if let Some(last) = twin.pending_changes.back() {
                if last.seq >= seq {
                    return Err(TwinError::InvariantViolation(format!(
                        "next_seq {} does not exceed queued seq {}",
                        seq, last.seq
                    )));
                }
            }
            twin.next_seq += 1;
            twin.pending_changes.push_back(PendingChange {
                seq,
                attribute: attribute.to_string(),
                value,
                submitted_at: Utc::now(),
                retries: 0,
                decision_id,
            });
            seq
        };

        debug!(twin_id = %id, seq, attribute, "Pending change appended");
        self.emit(id, TwinChange::PendingAppended { seq });
        Ok(seq)
    }

    /// Atomically remove and return every pending change in sequence order
    pub async fn drain_pending_changes(&self, id: &str) -> Result<Vec<PendingChange>, TwinError> {
        let slot = self.slot(id)?;
        let drained: Vec<PendingChange> = {
            let mut twin = slot.twin.lock().await;
            twin.pending_changes.drain(..).collect()
        };

        if !drained.is_empty() {
            let seqs = drained.iter().map(|c| c.seq).collect();
            self.emit(id, TwinChange::PendingDrained { seqs });
        }
        Ok(drained)
    }

    /// Remove the head of the pending queue after the device confirmed it and
    /// record its value as confirmed state.
    ///
    /// `seq` must be the head. Returns `None` when the change is already gone
    /// (dropped by a conflict since the write went out). A head older than
    /// `seq` means the queue was reordered.
    pub async fn pop_pending_change(
        &self,
        id: &str,
        seq: u64,
    ) -> Result<Option<PendingChange>, TwinError> {
        let slot = self.slot(id)?;
        let (popped, state_changed) = {
            let mut twin = slot.twin.lock().await;
            match twin.pending_changes.front() {
                Some(head) if head.seq == seq => {}
                Some(head) if head.seq > seq => return Ok(None),
                Some(head) => {
                    return Err(TwinError::InvariantViolation(format!(
                        "pending queue head seq {} precedes applied seq {}",
                        head.seq, seq
                    )))
                }
                None => return Ok(None),
            }
            match twin.pending_changes.pop_front() {
                Some(change) => {
                    let previous = twin
                        .last_known_state
                        .insert(change.attribute.clone(), change.value.clone());
                    let changed = previous.as_ref() != Some(&change.value);
                    (change, changed)
                }
                None => return Ok(None),
            }
        };

        self.emit(id, TwinChange::PendingDrained { seqs: vec![seq] });
        if state_changed {
            self.emit(
                id,
                TwinChange::StateUpdated {
                    attributes: vec![popped.attribute.clone()],
                },
            );
        }
        Ok(Some(popped))
    }

    /// Record intent for one or more attributes
    pub async fn set_desired(
        &self,
        id: &str,
        changes: &BTreeMap<String, AttrValue>,
    ) -> Result<(), TwinError> {
        let slot = self.slot(id)?;
        {
            let mut twin = slot.twin.lock().await;
            for (attribute, value) in changes {
                twin.desired_state.insert(attribute.clone(), value.clone());
            }
            twin.divergence_score = twin_divergence(&twin);
        }
        self.emit(
            id,
            TwinChange::DesiredUpdated {
                attributes: changes.keys().cloned().collect(),
            },
        );
        Ok(())
    }

    /// Acknowledge drift: make the confirmed state the new intent
    pub async fn accept_actual(&self, id: &str) -> Result<(), TwinError> {
        let slot = self.slot(id)?;
        let attributes = {
            let mut twin = slot.twin.lock().await;
            let attributes: Vec<String> = twin.desired_state.keys().cloned().collect();
            twin.desired_state.clear();
            twin.divergence_score = 0.0;
            attributes
        };
        info!(twin_id = %id, "Desired state reset to confirmed state");
        self.emit(id, TwinChange::DesiredUpdated { attributes });
        Ok(())
    }

    /// Clear an error quarantine so the twin is synced again.
    ///
    /// A queue that breaks sequence ordering cannot be replayed safely, so it
    /// is discarded and intent falls back to confirmed state. Returns the
    /// discarded changes; an intact queue is kept.
    pub async fn reset_twin(&self, id: &str) -> Result<Vec<PendingChange>, TwinError> {
        let slot = self.slot(id)?;
        let (discarded, reason) = {
            let mut twin = slot.twin.lock().await;
            let verdict = twin.check_sequence_order();
            twin.connectivity = Connectivity::Unknown;
            match verdict {
                Ok(()) => (Vec::new(), String::new()),
                Err(reason) => {
                    let discarded: Vec<PendingChange> = twin.pending_changes.drain(..).collect();
                    if let Some(max) = discarded.iter().map(|c| c.seq).max() {
                        twin.next_seq = twin.next_seq.max(max + 1);
                    }
                    let attributes: BTreeSet<String> =
                        discarded.iter().map(|c| c.attribute.clone()).collect();
                    for attribute in &attributes {
                        twin.settle_desired(attribute);
                    }
                    twin.divergence_score = twin_divergence(&twin);
                    (discarded, reason)
                }
            }
        };

        if !discarded.is_empty() {
            warn!(twin_id = %id, count = discarded.len(), %reason, "Discarded corrupt pending queue");
        }
        for change in &discarded {
            self.emit(
                id,
                TwinChange::PendingDropped {
                    seq: change.seq,
                    reason: format!("discarded on reset: {}", reason),
                },
            );
        }
        info!(twin_id = %id, "Twin reset");
        self.emit(id, TwinChange::Reset);
        Ok(discarded)
    }

    /// Quarantine a twin after an invariant violation
    pub async fn quarantine(&self, id: &str, reason: impl Into<String>) -> Result<(), TwinError> {
        let reason = reason.into();
        error!(twin_id = %id, %reason, "Twin quarantined");
        self.mutate(id, |twin| {
            twin.connectivity = Connectivity::Error { reason };
            ((), vec![TwinChange::ConnectivityUpdated])
        })
        .await
    }

    /// Stamp the last sync attempt. Scheduling metadata only, so no
    /// `twin_changed` is published.
    pub async fn record_sync(&self, id: &str, at: DateTime<Utc>) -> Result<(), TwinError> {
        let slot = self.slot(id)?;
        slot.twin.lock().await.last_sync_timestamp = Some(at);
        Ok(())
    }

    /// Hold the twin for a full sync cycle so cycles on one twin never interleave
    pub async fn sync_guard(&self, id: &str) -> Result<OwnedMutexGuard<()>, TwinError> {
        let slot = self.slot(id)?;
        Ok(Arc::clone(&slot.sync_guard).lock_owned().await)
    }

    /// Apply a mutation under the twin's lock and emit the reported changes.
    ///
    /// Confirmed state is only ever written through here, and only the sync
    /// engine calls it.
    pub(crate) async fn mutate<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut DigitalTwin) -> (R, Vec<TwinChange>),
    ) -> Result<R, TwinError> {
        let slot = self.slot(id)?;
        let (result, changes) = {
            let mut twin = slot.twin.lock().await;
            f(&mut twin)
        };
        for change in changes {
            self.emit(id, change);
        }
        Ok(result)
    }
}
