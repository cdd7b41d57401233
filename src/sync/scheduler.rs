//! Per-twin sync scheduling
//!
//! One task per twin. Each task syncs once at start, then waits for the
//! twin's `sync_interval` plus random jitter, or for a nudge from
//! `submit_desired`, whichever comes first. Shutdown interrupts both the wait
//! and an in-flight cycle.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::engine::SyncEngine;
use crate::models::TwinId;

/// Spawns and owns the per-twin sync tasks
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    jitter: Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<HashMap<TwinId, JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, jitter: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            jitter,
            shutdown_tx,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start syncing every twin currently in the store
    pub async fn start_all(&self) {
        for id in self.engine.store().ids() {
            self.schedule(&id).await;
        }
    }

    /// Start the sync task for one twin (no-op when already running)
    pub async fn schedule(&self, twin_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if tasks.get(twin_id).map_or(false, |h| !h.is_finished()) {
            return;
        }

        let handle = tokio::spawn(sync_loop(
            Arc::clone(&self.engine),
            twin_id.to_string(),
            self.jitter,
            self.shutdown_tx.subscribe(),
        ));
        tasks.insert(twin_id.to_string(), handle);
        debug!(twin_id, "Sync task scheduled");
    }

    pub async fn running(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Stop every sync task, cancelling in-flight cycles
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Sync task ended abnormally");
            }
        }
        info!(tasks = count, "Sync scheduler stopped");
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

async fn sync_loop(
    engine: Arc<SyncEngine>,
    twin_id: TwinId,
    max_jitter: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let nudge = engine.notifier(&twin_id);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let quarantined = match engine.store().get(&twin_id).await {
            Ok(twin) => twin.connectivity.is_error(),
            Err(_) => {
                debug!(twin_id = %twin_id, "Twin removed, stopping sync task");
                break;
            }
        };

        if !quarantined {
            tokio::select! {
                result = engine.reconcile(&twin_id) => match result {
                    Ok(report) if report.quarantined.is_some() => {
                        error!(twin_id = %twin_id, reason = ?report.quarantined, "Twin quarantined during sync");
                    }
                    Ok(_) => {}
                    Err(e) => error!(twin_id = %twin_id, error = %e, "Sync cycle failed"),
                },
                _ = shutdown.changed() => {
                    debug!(twin_id = %twin_id, "Sync cycle cancelled by shutdown");
                    break;
                }
            }
        }

        let interval = match engine.store().get(&twin_id).await {
            Ok(twin) => twin.sync_interval,
            Err(_) => break,
        };
        let wait = interval + jitter(max_jitter);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = nudge.notified() => {
                debug!(twin_id = %twin_id, "Sync requested early");
            }
            _ = shutdown.changed() => break,
        }
    }
}
