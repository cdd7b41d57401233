//! Runtime - wires the SAFLA loop together
//!
//! ```text
//!   device adapter <-> sync engine <-> twin store
//!                          |               |
//!                          v               v
//!                     observation bus (broadcast)
//!                      |             |
//!                   router        learner
//!                      |
//!          per-scope worker: analyze -> decide -> record -> dispatch
//! ```
//!
//! Each scope has one worker fed by a bounded queue, so a scope handles one
//! observation at a time while scopes run in parallel.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::DeviceAdapter;
use crate::analyzer::{Analyzer, EmotionalState, SituationSnapshot};
use crate::bus::{Observation, ObservationBus, ObservationKind, ObservationSource, Subscription};
use crate::config::Config;
use crate::decider::{
    ConstraintRegistry, Decider, Decision, DecisionLog, DecisionStatus, RuleSet, Trigger,
};
use crate::error::{Result, RuntimeError};
use crate::learner::Learner;
use crate::models::{DecisionId, ScopeId};
use crate::persistence::Persistence;
use crate::sync::{SyncEngine, SyncScheduler};
use crate::twin::{DigitalTwin, TwinStore};

/// Work item for a scope worker
enum ScopeMessage {
    Observe(Observation),
    Trigger {
        reason: String,
        reply: oneshot::Sender<Option<Decision>>,
    },
}

/// Everything a scope worker needs, shared between tasks
struct Core {
    config: Config,
    bus: ObservationBus,
    store: Arc<TwinStore>,
    engine: Arc<SyncEngine>,
    analyzer: Arc<Analyzer>,
    decider: Arc<Decider>,
    log: Arc<DecisionLog>,
    learner: Arc<Learner>,
    workers: DashMap<ScopeId, mpsc::Sender<ScopeMessage>>,
    worker_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Observations the router could not queue because a scope was saturated
    queue_dropped: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct Runtime {
    core: Arc<Core>,
    scheduler: SyncScheduler,
    persistence: Arc<dyn Persistence>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Build every component from configuration. Nothing runs until `start`.
    pub fn new(
        config: Config,
        adapter: Arc<dyn DeviceAdapter>,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = ObservationBus::new(config.bus.capacity);
        let store = Arc::new(TwinStore::new(bus.clone()));
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            adapter,
            bus.clone(),
            config.sync.engine_config(),
        ));
        let scheduler = SyncScheduler::new(Arc::clone(&engine), config.sync.jitter());

        let constraints = Arc::new(ConstraintRegistry::new(config.constraints.clone()));
        let decider = Arc::new(Decider::new(Arc::clone(&store), constraints));
        let rules = config.effective_rules()?;
        info!(rules = rules.len(), constraints = config.constraints.len(), "Decision rules loaded");
        decider.register_source(Arc::new(RuleSet::new(rules, config.decider.default_cooldown_secs)));

        let log = Arc::new(DecisionLog::default());
        let learner = Arc::new(Learner::new(config.learner.clone(), Arc::clone(&log)));
        let analyzer = Arc::new(Analyzer::new(config.analyzer.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::new(Core {
            config,
            bus,
            store,
            engine,
            analyzer,
            decider,
            log,
            learner,
            workers: DashMap::new(),
            worker_tasks: std::sync::Mutex::new(Vec::new()),
            queue_dropped: AtomicU64::new(0),
            shutdown_rx,
        });

        Ok(Self {
            core,
            scheduler,
            persistence,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recover from the last checkpoint, then start routing, learning,
    /// syncing and checkpointing
    pub async fn start(&self) -> Result<()> {
        self.recover().await?;

        let router = tokio::spawn(route(Arc::clone(&self.core), self.core.bus.subscribe()));
        let learner = tokio::spawn(Arc::clone(&self.core.learner).run(
            self.core.bus.subscribe().filtered(Learner::wants),
            self.shutdown_tx.subscribe(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(router);
        tasks.push(learner);

        let interval = self.core.config.persistence.checkpoint_interval_secs;
        if interval > 0 {
            tasks.push(tokio::spawn(checkpoint_loop(
                Arc::clone(&self.core),
                Arc::clone(&self.persistence),
                Duration::from_secs(interval),
                self.shutdown_tx.subscribe(),
            )));
        }
        drop(tasks);

        self.scheduler.start_all().await;
        info!(
            node_id = %self.core.config.node.id,
            twins = self.core.store.len(),
            "SAFLA runtime started"
        );
        Ok(())
    }

    /// Reload twins, decisions, models and weights. Configured twins missing
    /// from the checkpoint are created from configuration.
    async fn recover(&self) -> Result<()> {
        let twins = self.persistence.load_twins().await?;
        let recovered = twins.len();
        for twin in twins {
            self.core.store.upsert(twin).await;
        }
        for twin_config in &self.core.config.twins {
            if !self.core.store.contains(&twin_config.id) {
                self.core.store.upsert(twin_config.to_twin(&self.core.config.sync)).await;
            }
        }

        let decisions = self.persistence.load_decisions().await?;
        let decision_count = decisions.len();
        for decision in decisions {
            self.core.log.record(decision);
        }

        let models = self.persistence.load_models().await?;
        let model_count = models.len();
        for model in models {
            self.core.analyzer.restore(model);
        }

        if let Some(weights) = self.persistence.load_weights().await? {
            self.core.learner.restore(weights).await;
        }

        info!(
            twins = recovered,
            decisions = decision_count,
            models = model_count,
            "Recovered from checkpoint"
        );
        Ok(())
    }

    /// Write twins, decisions, models and weights to persistence
    pub async fn checkpoint(&self) -> Result<()> {
        checkpoint(&self.core, self.persistence.as_ref()).await
    }

    /// Stop every task and write a final checkpoint
    pub async fn shutdown(&self) -> Result<()> {
        info!("SAFLA runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.shutdown().await;

        let mut handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        handles.extend(
            self.core
                .worker_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..),
        );
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Runtime task ended abnormally");
            }
        }
        self.core.workers.clear();

        self.checkpoint().await
    }

    //=========================================================================
    // API
    //=========================================================================

    pub fn situation(&self, scope: &ScopeId) -> Option<SituationSnapshot> {
        self.core.analyzer.snapshot(scope)
    }

    pub fn emotional_state(&self, scope: &ScopeId) -> Option<EmotionalState> {
        self.core.analyzer.emotional_state(scope)
    }

    /// Run a decision cycle for `scope` now, through the scope's worker like
    /// any other trigger. Resolves once the decision is recorded.
    pub async fn trigger(&self, scope: &ScopeId, reason: &str) -> Result<Option<Decision>> {
        if *self.shutdown_tx.borrow() {
            return Err(RuntimeError::ShutDown);
        }
        let worker = worker_for(&self.core, scope);
        let (reply, response) = oneshot::channel();
        worker
            .send(ScopeMessage::Trigger {
                reason: reason.to_string(),
                reply,
            })
            .await
            .map_err(|_| RuntimeError::ShutDown)?;
        response.await.map_err(|_| RuntimeError::ShutDown)
    }

    pub fn subscribe(&self) -> Subscription {
        self.core.bus.subscribe()
    }

    /// Up to `n` most recent decisions for a scope, newest first
    pub fn decisions(&self, scope: &ScopeId, n: usize) -> Vec<Decision> {
        self.core.log.recent(scope, n)
    }

    pub fn decision(&self, id: &str) -> Result<Decision> {
        self.core
            .log
            .get(id)
            .ok_or_else(|| RuntimeError::DecisionNotFound(id.to_string()))
    }

    /// Publish user feedback. With a decision id it also trains the learner.
    pub fn submit_feedback(
        &self,
        scope: &ScopeId,
        decision_id: Option<DecisionId>,
        satisfaction: f64,
        comment: Option<String>,
    ) -> Result<()> {
        if let Some(id) = &decision_id {
            if self.core.log.get(id).is_none() {
                return Err(RuntimeError::DecisionNotFound(id.clone()));
            }
        }
        self.core.bus.publish(Observation::new(
            scope.as_str(),
            ObservationSource::User,
            ObservationKind::UserFeedback {
                decision_id,
                satisfaction: satisfaction.clamp(0.0, 1.0),
                comment,
            },
        ));
        Ok(())
    }

    /// Add or replace a twin and start syncing it
    pub async fn add_twin(&self, twin: DigitalTwin) {
        let id = twin.id.clone();
        self.core.store.upsert(twin).await;
        self.scheduler.schedule(&id).await;
    }

    pub async fn twin(&self, id: &str) -> Result<DigitalTwin> {
        Ok(self.core.store.get(id).await?)
    }

    /// Clear a quarantine, discarding a pending queue that broke ordering.
    /// Returns how many changes were discarded.
    pub async fn reset_twin(&self, id: &str) -> Result<usize> {
        let discarded = self.core.engine.reset_twin(id).await?;
        self.scheduler.schedule(id).await;
        Ok(discarded.len())
    }

    /// Adopt the device's confirmed state as desired
    pub async fn accept_actual(&self, id: &str) -> Result<()> {
        self.core.store.accept_actual(id).await?;
        self.core.engine.request_sync(id);
        Ok(())
    }

    /// Bus subscribers' losses plus observations refused by saturated scope queues
    pub fn dropped_observations(&self) -> u64 {
        self.core.bus.dropped_observations() + self.core.queue_dropped.load(Ordering::Relaxed)
    }

    pub fn store(&self) -> &Arc<TwinStore> {
        &self.core.store
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.core.engine
    }

    /// For registering extra candidate sources and forward models
    pub fn decider(&self) -> &Arc<Decider> {
        &self.core.decider
    }

    pub fn learner(&self) -> &Arc<Learner> {
        &self.core.learner
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

//=============================================================================
// TASKS
//=============================================================================

/// Forward relevant bus traffic to the owning scope's worker
async fn route(core: Arc<Core>, mut subscription: Subscription) {
    let mut shutdown = core.shutdown_rx.clone();
    loop {
        let obs = tokio::select! {
            obs = subscription.recv() => match obs {
                Some(obs) => obs,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        if !Analyzer::is_relevant(&obs) {
            continue;
        }

        let scope = scope_of(&core, &obs).await;
        let worker = worker_for(&core, &scope);
        match worker.try_send(ScopeMessage::Observe(obs)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                core.queue_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(scope = %scope, "Scope queue full, observation dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
    debug!("Router stopped");
}

/// Feedback addresses a scope directly; everything else is about a twin
async fn scope_of(core: &Core, obs: &Observation) -> ScopeId {
    if matches!(obs.kind, ObservationKind::UserFeedback { .. }) {
        return ScopeId(obs.subject.clone());
    }
    match core.store.get(&obs.subject).await {
        Ok(twin) => twin.scope,
        Err(_) => ScopeId::house(),
    }
}

/// The scope's queue, spawning its worker on first use
fn worker_for(core: &Arc<Core>, scope: &ScopeId) -> mpsc::Sender<ScopeMessage> {
    if let Some(tx) = core.workers.get(scope) {
        return tx.clone();
    }
    core.workers
        .entry(scope.clone())
        .or_insert_with(|| {
            let (tx, rx) = mpsc::channel(core.config.decider.scope_queue.max(1));
            let handle = tokio::spawn(scope_worker(Arc::clone(core), scope.clone(), rx));
            core.worker_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
            debug!(scope = %scope, "Scope worker started");
            tx
        })
        .clone()
}

async fn scope_worker(core: Arc<Core>, scope: ScopeId, mut rx: mpsc::Receiver<ScopeMessage>) {
    let mut shutdown = core.shutdown_rx.clone();
    let mut decay = tokio::time::interval(Duration::from_millis(core.config.analyzer.decay_tick_ms.max(1)));
    decay.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(ScopeMessage::Observe(obs)) => core.on_observation(&scope, obs).await,
                Some(ScopeMessage::Trigger { reason, reply }) => {
                    let decision = core.on_trigger(&scope, &reason).await;
                    let _ = reply.send(decision);
                }
                None => break,
            },
            _ = decay.tick() => core.analyzer.decay(&scope, Utc::now()),
            _ = shutdown.changed() => break,
        }
    }
    debug!(scope = %scope, "Scope worker stopped");
}

async fn checkpoint_loop(
    core: Arc<Core>,
    persistence: Arc<dyn Persistence>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; recovery just ran
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = checkpoint(&core, persistence.as_ref()).await {
                    warn!(error = %e, "Checkpoint failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn checkpoint(core: &Core, persistence: &dyn Persistence) -> Result<()> {
    let twins = core.store.snapshot_all().await;
    let decisions = core.log.all();
    let models = core.analyzer.models();
    persistence.save_twins(&twins).await?;
    persistence.save_decisions(&decisions).await?;
    persistence.save_models(&models).await?;
    persistence.save_weights(&core.learner.weights().await).await?;
    debug!(
        twins = twins.len(),
        decisions = decisions.len(),
        models = models.len(),
        "Checkpoint written"
    );
    Ok(())
}

//=============================================================================
// SCOPE PIPELINE
//=============================================================================

impl Core {
    async fn on_observation(&self, scope: &ScopeId, obs: Observation) {
        let weights = self.learner.weights().await;
        let Some(snapshot) = self.analyzer.observe(scope, &obs, &weights.factor_weights) else {
            return;
        };
        self.publish_situation(scope, &snapshot);

        let trigger = Trigger::Observation {
            observation_id: obs.id.clone(),
            kind: obs.kind.name().to_string(),
            subject: obs.subject.clone(),
        };
        if let Some(decision) = self.decider.decide(scope, &snapshot, trigger, &weights).await {
            self.dispatch(decision).await;
        }
    }

    async fn on_trigger(&self, scope: &ScopeId, reason: &str) -> Option<Decision> {
        let weights = self.learner.weights().await;
        let snapshot = self.analyzer.touch(scope, reason);
        self.publish_situation(scope, &snapshot);

        let trigger = Trigger::Manual {
            reason: reason.to_string(),
        };
        let decision = self.decider.decide(scope, &snapshot, trigger, &weights).await?;
        Some(self.dispatch(decision).await)
    }

    fn publish_situation(&self, scope: &ScopeId, snapshot: &SituationSnapshot) {
        self.bus.publish(Observation::internal(
            scope.as_str(),
            ObservationKind::SituationUpdated {
                snapshot: Box::new(snapshot.clone()),
            },
        ));
    }

    /// Record the decision and hand its chosen action to the sync engine
    async fn dispatch(&self, decision: Decision) -> Decision {
        self.log.record(decision.clone());
        self.bus.publish(Observation::internal(
            decision.scope.as_str(),
            ObservationKind::DecisionRecorded {
                decision: Box::new(decision.clone()),
            },
        ));

        if decision.status != DecisionStatus::Dispatched {
            return decision;
        }
        let Some(action) = decision.chosen.as_ref() else {
            return decision;
        };

        match self
            .engine
            .submit_desired(&action.target, &action.changes, Some(decision.id.clone()))
            .await
        {
            Ok(seqs) => {
                debug!(decision_id = %decision.id, target = %action.target, ?seqs, "Decision dispatched");
            }
            Err(e) => {
                warn!(decision_id = %decision.id, target = %action.target, error = %e, "Dispatch failed");
                // The learner completes the decision from this outcome
                self.bus.publish(Observation::internal(
                    action.target.as_str(),
                    ObservationKind::DecisionOutcome {
                        decision_id: decision.id.clone(),
                        success: false,
                        detail: e.to_string(),
                    },
                ));
            }
        }
        decision
    }
}
