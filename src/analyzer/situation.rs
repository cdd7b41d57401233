//! Situational model - one per scope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::emotion::{rank_factors, EmotionalState, Factor, FactorContribution, FactorWeights};
use super::stats::RollingStats;
use crate::bus::{Observation, ObservationKind, ObservationSource};
use crate::config::AnalyzerConfig;
use crate::models::{attr_key, span_secs, AttrValue, ScopeId, TwinId};
use crate::twin::Connectivity;

/// Weight of a new sample in the decision success average
const SUCCESS_EMA_ALPHA: f64 = 0.2;

/// Weight of a new sample in the satisfaction average
const SATISFACTION_EMA_ALPHA: f64 = 0.3;

/// Satisfaction implied by a user overriding an automated change
const OVERRIDE_SATISFACTION: f64 = 0.25;

/// Errors at which the health factor bottoms out
const ERROR_SATURATION: f64 = 4.0;

/// Active anomalies at which novelty saturates
const NOVELTY_SATURATION: f64 = 3.0;

/// An attribute reading that departed from its recent history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFlag {
    /// `twin/attribute`
    pub key: String,
    pub z_score: f64,
    pub value: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DivergenceMark {
    score: f64,
    at: DateTime<Utc>,
}

/// Read-only view of a scope's situational model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SituationSnapshot {
    pub scope: ScopeId,
    pub emotion: EmotionalState,
    /// Latest value per `twin/attribute`
    pub latest: BTreeMap<String, AttrValue>,
    pub anomalies: Vec<AnomalyFlag>,
    pub offline: Vec<TwinId>,
    /// Twins with a recent divergence alert, with their score
    pub divergent: BTreeMap<TwinId, f64>,
    /// Factor contributions of the last update, in factor order
    pub factors: Vec<FactorContribution>,
    pub trigger: String,
    pub updates: u64,
    pub taken_at: DateTime<Utc>,
}

impl SituationSnapshot {
    pub fn value(&self, twin_id: &str, attribute: &str) -> Option<&AttrValue> {
        self.latest.get(&attr_key(twin_id, attribute))
    }

    pub fn is_offline(&self, twin_id: &str) -> bool {
        self.offline.iter().any(|t| t == twin_id)
    }

    pub fn anomaly_active(&self, key: &str) -> bool {
        self.anomalies.iter().any(|a| a.key == key)
    }

    /// The factor that moved the model most in the last update
    pub fn top_factor(&self) -> Option<Factor> {
        rank_factors(&self.factors)
            .into_iter()
            .find(|c| c.magnitude > 0.0)
            .map(|c| c.factor)
    }

    /// One-line summary for decision records
    pub fn summary(&self) -> String {
        format!(
            "{}: {} {:.2}; {} anomalies, {} offline, {} divergent",
            self.scope,
            self.emotion.primary,
            self.emotion.intensity,
            self.anomalies.len(),
            self.offline.len(),
            self.divergent.len()
        )
    }
}

/// Everything the analyzer knows about one scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SituationalModel {
    pub scope: ScopeId,
    stats: BTreeMap<String, RollingStats>,
    latest: BTreeMap<String, AttrValue>,
    anomalies: BTreeMap<String, AnomalyFlag>,
    /// Per-twin reachability; `true` when online
    connectivity: BTreeMap<TwinId, bool>,
    divergence: BTreeMap<TwinId, DivergenceMark>,
    /// Recent failures, decaying with the emotional state
    errors: f64,
    last_interaction: Option<DateTime<Utc>>,
    satisfaction: f64,
    success_ema: f64,
    previous_success_ema: f64,
    emotion: EmotionalState,
    factors: Vec<FactorContribution>,
    updates: u64,
}

impl SituationalModel {
    pub fn new(scope: ScopeId, config: &AnalyzerConfig, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            stats: BTreeMap::new(),
            latest: BTreeMap::new(),
            anomalies: BTreeMap::new(),
            connectivity: BTreeMap::new(),
            divergence: BTreeMap::new(),
            errors: 0.0,
            last_interaction: None,
            satisfaction: 0.5,
            success_ema: 0.5,
            previous_success_ema: 0.5,
            emotion: EmotionalState::at_baseline(config.baseline, now),
            factors: Vec::new(),
            updates: 0,
        }
    }

    pub fn emotion(&self) -> &EmotionalState {
        &self.emotion
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Idle decay, run on the scope's decay tick
    pub fn decay_to(&mut self, now: DateTime<Utc>, config: &AnalyzerConfig) {
        let elapsed = (now - self.emotion.updated_at).num_milliseconds();
        if elapsed > 0 {
            let factor = (-config.decay_rate_per_sec * elapsed as f64 / 1000.0).exp();
            self.errors *= factor;
        }
        self.emotion
            .decay_to(now, config.baseline, config.decay_rate_per_sec);
        self.expire_divergence(now, config);
    }

    /// Advance the model with one observation
    pub fn observe(
        &mut self,
        obs: &Observation,
        config: &AnalyzerConfig,
        weights: &FactorWeights,
    ) -> SituationSnapshot {
        self.decay_to(obs.timestamp, config);
        let trigger = self.absorb(obs, config);

        let now = self.emotion.updated_at.max(obs.timestamp);
        let signals = self.signals(now, config);
        self.factors = self.emotion.apply(&signals, weights, config.step_gain);
        self.emotion.trigger = trigger;
        self.previous_success_ema = self.success_ema;
        self.updates += 1;

        debug!(
            scope = %self.scope,
            primary = %self.emotion.primary,
            intensity = self.emotion.intensity,
            "Situation updated"
        );
        self.snapshot(now)
    }

    /// Re-evaluate without new information, for externally requested triggers
    pub fn touch(
        &mut self,
        reason: &str,
        now: DateTime<Utc>,
        config: &AnalyzerConfig,
    ) -> SituationSnapshot {
        self.decay_to(now, config);
        self.emotion.trigger = format!("manual:{}", reason);
        self.snapshot(now)
    }

    pub fn snapshot(&self, taken_at: DateTime<Utc>) -> SituationSnapshot {
        SituationSnapshot {
            scope: self.scope.clone(),
            emotion: self.emotion.clone(),
            latest: self.latest.clone(),
            anomalies: self.anomalies.values().cloned().collect(),
            offline: self
                .connectivity
                .iter()
                .filter(|(_, online)| !**online)
                .map(|(id, _)| id.clone())
                .collect(),
            divergent: self
                .divergence
                .iter()
                .map(|(id, mark)| (id.clone(), mark.score))
                .collect(),
            factors: self.factors.clone(),
            trigger: self.emotion.trigger.clone(),
            updates: self.updates,
            taken_at,
        }
    }

    /// Fold the observation into the model state. Returns the trigger label.
    fn absorb(&mut self, obs: &Observation, config: &AnalyzerConfig) -> String {
        match &obs.kind {
            ObservationKind::Reading => {
                let attribute = obs.attribute.as_deref().unwrap_or("value");
                let key = attr_key(&obs.subject, attribute);
                if let Some(value) = &obs.value {
                    self.record_reading(&key, value, obs.timestamp, config);
                }
                if obs.source == ObservationSource::User {
                    self.last_interaction = Some(obs.timestamp);
                }
                format!("reading:{}", key)
            }
            ObservationKind::ConnectivityChanged { current, .. } => {
                let online = matches!(current, Connectivity::Online | Connectivity::Unknown);
                self.connectivity.insert(obs.subject.clone(), online);
                if current.is_error() {
                    self.errors += 1.0;
                }
                format!("connectivity:{}:{}", obs.subject, current.label())
            }
            ObservationKind::DivergenceAlert { score, .. } => {
                self.divergence.insert(
                    obs.subject.clone(),
                    DivergenceMark {
                        score: *score,
                        at: obs.timestamp,
                    },
                );
                format!("divergence:{}", obs.subject)
            }
            ObservationKind::ConflictResolved { record } => {
                // Someone changed the device by hand, overriding queued intent
                self.last_interaction = Some(obs.timestamp);
                self.blend_satisfaction(OVERRIDE_SATISFACTION);
                let key = attr_key(&obs.subject, &record.attribute);
                self.latest.insert(key.clone(), record.observed_value.clone());
                format!("conflict:{}", key)
            }
            ObservationKind::DecisionOutcome {
                decision_id,
                success,
                ..
            } => {
                let sample = if *success { 1.0 } else { 0.0 };
                self.success_ema += SUCCESS_EMA_ALPHA * (sample - self.success_ema);
                if !success {
                    self.errors += 1.0;
                }
                format!("outcome:{}", decision_id)
            }
            ObservationKind::UserFeedback { satisfaction, .. } => {
                self.last_interaction = Some(obs.timestamp);
                self.blend_satisfaction(*satisfaction);
                "feedback".to_string()
            }
            other => other.name().to_string(),
        }
    }

    fn record_reading(
        &mut self,
        key: &str,
        value: &AttrValue,
        at: DateTime<Utc>,
        config: &AnalyzerConfig,
    ) {
        self.latest.insert(key.to_string(), value.clone());

        let Some(number) = value.as_f64().filter(|_| value.is_number()) else {
            return;
        };
        let stats = self
            .stats
            .entry(key.to_string())
            .or_insert_with(|| RollingStats::new(config.window));

        match stats.push(number, config.min_samples) {
            Some(z) if z.abs() > config.z_threshold => {
                info!(scope = %self.scope, key, z_score = z, value = number, "Anomaly detected");
                self.anomalies.insert(
                    key.to_string(),
                    AnomalyFlag {
                        key: key.to_string(),
                        z_score: z,
                        value: number,
                        detected_at: at,
                    },
                );
            }
            _ => {
                if self.anomalies.remove(key).is_some() {
                    debug!(scope = %self.scope, key, "Anomaly cleared");
                }
            }
        }
    }

    fn blend_satisfaction(&mut self, sample: f64) {
        let sample = sample.clamp(0.0, 1.0);
        self.satisfaction += SATISFACTION_EMA_ALPHA * (sample - self.satisfaction);
    }

    fn expire_divergence(&mut self, now: DateTime<Utc>, config: &AnalyzerConfig) {
        let ttl = span_secs(config.alert_ttl_secs);
        self.divergence.retain(|_, mark| now - mark.at <= ttl);
    }

    /// Factor signals in `[-1, 1]`, in factor order
    fn signals(&self, now: DateTime<Utc>, config: &AnalyzerConfig) -> Vec<(Factor, f64)> {
        Factor::ALL
            .iter()
            .map(|factor| (*factor, self.signal(*factor, now, config).clamp(-1.0, 1.0)))
            .collect()
    }

    fn signal(&self, factor: Factor, now: DateTime<Utc>, config: &AnalyzerConfig) -> f64 {
        match factor {
            Factor::SystemHealth => {
                let known = self.connectivity.len();
                let online_fraction = if known == 0 {
                    1.0
                } else {
                    self.connectivity.values().filter(|o| **o).count() as f64 / known as f64
                };
                let error_penalty = (self.errors / ERROR_SATURATION).min(1.0);
                (2.0 * online_fraction - 1.0) - error_penalty
            }
            Factor::Interaction => {
                let Some(last) = self.last_interaction else {
                    return 0.0;
                };
                let horizon = config.interaction_horizon_secs.max(1) as f64;
                let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                let recency = (1.0 - elapsed / horizon).max(0.0);
                recency * (2.0 * self.satisfaction - 1.0)
            }
            Factor::Comfort => {
                let mut deviations = Vec::new();
                for target in &config.comfort {
                    let suffix = format!("/{}", target.attribute);
                    for (key, value) in &self.latest {
                        if !key.ends_with(&suffix) || !value.is_number() {
                            continue;
                        }
                        if let Some(v) = value.as_f64() {
                            let tolerance = target.tolerance.max(f64::EPSILON);
                            deviations.push(((v - target.target).abs() / tolerance).min(1.0));
                        }
                    }
                }
                if deviations.is_empty() {
                    return 0.0;
                }
                let mean = deviations.iter().sum::<f64>() / deviations.len() as f64;
                1.0 - 2.0 * mean
            }
            Factor::TaskCompletion => 2.0 * self.success_ema - 1.0,
            Factor::LearningProgress => (self.success_ema - self.previous_success_ema) * 10.0,
            Factor::Novelty => (self.anomalies.len() as f64 / NOVELTY_SATURATION).min(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ObservationSource;
    use chrono::Duration;
    use crate::config::ComfortTarget;

    fn config() -> AnalyzerConfig {
        AnalyzerConfig {
            comfort: vec![ComfortTarget {
                attribute: "temp".into(),
                target: 70.0,
                tolerance: 5.0,
            }],
            ..Default::default()
        }
    }

    fn reading(value: f64, at: DateTime<Utc>) -> Observation {
        Observation::reading("thermostat", "temp", value, ObservationSource::Sensor).at(at)
    }

    #[test]
    fn test_spike_flags_anomaly_and_normal_reading_clears_it() {
        let config = config();
        let start = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, start);
        let weights = FactorWeights::new();

        for (i, v) in [70.0, 71.0, 70.0, 69.0, 70.0, 71.0].iter().enumerate() {
            model.observe(&reading(*v, start + Duration::seconds(i as i64)), &config, &weights);
        }
        let snap = model.observe(&reading(95.0, start + Duration::seconds(10)), &config, &weights);
        assert!(snap.anomaly_active("thermostat/temp"));

        let snap = model.observe(&reading(70.0, start + Duration::seconds(11)), &config, &weights);
        assert!(!snap.anomaly_active("thermostat/temp"));
    }

    #[test]
    fn test_offline_device_raises_worry() {
        let config = config();
        let now = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, now);
        let obs = Observation::internal(
            "thermostat",
            ObservationKind::ConnectivityChanged {
                previous: Connectivity::Online,
                current: Connectivity::Offline,
            },
        )
        .at(now);

        let snap = model.observe(&obs, &config, &FactorWeights::new());
        assert!(snap.is_offline("thermostat"));
        assert!(snap.emotion.worry > config.baseline);
        assert_eq!(snap.top_factor(), Some(Factor::SystemHealth));
    }

    #[test]
    fn test_divergence_mark_expires() {
        let config = config();
        let now = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, now);
        let alert = Observation::internal(
            "thermostat",
            ObservationKind::DivergenceAlert { score: 0.4, threshold: 0.1 },
        )
        .at(now);

        let snap = model.observe(&alert, &config, &FactorWeights::new());
        assert_eq!(snap.divergent.get("thermostat"), Some(&0.4));

        let later = now + Duration::seconds(config.alert_ttl_secs as i64 + 1);
        model.decay_to(later, &config);
        assert!(model.snapshot(later).divergent.is_empty());
    }

    #[test]
    fn test_unbounded_alert_ttl_keeps_mark() {
        let config = AnalyzerConfig {
            alert_ttl_secs: u64::MAX,
            ..config()
        };
        let now = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, now);
        let alert = Observation::internal(
            "thermostat",
            ObservationKind::DivergenceAlert { score: 0.4, threshold: 0.1 },
        )
        .at(now);
        model.observe(&alert, &config, &FactorWeights::new());

        let later = now + Duration::days(3650);
        model.decay_to(later, &config);
        assert_eq!(model.snapshot(later).divergent.get("thermostat"), Some(&0.4));
    }

    #[test]
    fn test_comfort_signal_follows_target_distance() {
        let config = config();
        let now = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, now);

        model.observe(&reading(70.0, now), &config, &FactorWeights::new());
        assert_eq!(model.signal(Factor::Comfort, now, &config), 1.0);

        model.observe(&reading(80.0, now), &config, &FactorWeights::new());
        assert_eq!(model.signal(Factor::Comfort, now, &config), -1.0);
    }

    #[test]
    fn test_feedback_counts_as_interaction() {
        let config = config();
        let now = Utc::now();
        let mut model = SituationalModel::new(ScopeId::house(), &config, now);
        let feedback = Observation::new(
            "house",
            ObservationSource::User,
            ObservationKind::UserFeedback {
                decision_id: None,
                satisfaction: 1.0,
                comment: None,
            },
        )
        .at(now);

        model.observe(&feedback, &config, &FactorWeights::new());
        assert!(model.signal(Factor::Interaction, now, &config) > 0.0);
    }
}
