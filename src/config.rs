//! Node configuration
//!
//! Loaded from TOML. Every field carries a serde default, so an empty file
//! (or no file at all) yields a runnable node.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::decider::constraints::SafetyConstraint;
use crate::decider::rules::{load_rules_file, Rule};
use crate::error::ConfigError;
use crate::models::{AttrValue, ScopeId};
use crate::sync::SyncEngineConfig;
use crate::twin::{DigitalTwin, FidelityLevel};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub decider: DeciderConfig,
    #[serde(default)]
    pub learner: LearnerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub twins: Vec<TwinConfig>,
    /// Inline decision rules, merged after `decider.rules_file`
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub constraints: Vec<SafetyConstraint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: String,

    /// Data directory (SQLite database lives here unless overridden)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sync interval for twins that don't set their own
    #[serde(default = "default_sync_interval")]
    pub default_interval_ms: u64,

    /// Upper bound of the random delay added to each interval
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,

    /// Bound on every device read and write
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,

    /// Device rejections tolerated before a pending change fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_divergence_threshold")]
    pub default_divergence_threshold: f64,

    /// Conflict records kept per twin
    #[serde(default = "default_conflict_history")]
    pub conflict_history: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: default_sync_interval(),
            jitter_ms: default_jitter(),
            io_timeout_ms: default_io_timeout(),
            max_retries: default_max_retries(),
            default_divergence_threshold: default_divergence_threshold(),
            conflict_history: default_conflict_history(),
        }
    }
}

impl SyncConfig {
    pub fn engine_config(&self) -> SyncEngineConfig {
        SyncEngineConfig {
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            max_retries: self.max_retries,
            conflict_history: self.conflict_history,
        }
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber buffer; slow subscribers lose their oldest entries
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// A comfort target for the comfort factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComfortTarget {
    /// Attribute name, matched on every twin in the scope
    pub attribute: String,
    pub target: f64,
    /// Deviation at which comfort bottoms out
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Samples kept per attribute for rolling statistics
    #[serde(default = "default_window")]
    pub window: usize,

    /// Samples needed before anomaly detection kicks in
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Z-score above which a reading is anomalous
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,

    /// Exponential decay rate of emotions toward baseline, per second
    #[serde(default = "default_decay_rate")]
    pub decay_rate_per_sec: f64,

    /// Resting value of every emotional dimension
    #[serde(default = "default_baseline")]
    pub baseline: f64,

    /// Scale of a single update step
    #[serde(default = "default_step_gain")]
    pub step_gain: f64,

    /// How long an interaction keeps influencing the interaction factor
    #[serde(default = "default_interaction_horizon")]
    pub interaction_horizon_secs: u64,

    /// How long a divergence alert keeps the twin marked divergent
    #[serde(default = "default_alert_ttl")]
    pub alert_ttl_secs: u64,

    /// Period of the idle decay tick per scope
    #[serde(default = "default_decay_tick")]
    pub decay_tick_ms: u64,

    #[serde(default)]
    pub comfort: Vec<ComfortTarget>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_samples: default_min_samples(),
            z_threshold: default_z_threshold(),
            decay_rate_per_sec: default_decay_rate(),
            baseline: default_baseline(),
            step_gain: default_step_gain(),
            interaction_horizon_secs: default_interaction_horizon(),
            alert_ttl_secs: default_alert_ttl(),
            decay_tick_ms: default_decay_tick(),
            comfort: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeciderConfig {
    /// Path to a YAML rules file (optional)
    #[serde(default)]
    pub rules_file: Option<String>,

    /// Cooldown for rules that don't set one
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: u64,

    /// Bounded queue in front of each scope worker
    #[serde(default = "default_scope_queue")]
    pub scope_queue: usize,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            rules_file: None,
            default_cooldown_secs: default_cooldown(),
            scope_queue: default_scope_queue(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerConfig {
    /// Step size of weight adjustments
    #[serde(default = "default_learning_rate")]
    pub rate: f64,

    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            rate: default_learning_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// SQLite database path (defaults to `<data_dir>/safla.db`)
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            path: None,
            checkpoint_interval_secs: default_checkpoint_interval(),
        }
    }
}

/// A twin declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwinConfig {
    pub id: String,
    pub device_id: String,
    #[serde(default)]
    pub scope: ScopeId,
    #[serde(default)]
    pub sync_interval_ms: Option<u64>,
    #[serde(default)]
    pub divergence_threshold: Option<f64>,
    #[serde(default)]
    pub fidelity: FidelityLevel,
    #[serde(default)]
    pub attribute_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub attribute_scales: BTreeMap<String, f64>,
    /// Seed state for the simulated device, also the twin's starting view
    #[serde(default)]
    pub initial_state: BTreeMap<String, AttrValue>,
}

impl TwinConfig {
    pub fn to_twin(&self, sync: &SyncConfig) -> DigitalTwin {
        let mut twin = DigitalTwin::new(&self.id, &self.device_id)
            .with_scope(self.scope.clone())
            .with_sync_interval(Duration::from_millis(
                self.sync_interval_ms.unwrap_or(sync.default_interval_ms),
            ))
            .with_divergence_threshold(
                self.divergence_threshold
                    .unwrap_or(sync.default_divergence_threshold),
            )
            .with_fidelity(self.fidelity);
        twin.attribute_weights = self.attribute_weights.clone();
        twin.attribute_scales = self.attribute_scales.clone();
        twin.last_known_state = self.initial_state.clone();
        twin
    }
}

// Defaults
fn default_node_id() -> String { "safla-node".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("/var/lib/safla") }
fn default_sync_interval() -> u64 { 30_000 }
fn default_jitter() -> u64 { 1_000 }
fn default_io_timeout() -> u64 { 3_000 }
fn default_max_retries() -> u32 { 3 }
fn default_divergence_threshold() -> f64 { 0.1 }
fn default_conflict_history() -> usize { 50 }
fn default_bus_capacity() -> usize { crate::bus::DEFAULT_BUS_CAPACITY }
fn default_tolerance() -> f64 { 5.0 }
fn default_window() -> usize { 20 }
fn default_min_samples() -> usize { 5 }
fn default_z_threshold() -> f64 { 2.5 }
fn default_decay_rate() -> f64 { 0.01 }
fn default_baseline() -> f64 { 0.3 }
fn default_step_gain() -> f64 { 0.05 }
fn default_interaction_horizon() -> u64 { 600 }
fn default_alert_ttl() -> u64 { 120 }
fn default_decay_tick() -> u64 { 5_000 }
fn default_cooldown() -> u64 { 300 }
fn default_scope_queue() -> usize { 256 }
fn default_learning_rate() -> f64 { 0.05 }
fn default_min_weight() -> f64 { 0.1 }
fn default_max_weight() -> f64 { 3.0 }
fn default_checkpoint_interval() -> u64 { 60 }

impl Config {
    /// Load from a TOML file, falling back to defaults when it doesn't exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject configurations the runtime can't honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        let learner = &self.learner;
        if learner.min_weight > learner.max_weight {
            return invalid(format!(
                "learner.min_weight {} exceeds learner.max_weight {}",
                learner.min_weight, learner.max_weight
            ));
        }
        if learner.rate < 0.0 {
            return invalid(format!("learner.rate {} is negative", learner.rate));
        }

        check_unit("sync.default_divergence_threshold", self.sync.default_divergence_threshold)?;
        check_unit("analyzer.baseline", self.analyzer.baseline)?;

        if self.bus.capacity == 0 {
            return invalid("bus.capacity must be at least 1".to_string());
        }
        if self.decider.scope_queue == 0 {
            return invalid("decider.scope_queue must be at least 1".to_string());
        }
        if self.analyzer.window < 2 {
            return invalid(format!("analyzer.window {} is below 2", self.analyzer.window));
        }
        for target in &self.analyzer.comfort {
            if target.tolerance <= 0.0 {
                return invalid(format!(
                    "comfort tolerance for {} must be positive",
                    target.attribute
                ));
            }
        }

        let mut twin_ids = HashSet::new();
        for twin in &self.twins {
            if !twin_ids.insert(twin.id.as_str()) {
                return invalid(format!("duplicate twin id {}", twin.id));
            }
            if let Some(threshold) = twin.divergence_threshold {
                check_unit(&format!("twins.{}.divergence_threshold", twin.id), threshold)?;
            }
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rules {
            if !rule_names.insert(rule.name.as_str()) {
                return invalid(format!("duplicate rule name {}", rule.name));
            }
        }

        let mut constraint_ids = HashSet::new();
        for constraint in &self.constraints {
            if !constraint_ids.insert(constraint.id.as_str()) {
                return invalid(format!("duplicate constraint id {}", constraint.id));
            }
        }

        Ok(())
    }

    /// Rules from `decider.rules_file` followed by the inline `[[rules]]`
    pub fn effective_rules(&self) -> Result<Vec<Rule>, ConfigError> {
        let mut rules = match &self.decider.rules_file {
            Some(path) => load_rules_file(path)?,
            None => Vec::new(),
        };
        rules.extend(self.rules.iter().cloned());
        Ok(rules)
    }

    /// SQLite path, defaulting into the data directory
    pub fn database_path(&self) -> PathBuf {
        self.persistence
            .path
            .clone()
            .unwrap_or_else(|| self.node.data_dir.join("safla.db"))
    }
}

fn invalid(reason: String) -> Result<(), ConfigError> {
    Err(ConfigError::Invalid(reason))
}

fn check_unit(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return invalid(format!("{} = {} is outside [0, 1]", name, value));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.bus.capacity, crate::bus::DEFAULT_BUS_CAPACITY);
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_twin_config_falls_back_to_sync_defaults() {
        let config = Config::from_toml_str(
            r#"
[sync]
default_interval_ms = 5000

[[twins]]
id = "thermostat"
device_id = "zigbee-01"
scope = "room:living"
initial_state = { temp = 72.0, mode = "heat" }
"#,
        )
        .unwrap();

        let twin = config.twins[0].to_twin(&config.sync);
        assert_eq!(twin.sync_interval, Duration::from_millis(5000));
        assert_eq!(twin.divergence_threshold, 0.1);
        assert_eq!(twin.scope.as_str(), "room:living");
        assert_eq!(config.twins[0].initial_state["mode"], AttrValue::from("heat"));
    }

    #[test]
    fn test_min_weight_above_max_is_invalid() {
        let mut config = Config::default();
        config.learner.min_weight = 5.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_database_path_defaults_into_data_dir() {
        let mut config = Config::default();
        config.node.data_dir = PathBuf::from("/tmp/safla");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/safla/safla.db"));
    }
}
