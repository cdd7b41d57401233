//! Configuration loading and validation

use std::io::Write;

use safla_node::config::{Config, PersistenceBackend};
use safla_node::decider::Condition;
use safla_node::error::ConfigError;
use safla_node::twin::FidelityLevel;
use safla_node::{AttrValue, ScopeId};

const FULL: &str = r#"
[node]
id = "kitchen-node"
data_dir = "/tmp/safla-test"

[sync]
default_interval_ms = 10000
jitter_ms = 250
io_timeout_ms = 1500
max_retries = 5
default_divergence_threshold = 0.2

[bus]
capacity = 64

[analyzer]
window = 30
z_threshold = 3.0

[[analyzer.comfort]]
attribute = "temp"
target = 70.0
tolerance = 4.0

[decider]
default_cooldown_secs = 60

[learner]
rate = 0.1
min_weight = 0.5
max_weight = 2.0

[persistence]
backend = "sqlite"
checkpoint_interval_secs = 30

[[twins]]
id = "thermostat"
device_id = "zigbee-0x42"
scope = "room:kitchen"
fidelity = "modeled"
divergence_threshold = 0.05

[twins.attribute_scales]
temp = 10.0

[twins.initial_state]
temp = 71.5
mode = "auto"

[[twins]]
id = "lamp"
device_id = "zigbee-0x43"

[[rules]]
name = "lamp_off_when_offline"
[rules.condition]
type = "device_offline"
twin = "thermostat"
[rules.action]
target = "lamp"
[rules.action.set]
on = false

[[constraints]]
id = "temp-ceiling"
severity = "critical"
[constraints.predicate]
type = "max_value"
attribute = "temp"
value = 78.0
"#;

#[test]
fn test_full_config_parses() {
    let config = Config::from_toml_str(FULL).unwrap();
    config.validate().unwrap();

    assert_eq!(config.node.id, "kitchen-node");
    assert_eq!(config.sync.max_retries, 5);
    assert_eq!(config.sync.engine_config().io_timeout.as_millis(), 1500);
    assert_eq!(config.bus.capacity, 64);
    assert_eq!(config.analyzer.window, 30);
    // Unset fields keep their defaults
    assert_eq!(config.analyzer.min_samples, 5);
    assert_eq!(config.analyzer.comfort[0].tolerance, 4.0);
    assert_eq!(config.persistence.backend, PersistenceBackend::Sqlite);
    assert_eq!(
        config.database_path(),
        std::path::PathBuf::from("/tmp/safla-test/safla.db")
    );
    assert_eq!(config.rules.len(), 1);
    assert!(matches!(config.rules[0].condition, Condition::DeviceOffline { .. }));
    assert_eq!(config.constraints[0].id, "temp-ceiling");
}

#[test]
fn test_twin_config_builds_twin() {
    let config = Config::from_toml_str(FULL).unwrap();

    let thermostat = config.twins[0].to_twin(&config.sync);
    assert_eq!(thermostat.scope, ScopeId::room("kitchen"));
    assert_eq!(thermostat.fidelity, FidelityLevel::Modeled);
    assert_eq!(thermostat.divergence_threshold, 0.05);
    assert_eq!(thermostat.sync_interval.as_millis(), 10_000);
    assert_eq!(thermostat.attribute_scales["temp"], 10.0);
    assert_eq!(thermostat.last_known_state["mode"], AttrValue::from("auto"));

    // Falls back to the sync section defaults
    let lamp = config.twins[1].to_twin(&config.sync);
    assert_eq!(lamp.scope, ScopeId::house());
    assert_eq!(lamp.divergence_threshold, 0.2);
}

#[test]
fn test_missing_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.node.id, "safla-node");
    assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
    assert!(config.twins.is_empty());
    config.validate().unwrap();
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.twins.len(), 2);
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let err = Config::from_toml_str("[sync\nmax_retries = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

fn invalid(toml: &str) -> String {
    match Config::from_toml_str(toml).unwrap().validate() {
        Err(ConfigError::Invalid(reason)) => reason,
        other => panic!("expected invalid config, got {:?}", other),
    }
}

#[test]
fn test_validation_rejects_inverted_weight_bounds() {
    let reason = invalid("[learner]\nmin_weight = 2.0\nmax_weight = 1.0\n");
    assert!(reason.contains("min_weight"));
}

#[test]
fn test_validation_rejects_threshold_outside_unit_range() {
    invalid("[sync]\ndefault_divergence_threshold = 1.5\n");
    invalid("[[twins]]\nid = \"a\"\ndevice_id = \"d\"\ndivergence_threshold = -0.1\n");
}

#[test]
fn test_validation_rejects_duplicate_twins() {
    let reason = invalid(
        "[[twins]]\nid = \"a\"\ndevice_id = \"d1\"\n\n[[twins]]\nid = \"a\"\ndevice_id = \"d2\"\n",
    );
    assert!(reason.contains("duplicate twin id a"));
}

#[test]
fn test_rules_file_merges_before_inline_rules() {
    let mut rules_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    rules_file
        .write_all(
            br#"
rules:
  - name: night_mode
    priority: 5
    condition:
      type: always
    action:
      target: lamp
      set:
        on: false
"#,
        )
        .unwrap();

    let toml = format!(
        "[decider]\nrules_file = {:?}\n\n{}",
        rules_file.path().display().to_string(),
        &FULL[FULL.find("[[rules]]").unwrap()..FULL.find("[[constraints]]").unwrap()]
    );
    let config = Config::from_toml_str(&toml).unwrap();
    let rules = config.effective_rules().unwrap();
    let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["night_mode", "lamp_off_when_offline"]);
}
