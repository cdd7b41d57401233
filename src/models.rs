//! Shared primitive types used across the twin, bus, analyzer and decider layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a digital twin
pub type TwinId = String;

/// Identifier of the physical device a twin is bound to
pub type DeviceId = String;

/// Identifier of a decision
pub type DecisionId = String;

//=============================================================================
// ATTRIBUTE VALUES
//=============================================================================

/// A typed device attribute value.
///
/// Serialized untagged so that config files and adapters can write plain
/// `true`, `21.5` or `"cool"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttrValue::Text(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, AttrValue::Number(_))
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Number(n) => write!(f, "{}", n),
            AttrValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Number(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Number(v as f64)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Text(v)
    }
}

//=============================================================================
// SCOPES
//=============================================================================

/// Entity scope a situational model is kept for (house, room or single device).
///
/// Scopes are plain strings such as `house`, `room:kitchen` or
/// `device:thermostat-1`; the prefix is informational only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn house() -> Self {
        ScopeId("house".to_string())
    }

    pub fn room(name: &str) -> Self {
        ScopeId(format!("room:{}", name))
    }

    pub fn device(id: &str) -> Self {
        ScopeId(format!("device:{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScopeId {
    fn default() -> Self {
        Self::house()
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        ScopeId(s.to_string())
    }
}

//=============================================================================
// SEVERITY
//=============================================================================

/// Severity levels for constraint violations and anomalies
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

/// Observation key for a twin attribute, `twin_id/attribute`.
pub fn attr_key(twin_id: &str, attribute: &str) -> String {
    format!("{}/{}", twin_id, attribute)
}

/// Configured seconds as a time span, saturating at the largest span chrono
/// can represent.
pub fn span_secs(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
