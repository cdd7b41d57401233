//! safla-node: a Sense-Analyze-Feedback-Learn loop for home automation
//!
//! Digital twins mirror physical devices and reconcile with them through the
//! sync engine. Observations from sync, sensors and users flow over a
//! broadcast bus into per-scope situational models, which drive rule-based
//! decisions filtered by safety constraints. Outcomes feed the learner.

pub mod adapter;
pub mod analyzer;
pub mod bus;
pub mod config;
pub mod decider;
pub mod error;
pub mod learner;
pub mod models;
pub mod persistence;
pub mod runtime;
pub mod sync;
pub mod twin;

pub use adapter::{DeviceAdapter, DeviceSnapshot, SimulatedAdapter};
pub use bus::{Observation, ObservationBus, ObservationKind, ObservationSource, Subscription};
pub use config::Config;
pub use error::{Result, RuntimeError};
pub use models::{AttrValue, ScopeId};
pub use runtime::Runtime;
pub use twin::{DigitalTwin, TwinStore};
