//! Device adapter boundary
//!
//! Protocol adapters (Zigbee, Matter, vendor clouds...) live outside this
//! crate and implement [`DeviceAdapter`]. Writes must be idempotent-safe: the
//! sync engine retries a change until the device acknowledges it.
//!
//! [`SimulatedAdapter`] is an in-memory device farm used by the binary and tests.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, trace};

use crate::models::{AttrValue, DeviceId};

/// State reported by a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub attributes: BTreeMap<String, AttrValue>,
    pub as_of: DateTime<Utc>,
}

/// Errors returned by device adapters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    /// Transient: device offline, network partition
    #[error("device {0} unreachable")]
    Unreachable(DeviceId),

    /// The adapter has never heard of this device
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    /// Device answered but refused the write
    #[error("device {device} rejected write: {reason}")]
    Rejected { device: DeviceId, reason: String },
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Unreachable(_))
    }
}

/// Trait implemented by device protocol adapters
#[async_trait::async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Read the full current state of a device
    async fn read_state(&self, device_id: &str) -> Result<DeviceSnapshot, AdapterError>;

    /// Apply attribute changes on a device
    async fn write_state(
        &self,
        device_id: &str,
        changes: &BTreeMap<String, AttrValue>,
    ) -> Result<(), AdapterError>;
}

//=============================================================================
// SIMULATED DEVICES
//=============================================================================

#[derive(Debug, Clone)]
struct SimDevice {
    state: BTreeMap<String, AttrValue>,
    online: bool,
    reject_remaining: u32,
    latency: Duration,
    writes: Vec<BTreeMap<String, AttrValue>>,
    reads: u64,
}

/// In-memory device farm
#[derive(Default)]
pub struct SimulatedAdapter {
    devices: DashMap<DeviceId, SimDevice>,
}

impl SimulatedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with its initial state (online)
    pub fn add_device(&self, device_id: &str, state: BTreeMap<String, AttrValue>) {
        self.devices.insert(
            device_id.to_string(),
            SimDevice {
                state,
                online: true,
                reject_remaining: 0,
                latency: Duration::ZERO,
                writes: Vec::new(),
                reads: 0,
            },
        );
    }

    pub fn set_online(&self, device_id: &str, online: bool) {
        if let Some(mut d) = self.devices.get_mut(device_id) {
            debug!(device_id, online, "Simulated device connectivity changed");
            d.online = online;
        }
    }

    /// Change a device attribute outside the control loop (manual switch, etc.)
    pub fn set_external(&self, device_id: &str, attribute: &str, value: impl Into<AttrValue>) {
        if let Some(mut d) = self.devices.get_mut(device_id) {
            d.state.insert(attribute.to_string(), value.into());
        }
    }

    /// Reject the next `count` writes to a device
    pub fn reject_writes(&self, device_id: &str, count: u32) {
        if let Some(mut d) = self.devices.get_mut(device_id) {
            d.reject_remaining = count;
        }
    }

    /// Delay every read and write on a device
    pub fn set_latency(&self, device_id: &str, latency: Duration) {
        if let Some(mut d) = self.devices.get_mut(device_id) {
            d.latency = latency;
        }
    }

    pub fn device_state(&self, device_id: &str) -> Option<BTreeMap<String, AttrValue>> {
        self.devices.get(device_id).map(|d| d.state.clone())
    }

    /// Every accepted write, in order
    pub fn writes(&self, device_id: &str) -> Vec<BTreeMap<String, AttrValue>> {
        self.devices
            .get(device_id)
            .map(|d| d.writes.clone())
            .unwrap_or_default()
    }

    pub fn read_count(&self, device_id: &str) -> u64 {
        self.devices.get(device_id).map(|d| d.reads).unwrap_or(0)
    }

    fn latency(&self, device_id: &str) -> Duration {
        self.devices
            .get(device_id)
            .map(|d| d.latency)
            .unwrap_or(Duration::ZERO)
    }
}

#[async_trait::async_trait]
impl DeviceAdapter for SimulatedAdapter {
    async fn read_state(&self, device_id: &str) -> Result<DeviceSnapshot, AdapterError> {
        let latency = self.latency(device_id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| AdapterError::UnknownDevice(device_id.to_string()))?;

        if !device.online {
            return Err(AdapterError::Unreachable(device_id.to_string()));
        }
        device.reads += 1;
        trace!(device_id, "Simulated read");

        Ok(DeviceSnapshot {
            attributes: device.state.clone(),
            as_of: Utc::now(),
        })
    }

    async fn write_state(
        &self,
        device_id: &str,
        changes: &BTreeMap<String, AttrValue>,
    ) -> Result<(), AdapterError> {
        let latency = self.latency(device_id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| AdapterError::UnknownDevice(device_id.to_string()))?;

        if !device.online {
            return Err(AdapterError::Unreachable(device_id.to_string()));
        }
        if device.reject_remaining > 0 {
            device.reject_remaining -= 1;
            return Err(AdapterError::Rejected {
                device: device_id.to_string(),
                reason: "simulated rejection".to_string(),
            });
        }

        for (attribute, value) in changes {
            device.state.insert(attribute.clone(), value.clone());
        }
        device.writes.push(changes.clone());
        trace!(device_id, count = changes.len(), "Simulated write");
        Ok(())
    }
}
