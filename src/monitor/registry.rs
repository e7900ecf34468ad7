use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use super::protocol::DeviceReport;
use super::types::{DeviceState, DeviceStatus};

// Identity the agent uses when a status report carries no device fields
pub const DEFAULT_DEVICE_ID: &str = "zk-device-real";
pub const DEFAULT_DEVICE_NAME: &str = "ZKTeco Real Device";
pub const DEFAULT_DEVICE_TYPE: &str = "zk9500";
pub const DEFAULT_DEVICE_ADDRESS: &str = "127.0.0.1";

/// Known capture devices keyed by id, updated from agent status events.
/// Entries are never deleted; a device that goes silent keeps its last
/// reported status unless a staleness window is configured.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceStatus>,
    stale_after: Option<Duration>,
}

impl DeviceRegistry {
    pub fn new(stale_after: Option<Duration>) -> Self {
        Self {
            devices: HashMap::new(),
            stale_after,
        }
    }

    /// Replace-by-id upsert
    pub fn upsert(&mut self, status: DeviceStatus) {
        self.devices.insert(status.id.clone(), status);
    }

    /// Fold an agent status report into the registry. Creates the entry
    /// on first sight of the id, replaces it afterwards.
    pub fn apply_report(&mut self, report: &DeviceReport) -> DeviceStatus {
        let id = report
            .id
            .clone()
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());

        let status = DeviceStatus {
            name: report
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            device_type: DEFAULT_DEVICE_TYPE.to_string(),
            ip_address: report
                .ip
                .clone()
                .unwrap_or_else(|| DEFAULT_DEVICE_ADDRESS.to_string()),
            status: if report.is_connected {
                DeviceState::Connected
            } else {
                DeviceState::Disconnected
            },
            last_sync: Utc::now(),
            user_count: report.user_count,
            fingerprint_count: report.fingerprint_count,
            id: id.clone(),
        };

        self.devices.insert(id, status.clone());
        status
    }

    pub fn get(&self, id: &str) -> Option<DeviceStatus> {
        self.devices.get(id).map(|d| self.with_stale_policy(d))
    }

    /// All known devices, stable order. When a staleness window is set,
    /// devices silent for longer are reported as disconnected without
    /// touching the stored entry.
    pub fn list(&self) -> Vec<DeviceStatus> {
        let mut devices: Vec<DeviceStatus> =
            self.devices.values().map(|d| self.with_stale_policy(d)).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn with_stale_policy(&self, device: &DeviceStatus) -> DeviceStatus {
        let mut device = device.clone();
        if let Some(window) = self.stale_after {
            let age = Utc::now().signed_duration_since(device.last_sync);
            if age.num_milliseconds() >= 0 && age.num_milliseconds() as u128 > window.as_millis()
            {
                device.status = DeviceState::Disconnected;
            }
        }
        device
    }
}
