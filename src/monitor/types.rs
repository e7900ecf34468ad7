use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection state of the monitoring session, as shown by UI badges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Capturing,
    Failed,
}

/// Reported state of a single capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Connected,
    Disconnected,
    Error,
}

/// One known capture device and its last reported status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub ip_address: String,
    pub status: DeviceState,
    pub last_sync: DateTime<Utc>,
    pub user_count: u32,
    pub fingerprint_count: u32,
}

/// How an access attempt was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMethod {
    Fingerprint,
    Card,
    Manual,
    Qr,
}

/// Direction/result class of an access attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Entry,
    Exit,
    Denied,
}

/// Minimal user info attached to a resolved attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    #[serde(rename = "firstName", default)]
    pub first_name: String,
    #[serde(rename = "lastName", default)]
    pub last_name: String,
    #[serde(rename = "rol", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl UserSummary {
    pub fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

/// One resolved access attempt. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub device_id: String,
    pub access_type: AccessType,
    pub access_method: AccessMethod,
    pub success: bool,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub membership_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSummary>,
    pub captured_at: DateTime<Utc>,
    pub verified_at: DateTime<Utc>,
}

/// Running daily counters over the access-attempt stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStats {
    pub total_today: u64,
    pub successful_today: u64,
    pub denied_today: u64,
    /// Live entry/exit delta. Drifts over long sessions; corrected by the
    /// next authoritative bulk load.
    pub currently_inside: u64,
    pub average_confidence: f64,
}

/// Status mirror of the monitoring session for UI polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub connection: ConnectionState,
    pub monitoring_enabled: bool,
    pub device_connected: bool,
    pub sdk_initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            monitoring_enabled: false,
            device_connected: false,
            sdk_initialized: false,
            last_message: None,
            last_update: None,
        }
    }
}

/// Monitoring session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Control-plane endpoint of the capture agent bridge
    pub agent_ws_url: String,
    /// Verification service endpoint
    pub verify_url: String,
    /// Recent-attempts endpoint used to seed and refresh stats
    pub recent_attempts_url: String,
    /// Actor identity echoed on outbound commands and used to flag the
    /// operator's own access events. Never part of an access decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    /// Event topics requested from the agent after connecting
    pub subscribed_events: Vec<String>,
    pub reconnect_interval_ms: u64,
    pub capture_timeout_ms: u64,
    /// Slack added on top of the capture timeout before the local deadline fires
    pub capture_grace_ms: u64,
    pub verify_timeout_ms: u64,
    pub recent_buffer_capacity: usize,
    /// When set, devices silent for longer than this are listed as
    /// disconnected. None keeps entries as last reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_stale_after_ms: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            agent_ws_url: "ws://127.0.0.1:8080".to_string(),
            verify_url: "http://127.0.0.1:3000/api/access-control/verify-fingerprint"
                .to_string(),
            recent_attempts_url: "http://127.0.0.1:3000/api/access-control/recent-attempts"
                .to_string(),
            operator_id: None,
            subscribed_events: vec![
                "fingerprint_captured".to_string(),
                "device_status".to_string(),
                "access_verification".to_string(),
            ],
            reconnect_interval_ms: 3_000,
            capture_timeout_ms: 15_000,
            capture_grace_ms: 2_000,
            verify_timeout_ms: 10_000,
            recent_buffer_capacity: 100,
            device_stale_after_ms: None,
        }
    }
}

impl MonitorConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Local deadline for a capture request: agent timeout plus grace
    pub fn capture_deadline(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms + self.capture_grace_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn device_stale_after(&self) -> Option<Duration> {
        self.device_stale_after_ms.map(Duration::from_millis)
    }
}
