use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{AccessAttempt, AccessStats, ConnectionState, DeviceStatus};

/// Severity of a user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Events emitted by a monitoring session for observers (UI badges,
/// toasts, live lists). Fire-and-forget; dropped when nobody listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MonitorEvent {
    /// Connection state changed, with a short status line for display
    ConnectionChanged {
        state: ConnectionState,
        message: String,
    },
    /// Short-lived, non-blocking notification
    Notice { severity: Severity, message: String },
    /// The agent acknowledged a capture request
    CaptureStarted { request_id: Uuid },
    /// A verification call completed and produced an access decision.
    /// `is_self` marks the configured operator's own events for display
    /// only; the decision itself is carried by `attempt.success`.
    AccessDecision { attempt: AccessAttempt, is_self: bool },
    /// A device registry entry was created or updated
    DeviceUpdated { device: DeviceStatus },
    /// Aggregated stats were replaced from the authoritative endpoint
    StatsReloaded { stats: AccessStats },
}

impl MonitorEvent {
    pub fn notice(severity: Severity, message: impl Into<String>) -> Self {
        Self::Notice {
            severity,
            message: message.into(),
        }
    }

    pub fn connection(state: ConnectionState, message: impl Into<String>) -> Self {
        Self::ConnectionChanged {
            state,
            message: message.into(),
        }
    }
}
