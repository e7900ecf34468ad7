// Wire codec for the capture agent control plane.
//
// Outbound commands are JSON objects keyed by "action"; inbound events are
// JSON objects keyed by "type". Unknown inbound types are surfaced as
// Unknown rather than rejected, and a malformed payload never takes the
// connection down with it.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// Templates arrive base64-encoded; padding and canonicality vary by
// reader SDK, so decoding is deliberately lenient
const TEMPLATE_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode a captured template payload. None means the sample is unusable
/// and must not reach the verification service.
pub fn decode_template(template: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    if template.is_empty() {
        return None;
    }
    TEMPLATE_B64.decode(template).ok()
}

/// Outbound command payloads, tagged by agent action name
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandKind {
    GetDeviceStatus,
    SubscribeEvents { events: Vec<String> },
    CaptureFingerprint { test_mode: bool, timeout: u64 },
    StopMonitoring,
}

/// Envelope for outbound commands. The timestamp and actor identity are
/// echoed by the agent for correlation and diagnostics only.
#[derive(Debug, Clone, Serialize)]
pub struct AgentCommand {
    #[serde(flatten)]
    pub kind: CommandKind,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl AgentCommand {
    pub fn new(kind: CommandKind, operator: Option<&str>) -> Self {
        Self {
            kind,
            timestamp: Utc::now().timestamp_millis(),
            user: operator.map(str::to_string),
        }
    }

    /// Serialize to a text frame
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Device status fields as the agent reports them
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceReport {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(rename = "isConnected", default)]
    pub is_connected: bool,
    #[serde(rename = "deviceCount", default)]
    pub user_count: u32,
    #[serde(rename = "fingerprintCount", default)]
    pub fingerprint_count: u32,
    #[serde(rename = "sdkInitialized", default)]
    pub sdk_initialized: bool,
}

/// A captured fingerprint sample as delivered by the agent
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CapturedSample {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub quality: Option<u32>,
    /// Device-side capture time, passed through to verification as-is
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl CapturedSample {
    /// Best-effort parse of the device timestamp, falling back to now
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }
}

/// Agent process status fields, merged into the session status mirror
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AgentReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "deviceConnected", default)]
    pub device_connected: Option<bool>,
    #[serde(rename = "sdkInitialized", default)]
    pub sdk_initialized: Option<bool>,
}

/// Inbound events from the capture agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    ConnectionEstablished,
    DeviceStatus(DeviceReport),
    CaptureStarted,
    FingerprintCaptured(CapturedSample),
    CaptureTimeout,
    CaptureError { message: String },
    AgentStatus(AgentReport),
    ProtocolError { message: String },
    /// Any type this client does not handle. Logged, never an error.
    Unknown { message_type: String, raw: Value },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not a JSON object: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("malformed {message_type} payload: {detail}")]
    Payload {
        message_type: String,
        detail: String,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned + Default>(
    message_type: &str,
    data: Option<Value>,
) -> Result<T, DecodeError> {
    match data {
        None => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| DecodeError::Payload {
                message_type: message_type.to_string(),
                detail: e.to_string(),
            })
        }
    }
}

/// Decode one inbound text frame
pub fn decode_frame(text: &str) -> Result<AgentMessage, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let Envelope {
        message_type,
        data,
        error,
    } = envelope;

    let message = match message_type.as_str() {
        "connection_established" => AgentMessage::ConnectionEstablished,
        "device_status" => AgentMessage::DeviceStatus(payload(&message_type, data)?),
        "capture_started" => AgentMessage::CaptureStarted,
        "fingerprint_captured" => {
            AgentMessage::FingerprintCaptured(payload(&message_type, data)?)
        }
        "capture_timeout" => AgentMessage::CaptureTimeout,
        "capture_error" => AgentMessage::CaptureError {
            message: error.unwrap_or_else(|| "unspecified capture error".to_string()),
        },
        "agent_status" => AgentMessage::AgentStatus(payload(&message_type, data)?),
        "error" => AgentMessage::ProtocolError {
            message: error.unwrap_or_else(|| "unspecified agent error".to_string()),
        },
        _ => AgentMessage::Unknown {
            message_type,
            raw: data.unwrap_or(Value::Null),
        },
    };

    Ok(message)
}
