// Monitoring module - device monitoring and verification orchestration
//
// This module keeps a live control-plane connection to the fingerprint
// capture agent and turns its event stream into access decisions:
// - types: core data types and session configuration
// - events: observer events emitted by a running session
// - protocol: wire codec for the agent control plane
// - transport: the connection itself (open/send/receive/close)
// - capture: the one-request-at-a-time capture state machine
// - aggregator: live access statistics and the recent-events buffer
// - registry: known capture devices and their last reported status
// - supervisor: reconnect loop and the single event dispatcher
// - manager: the owned session object and its handle

pub mod aggregator;
pub mod capture;
pub mod events;
pub mod manager;
pub mod protocol;
pub mod registry;
pub(crate) mod supervisor;
pub mod transport;
pub mod types;

// Re-export commonly used types for easier imports
pub use aggregator::AccessEventAggregator;
pub use capture::{CaptureBusy, CapturePhase, CaptureSession};
pub use events::{MonitorEvent, Severity};
pub use manager::{CaptureRequestError, MonitorHandle, MonitorManager};
pub use protocol::{
    decode_frame, decode_template, AgentCommand, AgentMessage, AgentReport, CapturedSample,
    CommandKind, DeviceReport,
};
pub use registry::DeviceRegistry;
pub use transport::{Transport, TransportError, TransportEvent, TransportLink, WsTransport};
pub use types::{
    AccessAttempt, AccessMethod, AccessStats, AccessType, ConnectionState, DeviceState,
    DeviceStatus, MonitorConfig, MonitorStatus, UserSummary,
};
