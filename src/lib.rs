pub mod log;
pub mod monitor;
pub mod verification;

// Re-export the session surface for external use and tests
pub use monitor::{
    AccessAttempt, AccessEventAggregator, AccessMethod, AccessStats, AccessType,
    CaptureRequestError, CaptureSession, ConnectionState, DeviceRegistry, DeviceState,
    DeviceStatus, MonitorConfig, MonitorEvent, MonitorHandle, MonitorManager, MonitorStatus,
    Severity, Transport, TransportEvent, TransportLink, UserSummary, WsTransport,
};
pub use verification::{
    AccessApiClient, VerificationClient, VerificationError, VerificationOutcome,
    VerificationRequest, Verifier,
};
