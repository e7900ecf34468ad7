// Reconnection supervisor and session dispatcher.
//
// Everything that can mutate session state - inbound frames, timer
// expirations, UI commands - arrives on one input queue and is handled
// by one task, so state transitions never race each other. Timers and
// transport events carry the generation they were armed under; stop()
// bumps the generation, which retires anything still in flight.

use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use colored::*;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::verification::{AccessApiClient, VerificationRequest, VerificationOutcome, Verifier};

use super::aggregator::AccessEventAggregator;
use super::capture::CaptureSession;
use super::events::{MonitorEvent, Severity};
use super::protocol::{
    decode_frame, decode_template, AgentCommand, AgentMessage, AgentReport, CapturedSample,
    CommandKind, DeviceReport,
};
use super::registry::{DeviceRegistry, DEFAULT_DEVICE_ID};
use super::transport::{Transport, TransportEvent, TransportLink};
use super::types::{
    AccessAttempt, AccessMethod, AccessType, ConnectionState, MonitorConfig, MonitorStatus,
};

/// UI-initiated commands
#[derive(Debug)]
pub(crate) enum MonitorCommand {
    RequestCapture {
        request_id: Uuid,
        generation: u64,
        test_mode: bool,
    },
    Refresh,
    Stop,
}

/// Everything the dispatcher consumes, in arrival order
pub(crate) enum SessionInput {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Command(MonitorCommand),
    CaptureDeadline {
        generation: u64,
    },
    RetryTick {
        generation: u64,
    },
}

pub(crate) struct Supervisor {
    config: MonitorConfig,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    api: AccessApiClient,
    inputs_tx: mpsc::Sender<SessionInput>,
    events: broadcast::Sender<MonitorEvent>,
    status: Arc<Mutex<MonitorStatus>>,
    capture: Arc<Mutex<CaptureSession>>,
    aggregator: Arc<RwLock<AccessEventAggregator>>,
    registry: Arc<RwLock<DeviceRegistry>>,
    link: Option<Box<dyn TransportLink>>,
    enabled: bool,
    generation: u64,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: MonitorConfig,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn Verifier>,
        api: AccessApiClient,
        inputs_tx: mpsc::Sender<SessionInput>,
        events: broadcast::Sender<MonitorEvent>,
        status: Arc<Mutex<MonitorStatus>>,
        capture: Arc<Mutex<CaptureSession>>,
        aggregator: Arc<RwLock<AccessEventAggregator>>,
        registry: Arc<RwLock<DeviceRegistry>>,
    ) -> Self {
        Self {
            config,
            transport,
            verifier,
            api,
            inputs_tx,
            events,
            status,
            capture,
            aggregator,
            registry,
            link: None,
            enabled: true,
            generation: 0,
        }
    }

    /// Session main loop. Runs until stop() or until every handle is gone.
    pub(crate) async fn run(mut self, mut inputs: mpsc::Receiver<SessionInput>) {
        info!(
            "{}: monitoring session started ({})",
            "MONITOR_START".magenta(),
            self.config.agent_ws_url
        );

        self.reload_stats().await;
        self.attempt_connect().await;

        while let Some(input) = inputs.recv().await {
            if !self.dispatch(input).await {
                break;
            }
        }

        info!("{}: monitoring session ended", "MONITOR_END".magenta());
    }

    async fn dispatch(&mut self, input: SessionInput) -> bool {
        match input {
            SessionInput::Transport { generation, event } => {
                if generation != self.generation {
                    debug!("Discarding transport event from a retired connection");
                    return true;
                }
                self.handle_transport(event).await;
                true
            }
            SessionInput::Command(MonitorCommand::RequestCapture {
                request_id,
                generation,
                test_mode,
            }) => {
                self.handle_capture_request(request_id, generation, test_mode)
                    .await;
                true
            }
            SessionInput::Command(MonitorCommand::Refresh) => {
                self.reload_stats().await;
                true
            }
            SessionInput::Command(MonitorCommand::Stop) => {
                self.shutdown().await;
                false
            }
            SessionInput::CaptureDeadline { generation } => {
                self.handle_capture_deadline(generation);
                true
            }
            SessionInput::RetryTick { generation } => {
                // Re-check at fire time, not only when the retry was scheduled
                if self.enabled && generation == self.generation && self.link.is_none() {
                    self.attempt_connect().await;
                }
                true
            }
        }
    }

    async fn attempt_connect(&mut self) {
        if !self.enabled {
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting, "Connecting to capture agent...");

        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(64);
        let forward = self.inputs_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if forward
                    .send(SessionInput::Transport { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let transport = self.transport.clone();
        let url = self.config.agent_ws_url.clone();
        match transport.open(&url, event_tx).await {
            Ok(mut link) => {
                // Request status and subscribe before declaring the
                // session connected
                if self.send_handshake(&mut link).await {
                    self.link = Some(link);
                    self.set_state(ConnectionState::Connected, "Capture agent connected");
                    self.emit(MonitorEvent::notice(
                        Severity::Success,
                        "Connected to capture agent",
                    ));
                } else {
                    link.close().await;
                    self.set_state(
                        ConnectionState::Failed,
                        "Handshake with capture agent failed",
                    );
                    self.emit(MonitorEvent::notice(
                        Severity::Error,
                        "Handshake with capture agent failed",
                    ));
                    self.schedule_retry();
                }
            }
            Err(e) => {
                warn!("{}: {}", "MONITOR_CONNECT_ERROR".red(), e);
                self.set_state(ConnectionState::Failed, format!("Connection failed: {}", e));
                self.emit(MonitorEvent::notice(
                    Severity::Error,
                    format!("Could not reach capture agent: {}", e),
                ));
                self.schedule_retry();
            }
        }
    }

    async fn send_handshake(&self, link: &mut Box<dyn TransportLink>) -> bool {
        let operator = self.config.operator_id.as_deref();
        let commands = [
            AgentCommand::new(CommandKind::GetDeviceStatus, operator),
            AgentCommand::new(
                CommandKind::SubscribeEvents {
                    events: self.config.subscribed_events.clone(),
                },
                operator,
            ),
        ];

        for command in commands {
            let frame = match command.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    error!("{}: failed to encode command: {}", "PROTOCOL_ENCODE".red(), e);
                    return false;
                }
            };
            if link.send(frame).await.is_err() {
                return false;
            }
        }
        true
    }

    fn schedule_retry(&self) {
        if !self.enabled {
            return;
        }
        let generation = self.generation;
        let delay = self.config.reconnect_interval();
        let inputs = self.inputs_tx.clone();
        info!("{}: retrying in {:?}", "MONITOR_RETRY".yellow(), delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(SessionInput::RetryTick { generation }).await;
        });
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                debug!("Transport reported open");
            }
            TransportEvent::Message(text) => {
                self.handle_frame(&text).await;
            }
            TransportEvent::Error { detail } => {
                warn!("{}: {}", "MONITOR_TRANSPORT_ERROR".red(), detail);
                self.set_state(
                    ConnectionState::Failed,
                    format!("Connection error: {}", detail),
                );
            }
            TransportEvent::Closed { reason } => {
                self.link = None;
                let aborted = {
                    let mut session = self.capture.lock().unwrap();
                    session.cancel()
                };
                if aborted {
                    self.emit(MonitorEvent::notice(
                        Severity::Warning,
                        "Capture aborted: connection lost",
                    ));
                }
                if self.enabled {
                    let detail = reason.unwrap_or_else(|| "no reason given".to_string());
                    self.set_state(
                        ConnectionState::Disconnected,
                        format!("Connection lost: {}", detail),
                    );
                    self.emit(MonitorEvent::notice(
                        Severity::Warning,
                        "Disconnected from capture agent",
                    ));
                    self.schedule_retry();
                }
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let message = match decode_frame(text) {
            Ok(message) => message,
            Err(e) => {
                // Agent frames must never take the connection down
                warn!("{}: dropping malformed frame: {}", "PROTOCOL_DROP".yellow(), e);
                return;
            }
        };

        self.touch();

        match message {
            AgentMessage::ConnectionEstablished => {
                debug!("Agent confirmed the connection");
                self.set_message("Connection established");
            }
            AgentMessage::DeviceStatus(report) => self.handle_device_status(report),
            AgentMessage::CaptureStarted => self.handle_capture_started(),
            AgentMessage::FingerprintCaptured(sample) => self.handle_captured(sample).await,
            AgentMessage::CaptureTimeout => {
                self.fail_capture(Severity::Warning, "Capture window expired".to_string());
            }
            AgentMessage::CaptureError { message } => {
                self.fail_capture(Severity::Error, format!("Capture error: {}", message));
            }
            AgentMessage::AgentStatus(report) => self.handle_agent_status(report),
            AgentMessage::ProtocolError { message } => {
                warn!("{}: {}", "AGENT_ERROR".red(), message);
                self.emit(MonitorEvent::notice(
                    Severity::Error,
                    format!("Agent error: {}", message),
                ));
            }
            AgentMessage::Unknown { message_type, .. } => {
                debug!("Unhandled agent message type: {}", message_type);
                self.set_message(format!("Unhandled message: {}", message_type));
            }
        }
    }

    fn handle_device_status(&mut self, report: DeviceReport) {
        let device = {
            let mut registry = self.registry.write().unwrap();
            registry.apply_report(&report)
        };
        {
            let mut status = self.status.lock().unwrap();
            status.device_connected = report.is_connected;
            status.sdk_initialized = report.sdk_initialized;
            status.last_message = Some(if report.is_connected {
                format!("Device {} connected and ready", device.name)
            } else {
                format!("Device {} disconnected", device.name)
            });
        }
        info!(
            "{}: {} is {:?} ({} fingerprints)",
            "DEVICE_STATUS".cyan(),
            device.name,
            device.status,
            device.fingerprint_count
        );
        self.emit(MonitorEvent::DeviceUpdated { device });
    }

    fn handle_agent_status(&mut self, report: AgentReport) {
        let mut status = self.status.lock().unwrap();
        if let Some(device_connected) = report.device_connected {
            status.device_connected = device_connected;
        }
        if let Some(sdk_initialized) = report.sdk_initialized {
            status.sdk_initialized = sdk_initialized;
        }
        if let Some(message) = report.message {
            status.last_message = Some(message);
        }
        debug!("Agent status updated: {:?}", report.status);
    }

    fn handle_capture_started(&mut self) {
        let (acknowledged, request_id) = {
            let mut session = self.capture.lock().unwrap();
            (session.mark_capturing(), session.request_id())
        };
        if acknowledged {
            self.set_state(
                ConnectionState::Capturing,
                "Place your finger on the reader...",
            );
            if let Some(request_id) = request_id {
                self.emit(MonitorEvent::CaptureStarted { request_id });
            }
            self.emit(MonitorEvent::notice(
                Severity::Info,
                "Place your finger on the reader",
            ));
        } else {
            debug!("Agent reported a capture this client did not request");
        }
    }

    async fn handle_capture_request(
        &mut self,
        request_id: Uuid,
        generation: u64,
        test_mode: bool,
    ) {
        if self.link.is_none() {
            {
                self.capture.lock().unwrap().cancel();
            }
            self.emit(MonitorEvent::notice(
                Severity::Error,
                "Capture agent is not connected",
            ));
            return;
        }

        let command = AgentCommand::new(
            CommandKind::CaptureFingerprint {
                test_mode,
                timeout: self.config.capture_timeout_ms,
            },
            self.config.operator_id.as_deref(),
        );
        let frame = match command.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("{}: failed to encode command: {}", "PROTOCOL_ENCODE".red(), e);
                self.capture.lock().unwrap().cancel();
                self.emit(MonitorEvent::notice(
                    Severity::Error,
                    "Failed to encode capture command",
                ));
                return;
            }
        };

        let sent = match self.link.as_mut() {
            Some(link) => link.send(frame).await.is_ok(),
            None => false,
        };
        if !sent {
            self.capture.lock().unwrap().cancel();
            self.emit(MonitorEvent::notice(
                Severity::Error,
                "Failed to send capture command",
            ));
            return;
        }

        info!(
            "{}: capture {} requested (test_mode={})",
            "CAPTURE_REQUEST".cyan(),
            request_id,
            test_mode
        );
        self.emit(MonitorEvent::notice(Severity::Info, "Starting capture..."));

        // Local deadline independent of the agent: timeout plus grace
        let deadline = self.config.capture_deadline();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = inputs.send(SessionInput::CaptureDeadline { generation }).await;
        });
    }

    fn handle_capture_deadline(&mut self, generation: u64) {
        let timed_out = {
            let mut session = self.capture.lock().unwrap();
            if session.mark_timed_out(generation) {
                session.cancel();
                true
            } else {
                false
            }
        };
        if timed_out {
            warn!(
                "{}: no agent response within {:?}",
                "CAPTURE_TIMEOUT".yellow(),
                self.config.capture_deadline()
            );
            self.emit(MonitorEvent::notice(Severity::Warning, "Capture timed out"));
            if self.link.is_some() {
                self.set_state(ConnectionState::Connected, "Capture agent connected");
            }
        }
    }

    /// Agent-side capture failure: ends the session, not the connection
    fn fail_capture(&mut self, severity: Severity, message: String) {
        let failed = {
            let mut session = self.capture.lock().unwrap();
            if session.mark_errored() {
                session.cancel();
                true
            } else {
                false
            }
        };
        warn!("{}: {}", "CAPTURE_FAILED".yellow(), message);
        self.emit(MonitorEvent::notice(severity, message));
        if failed && self.link.is_some() {
            self.set_state(ConnectionState::Connected, "Capture agent connected");
        }
    }

    async fn handle_captured(&mut self, sample: CapturedSample) {
        // Claim the slot if this answers a local request; device-initiated
        // captures arriving via the subscription are verified the same way
        {
            self.capture.lock().unwrap().mark_completed();
        }

        let template = sample.template.clone().unwrap_or_default();
        if decode_template(&template).is_none() {
            self.capture.lock().unwrap().cancel();
            warn!(
                "{}: sample carried no usable template",
                "CAPTURE_FAILED".yellow()
            );
            self.emit(MonitorEvent::notice(
                Severity::Error,
                "Capture produced no usable template",
            ));
            if self.link.is_some() {
                self.set_state(ConnectionState::Connected, "Capture agent connected");
            }
            return;
        }

        let quality = sample.quality.unwrap_or(85);
        let captured_at = sample.captured_at();
        let device_id = {
            let registry = self.registry.read().unwrap();
            registry
                .list()
                .first()
                .map(|d| d.id.clone())
                .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string())
        };

        let request = VerificationRequest {
            template,
            quality,
            device_id: device_id.clone(),
            capture_time: sample
                .timestamp
                .clone()
                .unwrap_or_else(|| captured_at.to_rfc3339()),
            user_context: self.config.operator_id.clone(),
        };

        info!(
            "{}: verifying captured sample (quality {})",
            "VERIFY_START".cyan(),
            quality
        );
        self.set_message("Verifying fingerprint...");
        self.emit(MonitorEvent::notice(Severity::Info, "Verifying fingerprint..."));

        let verifier = self.verifier.clone();
        match verifier.verify(request).await {
            Ok(outcome) => self.resolve_outcome(outcome, device_id, captured_at),
            Err(e) => {
                // A failed call made no access decision; nothing is recorded
                error!("{}: {}", "VERIFY_ERROR".red(), e);
                self.emit(MonitorEvent::notice(
                    Severity::Error,
                    format!("Verification failed: {}", e),
                ));
            }
        }

        // The session slot is held through verification; release it now
        {
            self.capture.lock().unwrap().cancel();
        }
        if self.link.is_some() && self.enabled {
            self.set_state(ConnectionState::Connected, "Capture agent connected");
        }
    }

    fn resolve_outcome(
        &mut self,
        outcome: VerificationOutcome,
        device_id: String,
        captured_at: chrono::DateTime<Utc>,
    ) {
        let denial_reason = if outcome.access_granted {
            None
        } else {
            Some(
                outcome
                    .denial_reason
                    .clone()
                    .unwrap_or_else(|| "Fingerprint not recognized".to_string()),
            )
        };

        let attempt = AccessAttempt {
            id: Uuid::new_v4().to_string(),
            user_id: outcome.user.as_ref().map(|u| u.id.clone()),
            device_id,
            access_type: if outcome.access_granted {
                AccessType::Entry
            } else {
                AccessType::Denied
            },
            access_method: AccessMethod::Fingerprint,
            success: outcome.access_granted,
            confidence_score: outcome.confidence_score,
            denial_reason,
            membership_status: outcome.membership_status,
            user: outcome.user,
            captured_at,
            verified_at: Utc::now(),
        };

        {
            let mut aggregator = self.aggregator.write().unwrap();
            aggregator.record(attempt.clone());
        }

        let is_self = match (&self.config.operator_id, &attempt.user_id) {
            (Some(operator), Some(user)) => operator == user,
            _ => false,
        };

        if attempt.success {
            let name = attempt
                .user
                .as_ref()
                .map(|u| u.full_name())
                .unwrap_or_else(|| "Unknown user".to_string());
            info!(
                "{}: {} ({:.0}%)",
                "ACCESS_GRANTED".green(),
                name,
                attempt.confidence_score
            );
            self.emit(MonitorEvent::notice(
                Severity::Success,
                format!("Access granted: {}", name),
            ));
        } else {
            let reason = attempt
                .denial_reason
                .clone()
                .unwrap_or_else(|| "Fingerprint not recognized".to_string());
            info!("{}: {}", "ACCESS_DENIED".red(), reason);
            self.emit(MonitorEvent::notice(
                Severity::Error,
                format!("Access denied: {}", reason),
            ));
        }

        self.emit(MonitorEvent::AccessDecision { attempt, is_self });
    }

    async fn reload_stats(&mut self) {
        match self.api.fetch_recent().await {
            Ok(recent) => {
                let stats = recent.stats.clone();
                {
                    let mut aggregator = self.aggregator.write().unwrap();
                    aggregator.bulk_load(recent.attempts, recent.stats);
                }
                info!(
                    "{}: loaded {} attempts for today",
                    "STATS_RELOAD".cyan(),
                    stats.total_today
                );
                self.emit(MonitorEvent::StatsReloaded { stats });
            }
            Err(e) => {
                warn!("{}: {:#}", "STATS_RELOAD_ERROR".yellow(), e);
                self.emit(MonitorEvent::notice(
                    Severity::Warning,
                    format!("Could not load recent attempts: {}", e),
                ));
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("{}: stopping monitoring session", "MONITOR_STOP".yellow());
        self.enabled = false;
        // Retires pending retry ticks and events from the old connection
        self.generation += 1;
        {
            let mut status = self.status.lock().unwrap();
            status.monitoring_enabled = false;
        }

        let aborted = {
            let mut session = self.capture.lock().unwrap();
            session.cancel()
        };
        if aborted {
            self.emit(MonitorEvent::notice(Severity::Info, "Capture cancelled"));
        }

        if let Some(mut link) = self.link.take() {
            if let Ok(frame) = AgentCommand::new(
                CommandKind::StopMonitoring,
                self.config.operator_id.as_deref(),
            )
            .to_frame()
            {
                let _ = link.send(frame).await;
            }
            link.close().await;
        }

        self.set_state(ConnectionState::Disconnected, "Monitoring stopped");
        self.emit(MonitorEvent::notice(Severity::Info, "Monitoring stopped"));
    }

    fn set_state(&self, state: ConnectionState, message: impl Into<String>) {
        let message = message.into();
        {
            let mut status = self.status.lock().unwrap();
            status.connection = state;
            status.last_message = Some(message.clone());
            status.last_update = Some(Utc::now());
        }
        info!("{}: {:?} - {}", "MONITOR_STATE".magenta(), state, message);
        let _ = self.events.send(MonitorEvent::connection(state, message));
    }

    fn set_message(&self, message: impl Into<String>) {
        let mut status = self.status.lock().unwrap();
        status.last_message = Some(message.into());
        status.last_update = Some(Utc::now());
    }

    fn touch(&self) {
        let mut status = self.status.lock().unwrap();
        status.last_update = Some(Utc::now());
    }

    fn emit(&self, event: MonitorEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}
