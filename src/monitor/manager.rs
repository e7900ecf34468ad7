// Owned monitoring session object. One MonitorManager::start call per
// session; all mutable session state lives behind the returned handle
// and dies with it. Nothing here is a process-wide global.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::verification::{AccessApiClient, VerificationClient, Verifier};

use super::aggregator::AccessEventAggregator;
use super::capture::{CapturePhase, CaptureSession};
use super::events::MonitorEvent;
use super::registry::DeviceRegistry;
use super::supervisor::{MonitorCommand, SessionInput, Supervisor};
use super::transport::{Transport, WsTransport};
use super::types::{AccessAttempt, AccessStats, DeviceStatus, MonitorConfig, MonitorStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CaptureRequestError {
    /// Rejected synchronously; the live session is untouched
    #[error("a capture is already in progress")]
    Busy,
    #[error("monitoring session is not running")]
    NotRunning,
}

/// Entry point for monitoring sessions
pub struct MonitorManager;

impl MonitorManager {
    /// Start a monitoring session against the real capture agent and
    /// verification service.
    pub fn start(config: MonitorConfig) -> Result<MonitorHandle> {
        let verifier: Arc<dyn Verifier> = Arc::new(VerificationClient::new(
            config.verify_url.clone(),
            config.verify_timeout(),
        )?);
        Self::start_with(config, Arc::new(WsTransport::new()), verifier)
    }

    /// Start a session with explicit transport and verifier
    /// implementations. Must be called within a Tokio runtime.
    pub fn start_with(
        config: MonitorConfig,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<MonitorHandle> {
        let api = AccessApiClient::new(
            config.recent_attempts_url.clone(),
            config.verify_timeout(),
        )?;

        let (inputs_tx, inputs_rx) = mpsc::channel::<SessionInput>(256);
        let (events_tx, _) = broadcast::channel::<MonitorEvent>(256);

        let status = Arc::new(Mutex::new(MonitorStatus {
            monitoring_enabled: true,
            ..MonitorStatus::default()
        }));
        let capture = Arc::new(Mutex::new(CaptureSession::new()));
        let aggregator = Arc::new(RwLock::new(AccessEventAggregator::new(
            config.recent_buffer_capacity,
        )));
        let registry = Arc::new(RwLock::new(DeviceRegistry::new(
            config.device_stale_after(),
        )));

        let supervisor = Supervisor::new(
            config,
            transport,
            verifier,
            api,
            inputs_tx.clone(),
            events_tx.clone(),
            status.clone(),
            capture.clone(),
            aggregator.clone(),
            registry.clone(),
        );
        let task = tokio::spawn(supervisor.run(inputs_rx));

        Ok(MonitorHandle {
            inputs: inputs_tx,
            events: events_tx,
            status,
            capture,
            aggregator,
            registry,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Control and read surface of a running monitoring session.
/// Reads are safe concurrently with the dispatcher; writes all go
/// through the dispatcher's input queue.
pub struct MonitorHandle {
    inputs: mpsc::Sender<SessionInput>,
    events: broadcast::Sender<MonitorEvent>,
    status: Arc<Mutex<MonitorStatus>>,
    capture: Arc<Mutex<CaptureSession>>,
    aggregator: Arc<RwLock<AccessEventAggregator>>,
    registry: Arc<RwLock<DeviceRegistry>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    /// Subscribe to session events (connection changes, notices,
    /// access decisions)
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn capture_phase(&self) -> CapturePhase {
        self.capture.lock().unwrap().phase()
    }

    pub fn stats(&self) -> AccessStats {
        self.aggregator.read().unwrap().stats()
    }

    /// Aggregated counters plus the recent-events buffer, newest first
    pub fn snapshot(&self) -> (AccessStats, Vec<AccessAttempt>) {
        self.aggregator.read().unwrap().snapshot()
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.registry.read().unwrap().list()
    }

    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }

    /// Fire a capture request. The at-most-one-in-flight check happens
    /// here, before anything is sent; completion is observed through
    /// the event stream, not the return value.
    pub async fn request_capture(&self, test_mode: bool) -> Result<Uuid, CaptureRequestError> {
        if self.inputs.is_closed() {
            return Err(CaptureRequestError::NotRunning);
        }

        let (request_id, generation) = {
            let mut session = self.capture.lock().unwrap();
            session.begin().map_err(|_| CaptureRequestError::Busy)?
        };

        let command = SessionInput::Command(MonitorCommand::RequestCapture {
            request_id,
            generation,
            test_mode,
        });
        if self.inputs.send(command).await.is_err() {
            self.capture.lock().unwrap().cancel();
            return Err(CaptureRequestError::NotRunning);
        }

        Ok(request_id)
    }

    /// Re-seed stats from the authoritative recent-attempts endpoint
    pub async fn refresh(&self) -> Result<()> {
        self.inputs
            .send(SessionInput::Command(MonitorCommand::Refresh))
            .await
            .ok()
            .context("Monitoring session is not running")
    }

    /// Stop monitoring: cancels any pending reconnect, aborts an
    /// in-flight capture and closes the connection. Idempotent.
    pub async fn stop(&self) {
        let _ = self
            .inputs
            .send(SessionInput::Command(MonitorCommand::Stop))
            .await;

        let task = { self.task.lock().unwrap().take() };
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Monitoring session task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave the session running forever
        let _ = self
            .inputs
            .try_send(SessionInput::Command(MonitorCommand::Stop));
    }
}
