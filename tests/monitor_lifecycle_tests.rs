use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_test::assert_ok;
use tokio::sync::{broadcast, mpsc};

use muscleup_access_lib::monitor::capture::CapturePhase;
use muscleup_access_lib::monitor::transport::{
    Transport, TransportError, TransportEvent, TransportLink,
};
use muscleup_access_lib::{
    CaptureRequestError, ConnectionState, DeviceState, MonitorConfig, MonitorEvent,
    MonitorHandle, MonitorManager, Severity, UserSummary, VerificationError,
    VerificationOutcome, VerificationRequest, Verifier,
};

mockall::mock! {
    pub Verif {}

    #[async_trait]
    impl Verifier for Verif {
        async fn verify(
            &self,
            request: VerificationRequest,
        ) -> Result<VerificationOutcome, VerificationError>;
    }
}

/// In-process transport: the test plays the agent side of the link.
struct FakeTransport {
    opens: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    events_slot: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    sent_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        _url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let _ = events.send(TransportEvent::Opened).await;
        *self.events_slot.lock().unwrap() = Some(events);
        Ok(Box::new(FakeLink {
            sent: self.sent_tx.clone(),
        }))
    }
}

struct FakeLink {
    sent: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl TransportLink for FakeLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sent
            .send(frame)
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&mut self) {}
}

/// The agent's side of the fake link
struct AgentEnd {
    events_slot: Arc<Mutex<Option<mpsc::Sender<TransportEvent>>>>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl AgentEnd {
    fn sender(&self) -> mpsc::Sender<TransportEvent> {
        self.events_slot
            .lock()
            .unwrap()
            .clone()
            .expect("no open connection")
    }

    async fn push(&self, value: serde_json::Value) {
        self.sender()
            .send(TransportEvent::Message(value.to_string()))
            .await
            .expect("session gone");
    }

    async fn push_raw(&self, text: &str) {
        self.sender()
            .send(TransportEvent::Message(text.to_string()))
            .await
            .expect("session gone");
    }

    async fn drop_connection(&self) {
        self.sender()
            .send(TransportEvent::Closed {
                reason: Some("agent went away".to_string()),
            })
            .await
            .expect("session gone");
    }

    async fn next_sent(&mut self) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("timed out waiting for an outbound frame")
            .expect("link closed");
        serde_json::from_str(&frame).expect("outbound frame was not JSON")
    }
}

struct Harness {
    handle: MonitorHandle,
    agent: AgentEnd,
    opens: Arc<AtomicUsize>,
    #[allow(dead_code)]
    refuse: Arc<AtomicBool>,
}

fn test_config() -> MonitorConfig {
    MonitorConfig {
        // nothing listens on port 1: the stats seed fails fast and the
        // session starts with empty counters
        recent_attempts_url: "http://127.0.0.1:1/recent-attempts".to_string(),
        verify_url: "http://127.0.0.1:1/verify".to_string(),
        operator_id: Some("luishdz04".to_string()),
        reconnect_interval_ms: 50,
        capture_timeout_ms: 200,
        capture_grace_ms: 100,
        verify_timeout_ms: 1_000,
        ..MonitorConfig::default()
    }
}

fn start_session(config: MonitorConfig, verifier: MockVerif) -> Harness {
    let opens = Arc::new(AtomicUsize::new(0));
    let refuse = Arc::new(AtomicBool::new(false));
    let events_slot = Arc::new(Mutex::new(None));
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(FakeTransport {
        opens: opens.clone(),
        refuse: refuse.clone(),
        events_slot: events_slot.clone(),
        sent_tx,
    });

    let handle = MonitorManager::start_with(config, transport, Arc::new(verifier))
        .expect("failed to start session");

    Harness {
        handle,
        agent: AgentEnd {
            events_slot,
            sent: sent_rx,
        },
        opens,
        refuse,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn collect_events(
    rx: &mut broadcast::Receiver<MonitorEvent>,
    window: Duration,
) -> Vec<MonitorEvent> {
    let deadline = tokio::time::Instant::now() + window;
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    events
}

async fn connected(harness: &mut Harness) {
    let handle = &harness.handle;
    wait_until("connection", || {
        handle.status().connection == ConnectionState::Connected
    })
    .await;
    // drain the handshake frames
    let first = harness.agent.next_sent().await;
    assert_eq!(first["action"], "get_device_status");
    let second = harness.agent.next_sent().await;
    assert_eq!(second["action"], "subscribe_events");
}

fn granted_outcome() -> VerificationOutcome {
    VerificationOutcome {
        access_granted: true,
        user: Some(UserSummary {
            id: "u1".to_string(),
            first_name: "Luis".to_string(),
            last_name: "Hernandez".to_string(),
            role: Some("admin".to_string()),
        }),
        confidence_score: 92.0,
        denial_reason: None,
        membership_status: Some("active".to_string()),
    }
}

#[tokio::test]
async fn test_connects_and_subscribes_before_reporting_connected() {
    let mut harness = start_session(test_config(), MockVerif::new());

    wait_until("connection", || {
        harness.handle.status().connection == ConnectionState::Connected
    })
    .await;

    let first = harness.agent.next_sent().await;
    assert_eq!(first["action"], "get_device_status");
    assert_eq!(first["user"], "luishdz04");
    assert!(first["timestamp"].is_i64());

    let second = harness.agent.next_sent().await;
    assert_eq!(second["action"], "subscribe_events");
    let topics = second["events"].as_array().unwrap();
    assert!(topics.iter().any(|t| t == "fingerprint_captured"));
    assert!(topics.iter().any(|t| t == "device_status"));

    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);
    assert!(harness.handle.status().monitoring_enabled);
}

#[tokio::test]
async fn test_granted_capture_flows_into_stats_and_recent_buffer() {
    let mut verifier = MockVerif::new();
    verifier
        .expect_verify()
        .withf(|request| {
            request.template == "T1"
                && request.quality == 90
                && request.user_context.as_deref() == Some("luishdz04")
        })
        .returning(|_| Ok(granted_outcome()));

    let mut harness = start_session(test_config(), verifier);
    connected(&mut harness).await;

    let mut events = harness.handle.subscribe();
    let request_id = harness.handle.request_capture(true).await.unwrap();

    let frame = harness.agent.next_sent().await;
    assert_eq!(frame["action"], "capture_fingerprint");
    assert_eq!(frame["test_mode"], true);
    assert_eq!(frame["timeout"], 200);

    harness.agent.push(json!({ "type": "capture_started" })).await;
    wait_until("capturing badge", || {
        harness.handle.status().connection == ConnectionState::Capturing
    })
    .await;

    harness
        .agent
        .push(json!({
            "type": "fingerprint_captured",
            "data": { "template": "T1", "quality": 90 }
        }))
        .await;

    let handle = &harness.handle;
    wait_until("attempt recorded", || handle.stats().total_today == 1).await;

    let (stats, recent) = harness.handle.snapshot();
    assert_eq!(stats.successful_today, 1);
    assert_eq!(stats.denied_today, 0);
    assert_eq!(stats.currently_inside, 1);
    assert!((stats.average_confidence - 92.0).abs() < f64::EPSILON);
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].user_id.as_deref(), Some("u1"));

    let seen = collect_events(&mut events, Duration::from_millis(300)).await;
    let started = seen.iter().find_map(|event| match event {
        MonitorEvent::CaptureStarted { request_id } => Some(*request_id),
        _ => None,
    });
    assert_eq!(started, Some(request_id));

    let decision = seen
        .iter()
        .find_map(|event| match event {
            MonitorEvent::AccessDecision { attempt, is_self } => Some((attempt.clone(), *is_self)),
            _ => None,
        })
        .expect("no access decision emitted");
    assert!(decision.0.success);
    assert_eq!(decision.0.id, recent[0].id);
    assert!(!decision.1, "operator id differs from the resolved user");

    // the slot is released once verification finished
    wait_until("session idle", || {
        harness.handle.capture_phase() == CapturePhase::Idle
    })
    .await;
    assert_eq!(
        harness.handle.status().connection,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_verification_failure_records_nothing() {
    let mut verifier = MockVerif::new();
    verifier
        .expect_verify()
        .returning(|_| Err(VerificationError::Service("timeout".to_string())));

    let mut harness = start_session(test_config(), verifier);
    connected(&mut harness).await;

    let mut events = harness.handle.subscribe();
    harness.handle.request_capture(false).await.unwrap();
    let _ = harness.agent.next_sent().await;

    harness
        .agent
        .push(json!({
            "type": "fingerprint_captured",
            "data": { "template": "T1", "quality": 90 }
        }))
        .await;

    let seen = collect_events(&mut events, Duration::from_millis(300)).await;
    assert!(
        seen.iter().any(|event| matches!(
            event,
            MonitorEvent::Notice { severity: Severity::Error, message }
                if message.contains("Verification failed")
        )),
        "a failed call must surface as a verification error"
    );
    assert!(
        !seen
            .iter()
            .any(|event| matches!(event, MonitorEvent::AccessDecision { .. })),
        "a failed call is not an access decision"
    );

    // nothing recorded: a verification error is not a denial
    let (stats, recent) = harness.handle.snapshot();
    assert_eq!(stats.total_today, 0);
    assert_eq!(stats.denied_today, 0);
    assert!(recent.is_empty());

    // and the session is free for a retry capture
    wait_until("session idle", || {
        harness.handle.capture_phase() == CapturePhase::Idle
    })
    .await;
    tokio_test::assert_ok!(harness.handle.request_capture(false).await);
}

#[tokio::test]
async fn test_second_capture_is_rejected_while_one_is_active() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    harness.handle.request_capture(false).await.unwrap();
    assert_eq!(
        harness.handle.request_capture(false).await,
        Err(CaptureRequestError::Busy)
    );

    harness.agent.push(json!({ "type": "capture_started" })).await;
    wait_until("capturing", || {
        harness.handle.capture_phase() == CapturePhase::Capturing
    })
    .await;
    assert_eq!(
        harness.handle.request_capture(false).await,
        Err(CaptureRequestError::Busy)
    );
}

#[tokio::test]
async fn test_silent_agent_times_out_exactly_once() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    let mut events = harness.handle.subscribe();
    harness.handle.request_capture(false).await.unwrap();
    let _ = harness.agent.next_sent().await;
    // the agent never answers; only the local deadline can end this

    let seen = collect_events(&mut events, Duration::from_millis(700)).await;
    let timeouts = seen
        .iter()
        .filter(|event| {
            matches!(
                event,
                MonitorEvent::Notice { severity: Severity::Warning, message }
                    if message.contains("Capture timed out")
            )
        })
        .count();
    assert_eq!(timeouts, 1, "exactly one timeout notification");

    assert_eq!(harness.handle.capture_phase(), CapturePhase::Idle);
    tokio_test::assert_ok!(harness.handle.request_capture(false).await);
}

#[tokio::test]
async fn test_agent_capture_error_ends_only_the_session() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    let mut events = harness.handle.subscribe();
    harness.handle.request_capture(false).await.unwrap();
    let _ = harness.agent.next_sent().await;

    harness
        .agent
        .push(json!({ "type": "capture_error", "error": "sensor busy" }))
        .await;

    let seen = collect_events(&mut events, Duration::from_millis(200)).await;
    assert!(seen.iter().any(|event| matches!(
        event,
        MonitorEvent::Notice { severity: Severity::Error, message }
            if message.contains("sensor busy")
    )));

    // connection is unaffected
    assert_eq!(
        harness.handle.status().connection,
        ConnectionState::Connected
    );
    assert_eq!(harness.handle.capture_phase(), CapturePhase::Idle);
}

#[tokio::test]
async fn test_unusable_template_never_reaches_verification() {
    // no expectations: a verify call would fail the test
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    let mut events = harness.handle.subscribe();
    harness
        .agent
        .push(json!({
            "type": "fingerprint_captured",
            "data": { "quality": 40 }
        }))
        .await;

    let seen = collect_events(&mut events, Duration::from_millis(200)).await;
    assert!(seen.iter().any(|event| matches!(
        event,
        MonitorEvent::Notice { severity: Severity::Error, message }
            if message.contains("no usable template")
    )));
    assert_eq!(harness.handle.stats().total_today, 0);
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);

    harness.agent.drop_connection().await;

    let opens = harness.opens.clone();
    wait_until("reconnect", || opens.load(Ordering::SeqCst) >= 2).await;
    let handle = &harness.handle;
    wait_until("connected again", || {
        handle.status().connection == ConnectionState::Connected
    })
    .await;
}

#[tokio::test]
async fn test_retries_until_the_agent_comes_up() {
    let opens = Arc::new(AtomicUsize::new(0));
    let refuse = Arc::new(AtomicBool::new(true));
    let events_slot = Arc::new(Mutex::new(None));
    let (sent_tx, _sent_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(FakeTransport {
        opens: opens.clone(),
        refuse: refuse.clone(),
        events_slot,
        sent_tx,
    });
    let handle = MonitorManager::start_with(test_config(), transport, Arc::new(MockVerif::new()))
        .expect("failed to start session");

    wait_until("failed badge", || {
        handle.status().connection == ConnectionState::Failed
    })
    .await;
    assert_eq!(opens.load(Ordering::SeqCst), 0);

    // agent comes up; the fixed-interval retry finds it
    refuse.store(false, Ordering::SeqCst);
    wait_until("connected", || {
        handle.status().connection == ConnectionState::Connected
    })
    .await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_no_reconnect_fires_after_stop() {
    let mut config = test_config();
    config.reconnect_interval_ms = 100;
    let mut harness = start_session(config, MockVerif::new());
    connected(&mut harness).await;

    // a retry is now pending...
    harness.agent.drop_connection().await;
    // ...and stop lands before it fires
    harness.handle.stop().await;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        harness.opens.load(Ordering::SeqCst),
        1,
        "a pending retry must not reopen a stopped session"
    );

    let status = harness.handle.status();
    assert_eq!(status.connection, ConnectionState::Disconnected);
    assert!(!status.monitoring_enabled);
    assert!(!harness.handle.is_running());
}

#[tokio::test]
async fn test_stop_aborts_an_inflight_capture() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    harness.handle.request_capture(false).await.unwrap();
    harness.handle.stop().await;

    assert_eq!(harness.handle.capture_phase(), CapturePhase::Idle);
    assert_eq!(
        harness.handle.request_capture(false).await,
        Err(CaptureRequestError::NotRunning)
    );
}

#[tokio::test]
async fn test_malformed_frames_leave_the_connection_open() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    harness.agent.push_raw("this is not json").await;
    harness
        .agent
        .push(json!({
            "type": "device_status",
            "data": { "isConnected": "yes" }
        }))
        .await;

    // a well-formed frame afterwards is still processed
    harness
        .agent
        .push(json!({
            "type": "device_status",
            "data": { "isConnected": true, "fingerprintCount": 7, "deviceCount": 3 }
        }))
        .await;

    let handle = &harness.handle;
    wait_until("device listed", || !handle.devices().is_empty()).await;
    assert_eq!(
        harness.handle.status().connection,
        ConnectionState::Connected
    );
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_device_status_upserts_by_id() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    harness
        .agent
        .push(json!({
            "type": "device_status",
            "data": { "isConnected": true, "fingerprintCount": 7, "deviceCount": 3 }
        }))
        .await;

    let handle = &harness.handle;
    wait_until("device listed", || !handle.devices().is_empty()).await;

    let devices = harness.handle.devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "zk-device-real");
    assert_eq!(devices[0].status, DeviceState::Connected);
    assert_eq!(devices[0].fingerprint_count, 7);
    assert_eq!(devices[0].user_count, 3);
    assert!(harness.handle.status().device_connected);

    harness
        .agent
        .push(json!({
            "type": "device_status",
            "data": { "isConnected": false, "fingerprintCount": 7 }
        }))
        .await;

    wait_until("device disconnected", || {
        handle
            .devices()
            .first()
            .map(|d| d.status == DeviceState::Disconnected)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(harness.handle.devices().len(), 1, "replaced, not appended");
}

#[tokio::test]
async fn test_unknown_message_types_are_tolerated() {
    let mut harness = start_session(test_config(), MockVerif::new());
    connected(&mut harness).await;

    harness
        .agent
        .push(json!({ "type": "fingerprint_identified", "data": { "x": 1 } }))
        .await;

    let handle = &harness.handle;
    wait_until("message noted", || {
        handle
            .status()
            .last_message
            .map(|m| m.contains("Unhandled"))
            .unwrap_or(false)
    })
    .await;
    assert!(harness.handle.is_running());
    assert_eq!(
        harness.handle.status().connection,
        ConnectionState::Connected
    );
}
