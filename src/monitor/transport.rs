// Transport layer for the capture agent connection.
//
// A transport owns exactly one socket per open() call and reports what
// happens on it in receipt order. Retry policy lives in the supervisor,
// not here.

use async_trait::async_trait;
use colored::*;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::protocol_debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid agent endpoint '{url}': {detail}")]
    InvalidEndpoint { url: String, detail: String },
    #[error("failed to connect to capture agent: {0}")]
    Connect(String),
    #[error("connection is not open")]
    NotConnected,
}

/// Connection lifecycle events, delivered in receipt order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    /// One inbound text frame, undecoded
    Message(String),
    Closed { reason: Option<String> },
    Error { detail: String },
}

/// Factory for connections to the capture agent
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one connection. Events for its whole lifetime are delivered
    /// on `events`; the returned link sends frames and closes it.
    async fn open(
        &self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// Send/close half of one open connection
#[async_trait]
pub trait TransportLink: Send + Sync {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    async fn close(&mut self);
}

enum LinkCommand {
    Send(String),
    Close,
}

/// WebSocket transport to the agent bridge
#[derive(Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        let endpoint = url::Url::parse(url).map_err(|e| TransportError::InvalidEndpoint {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let (ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        debug!("{}: connected to {}", "WS_OPEN".green(), endpoint);
        let _ = events.send(TransportEvent::Opened).await;

        let (command_tx, command_rx) = mpsc::channel::<LinkCommand>(64);
        tokio::spawn(run_socket(ws, command_rx, events));

        Ok(Box::new(WsLink { command_tx }))
    }
}

struct WsLink {
    command_tx: mpsc::Sender<LinkCommand>,
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.command_tx
            .send(LinkCommand::Send(frame))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    async fn close(&mut self) {
        let _ = self.command_tx.send(LinkCommand::Close).await;
    }
}

/// Single task owning the socket: serializes outbound frames with inbound
/// reads so control frames (ping/pong) are answered promptly.
async fn run_socket(
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(LinkCommand::Send(frame)) => {
                        protocol_debug!("outbound frame: {}", frame);
                        if let Err(e) = ws.send(Message::Text(frame)).await {
                            warn!("{}: send failed: {}", "WS_SEND_ERROR".red(), e);
                            let _ = events
                                .send(TransportEvent::Error { detail: e.to_string() })
                                .await;
                            break;
                        }
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = ws.close(None).await;
                        let _ = events
                            .send(TransportEvent::Closed {
                                reason: Some("closed by client".to_string()),
                            })
                            .await;
                        return;
                    }
                }
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        protocol_debug!("inbound frame: {}", text);
                        if events.send(TransportEvent::Message(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Agent heartbeat; unanswered pings get us dropped
                        if ws.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = events.send(TransportEvent::Closed { reason }).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("{}: read failed: {}", "WS_READ_ERROR".red(), e);
                        let _ = events
                            .send(TransportEvent::Error { detail: e.to_string() })
                            .await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let _ = events
        .send(TransportEvent::Closed {
            reason: Some("connection lost".to_string()),
        })
        .await;
}
