//! Transport adapter contract and the adapters shipped with the crate.
//!
//! Adapters never touch core state. Everything they learn (connection
//! outcomes, inbound messages, link loss) is sent into the event loop's
//! queue as an [`ObcEvent`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::ObcEvent;
use crate::protocol::{InboundMessage, OutboundMessage, QoS};
use crate::state_machine::ConnectivityEvent;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("event queue closed")]
    QueueClosed,
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-blocking publish/subscribe channel to the broker.
///
/// `connect` only starts an attempt. Its outcome arrives later as
/// `ObcEvent::Connectivity`.
pub trait Transport {
    fn connect(&mut self) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;
    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

pub type EventSender = mpsc::UnboundedSender<ObcEvent>;

/// In-process loopback transport. The [`LoopbackPeer`] plays the broker:
/// it sees every publish and can inject inbound messages or drop the link.
#[derive(Debug)]
pub struct ChannelTransport {
    events: EventSender,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    link_up: Arc<AtomicBool>,
    accept_connections: Arc<AtomicBool>,
    subscriptions: Vec<String>,
}

#[derive(Debug)]
pub struct LoopbackPeer {
    events: EventSender,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    link_up: Arc<AtomicBool>,
    accept_connections: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn pair(events: EventSender) -> (Self, LoopbackPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let link_up = Arc::new(AtomicBool::new(false));
        let accept_connections = Arc::new(AtomicBool::new(true));
        (
            Self {
                events: events.clone(),
                outbound: outbound_tx,
                link_up: Arc::clone(&link_up),
                accept_connections: Arc::clone(&accept_connections),
                subscriptions: Vec::new(),
            },
            LoopbackPeer {
                events,
                outbound: outbound_rx,
                link_up,
                accept_connections,
            },
        )
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    fn notify(&self, event: ConnectivityEvent) -> Result<(), TransportError> {
        self.events
            .send(ObcEvent::Connectivity(event))
            .map_err(|_| TransportError::QueueClosed)
    }
}

impl Transport for ChannelTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.accept_connections.load(Ordering::SeqCst) {
            self.link_up.store(true, Ordering::SeqCst);
            self.notify(ConnectivityEvent::Connected)
        } else {
            self.notify(ConnectivityEvent::Disconnected)
        }
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        if !self.link_up.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| TransportError::QueueClosed)
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.link_up.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl LoopbackPeer {
    pub fn inject(&self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.events
            .send(ObcEvent::Inbound(InboundMessage::new(topic, payload)))
            .map_err(|_| TransportError::QueueClosed)
    }

    /// Simulates a broker-side link loss.
    pub fn drop_link(&self) -> Result<(), TransportError> {
        self.link_up.store(false, Ordering::SeqCst);
        self.events
            .send(ObcEvent::Connectivity(ConnectivityEvent::Disconnected))
            .map_err(|_| TransportError::QueueClosed)
    }

    pub fn set_accept_connections(&self, accept: bool) {
        self.accept_connections.store(accept, Ordering::SeqCst);
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    pub async fn next_publish(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    pub fn try_next_publish(&mut self) -> Option<OutboundMessage> {
        self.outbound.try_recv().ok()
    }
}

/// Frames exchanged with a broker bridge, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OutboundFrame {
    Connect {
        client_id: String,
        keepalive_s: u16,
    },
    Subscribe {
        topic: String,
        qos: QoS,
    },
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retain: bool,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: Value,
}

impl InboundFrame {
    pub fn into_message(self) -> InboundMessage {
        let payload = match self.payload {
            Value::String(s) => s,
            other => other.to_string(),
        };
        InboundMessage::new(self.topic, payload)
    }
}

#[derive(Debug, Clone)]
pub struct LineTransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_s: u16,
}

/// TCP client speaking newline-delimited JSON frames to a broker bridge.
///
/// Each connect spawns one reader and one writer task. A new connect or a
/// disconnect aborts the previous reader. Its writer drains what was queued
/// and closes the socket once its sender is dropped. A generation counter
/// keeps a superseded connection from reporting into the queue.
#[derive(Debug)]
pub struct LineTransport {
    config: LineTransportConfig,
    events: EventSender,
    writer: Option<mpsc::UnboundedSender<String>>,
    connection: Option<JoinHandle<()>>,
    generation: Arc<AtomicU64>,
}

impl LineTransport {
    pub fn new(config: LineTransportConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            writer: None,
            connection: None,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn abort_connection(&mut self) {
        if let Some(handle) = self.connection.take() {
            handle.abort();
        }
    }

    fn send_frame(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let writer = self.writer.as_ref().ok_or(TransportError::NotConnected)?;
        let line = serde_json::to_string(frame)?;
        writer.send(line).map_err(|_| TransportError::NotConnected)
    }
}

impl Transport for LineTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_connection();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<String>();
        self.writer = Some(writer_tx);

        let hello = serde_json::to_string(&OutboundFrame::Connect {
            client_id: self.config.client_id.clone(),
            keepalive_s: self.config.keepalive_s,
        })?;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let events = self.events.clone();
        let current = Arc::clone(&self.generation);

        self.connection = Some(tokio::spawn(async move {
            run_connection(addr, hello, generation, current, events, writer_rx).await;
        }));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.send_frame(&OutboundFrame::Subscribe {
            topic: topic.to_string(),
            qos,
        })
    }

    fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        self.send_frame(&OutboundFrame::Publish {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            retain: message.retain,
        })
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let result = self.send_frame(&OutboundFrame::Disconnect);
        // Retire the connection so its reader does not report the close.
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.writer = None;
        self.abort_connection();
        result
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.abort_connection();
    }
}

async fn run_connection(
    addr: String,
    hello: String,
    generation: u64,
    current: Arc<AtomicU64>,
    events: EventSender,
    mut writer_rx: mpsc::UnboundedReceiver<String>,
) {
    let is_current = || current.load(Ordering::SeqCst) == generation;
    let report = |event: ObcEvent| {
        if is_current() {
            // Queue closed means the loop is gone; nothing left to tell.
            let _ = events.send(event);
        }
    };

    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%addr, error = %e, "broker bridge connect failed");
            report(ObcEvent::Connectivity(ConnectivityEvent::Disconnected));
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();
    if let Err(e) = write_line(&mut writer, &hello).await {
        warn!(%addr, error = %e, "broker bridge handshake failed");
        report(ObcEvent::Connectivity(ConnectivityEvent::Disconnected));
        return;
    }
    info!(%addr, "broker bridge connected");
    report(ObcEvent::Connectivity(ConnectivityEvent::Connected));

    let writer_task = tokio::spawn(async move {
        while let Some(line) = writer_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                error!(error = %e, "failed to write frame");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<InboundFrame>(trimmed) {
                    Ok(frame) => report(ObcEvent::Inbound(frame.into_message())),
                    Err(e) => warn!(error = %e, "dropping malformed frame"),
                }
            }
            Ok(None) => {
                debug!(%addr, "broker bridge closed the connection");
                break;
            }
            Err(e) => {
                warn!(%addr, error = %e, "broker bridge read error");
                break;
            }
        }
    }

    writer_task.abort();
    report(ObcEvent::Connectivity(ConnectivityEvent::Disconnected));
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_frame_encoding() {
        let frame = OutboundFrame::Publish {
            topic: "cubesat/obc/status".to_string(),
            payload: r#"{"state":"BOOT"}"#.to_string(),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.starts_with(r#"{"op":"publish""#));
        assert!(json.contains(r#""qos":1"#));
        assert!(json.contains(r#""retain":true"#));
    }

    #[test]
    fn test_inbound_frame_payload_forms() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"topic":"cubesat/command","payload":{"id":"c1","name":"resume"}}"#)
                .unwrap();
        let msg = frame.into_message();
        assert_eq!(msg.topic, "cubesat/command");
        let value: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(value["name"], "resume");

        let frame: InboundFrame =
            serde_json::from_str(r#"{"topic":"cubesat/command","payload":"{\"id\":\"c2\"}"}"#)
                .unwrap();
        assert_eq!(frame.into_message().payload, r#"{"id":"c2"}"#);
    }

    #[tokio::test]
    async fn test_channel_transport_connect_and_publish() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut transport, mut peer) = ChannelTransport::pair(events_tx);

        let msg = OutboundMessage::ack("{}");
        assert!(matches!(
            transport.publish(&msg),
            Err(TransportError::NotConnected)
        ));

        transport.connect().unwrap();
        assert!(matches!(
            events_rx.recv().await,
            Some(ObcEvent::Connectivity(ConnectivityEvent::Connected))
        ));
        transport.subscribe("cubesat/command", QoS::AtLeastOnce).unwrap();
        transport.subscribe("cubesat/command", QoS::AtLeastOnce).unwrap();
        assert_eq!(transport.subscriptions().len(), 1);

        transport.publish(&msg).unwrap();
        assert_eq!(peer.next_publish().await, Some(msg));
    }

    #[tokio::test]
    async fn test_channel_transport_refused_connect() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut transport, peer) = ChannelTransport::pair(events_tx);
        peer.set_accept_connections(false);

        transport.connect().unwrap();
        assert!(matches!(
            events_rx.recv().await,
            Some(ObcEvent::Connectivity(ConnectivityEvent::Disconnected))
        ));
        assert!(!peer.is_link_up());
    }
}
