use arrayvec::ArrayString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::power::PowerStatus;
use crate::reconnect::ConnectionState;
use crate::state_machine::{OperatingState, StateChange, TransitionCause};

pub const STATUS_TOPIC: &str = "cubesat/obc/status";
pub const EPS_STATUS_TOPIC: &str = "cubesat/eps/status";
pub const COMMAND_TOPIC: &str = "cubesat/command";
pub const COMMAND_ACK_TOPIC: &str = "cubesat/command/ack";
pub const CONTROL_TOPIC_PREFIX: &str = "cubesat/control/";

pub const MAX_COMMAND_SIZE: usize = 1024;
pub const MAX_ACK_SIZE: usize = 512;
pub const MAX_STATUS_SIZE: usize = 8192;
pub const MAX_COMMAND_ID_LEN: usize = 64;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type AckBuffer = ArrayString<MAX_ACK_SIZE>;
pub type StatusBuffer = ArrayString<MAX_STATUS_SIZE>;

/// Delivery guarantee requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(ProtocolError::InvalidQos(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    /// Retained, at-least-once status publication.
    pub fn status(payload: impl Into<String>) -> Self {
        Self {
            topic: STATUS_TOPIC.to_string(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }

    pub fn ack(payload: impl Into<String>) -> Self {
        Self {
            topic: COMMAND_ACK_TOPIC.to_string(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn control(subsystem: &str, payload: impl Into<String>) -> Self {
        Self {
            topic: control_topic(subsystem),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

pub fn control_topic(subsystem: &str) -> String {
    format!("{CONTROL_TOPIC_PREFIX}{subsystem}")
}

/// Inbound command as it appears on `cubesat/command`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandMessage {
    #[serde(deserialize_with = "deserialize_command_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub source: Option<String>,
}

// Ground tools send either string or integer ids.
fn deserialize_command_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "command id must be a string or integer, got {other}"
        ))),
    }
}

/// EPS reading as published on `cubesat/eps/status`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EpsStatusMessage {
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    pub external_power: bool,
    /// Unix epoch seconds.
    pub timestamp: f64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckResult {
    Ack,
    Nack,
    Forwarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackReason {
    UnknownCommand,
    InvalidArgs,
    InvalidId,
    InvalidSubsystem,
    TerminalState,
    ResumeRejected,
    SafeModeActive,
}

impl NackReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NackReason::UnknownCommand => "unknown_command",
            NackReason::InvalidArgs => "invalid_args",
            NackReason::InvalidId => "invalid_id",
            NackReason::InvalidSubsystem => "invalid_subsystem",
            NackReason::TerminalState => "terminal_state",
            NackReason::ResumeRejected => "resume_rejected",
            NackReason::SafeModeActive => "safe_mode_active",
        }
    }
}

impl core::fmt::Display for NackReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub id: String,
    pub result: AckResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<NackReason>,
}

impl CommandAck {
    pub fn ack(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: AckResult::Ack,
            reason: None,
        }
    }

    pub fn nack(id: impl Into<String>, reason: NackReason) -> Self {
        Self {
            id: id.into(),
            result: AckResult::Nack,
            reason: Some(reason),
        }
    }

    pub fn forwarded(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: AckResult::Forwarded,
            reason: None,
        }
    }

    pub fn is_nack(&self) -> bool {
        self.result == AckResult::Nack
    }
}

/// Payload of `cubesat/obc/status`.
///
/// Heartbeats and transition publishes carry the base fields only; a resync
/// after (re)connection also carries the latest power reading, the recent
/// transition history and the retry count of the outage that just ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: OperatingState,
    pub cause: Option<TransitionCause>,
    pub connection_state: ConnectionState,
    /// Unix epoch seconds.
    pub ts: f64,
    pub alive: bool,
    pub seq: u32,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub resync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<StateChange>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outage_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("message of {size} bytes exceeds {limit} byte buffer")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("serialization failed: {0}")]
    SerializationError(String),
    #[error("invalid QoS level {0}")]
    InvalidQos(u8),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Data => ProtocolError::MalformedPayload(err.to_string()),
            Category::Io | Category::Syntax | Category::Eof => {
                ProtocolError::InvalidJson(err.to_string())
            }
        }
    }
}

/// Parses inbound payloads and serializes outbound ones through fixed-size
/// buffers so an oversized message is refused instead of growing memory.
#[derive(Debug, Default)]
pub struct ProtocolHandler {
    command_buffer: CommandBuffer,
    ack_buffer: AckBuffer,
    status_buffer: StatusBuffer,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a command. The raw payload stays buffered and is available via
    /// [`ProtocolHandler::last_command_payload`] until the next parse.
    pub fn parse_command(&mut self, json_str: &str) -> Result<CommandMessage, ProtocolError> {
        self.command_buffer.clear();
        self.command_buffer
            .try_push_str(json_str)
            .map_err(|_| ProtocolError::MessageTooLarge {
                size: json_str.len(),
                limit: MAX_COMMAND_SIZE,
            })?;

        Ok(serde_json::from_str::<CommandMessage>(&self.command_buffer)?)
    }

    pub fn parse_eps_status(&self, json_str: &str) -> Result<EpsStatusMessage, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: json_str.len(),
                limit: MAX_COMMAND_SIZE,
            });
        }
        Ok(serde_json::from_str::<EpsStatusMessage>(json_str)?)
    }

    pub fn serialize_ack(&mut self, ack: &CommandAck) -> Result<&str, ProtocolError> {
        self.ack_buffer.clear();
        let json_str = serde_json::to_string(ack)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        self.ack_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge {
                size: json_str.len(),
                limit: MAX_ACK_SIZE,
            })?;
        Ok(&self.ack_buffer)
    }

    pub fn serialize_status(&mut self, report: &StatusReport) -> Result<&str, ProtocolError> {
        self.status_buffer.clear();
        let json_str = serde_json::to_string(report)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        self.status_buffer
            .try_push_str(&json_str)
            .map_err(|_| ProtocolError::MessageTooLarge {
                size: json_str.len(),
                limit: MAX_STATUS_SIZE,
            })?;
        Ok(&self.status_buffer)
    }

    pub fn last_command_payload(&self) -> &str {
        &self.command_buffer
    }
}

pub fn epoch_seconds(timestamp_ms: u64) -> f64 {
    timestamp_ms as f64 / 1000.0
}
