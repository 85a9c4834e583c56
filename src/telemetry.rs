use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::power::PowerStatus;
use crate::protocol::{
    epoch_seconds, CommandAck, OutboundMessage, ProtocolError, ProtocolHandler, StatusReport,
};
use crate::reconnect::ConnectionState;
use crate::state_machine::StateMachine;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Transition records carried in a resync publish.
pub const RESYNC_HISTORY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Heartbeat,
    Transition,
    Resync,
    Final,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TelemetryStats {
    pub heartbeats: u32,
    pub transitions: u32,
    pub resyncs: u32,
    pub acks: u32,
    pub last_heartbeat_ms: Option<u64>,
}

/// Builds the status and ack publications.
///
/// Every status carries a sequence number so observers can tell a missed
/// heartbeat from a retained replay.
#[derive(Debug, Default)]
pub struct TelemetryPublisher {
    protocol: ProtocolHandler,
    sequence: u32,
    stats: TelemetryStats,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_report(
        &mut self,
        kind: StatusKind,
        machine: &StateMachine,
        connection: ConnectionState,
        now_ms: u64,
    ) -> StatusReport {
        self.sequence = self.sequence.wrapping_add(1);
        StatusReport {
            state: machine.state(),
            cause: machine.last_cause(),
            connection_state: connection,
            ts: epoch_seconds(now_ms),
            alive: kind != StatusKind::Final,
            seq: self.sequence,
            resync: false,
            power: None,
            history: None,
            outage_retries: None,
        }
    }

    pub fn heartbeat(
        &mut self,
        machine: &StateMachine,
        connection: ConnectionState,
        now_ms: u64,
    ) -> Result<OutboundMessage, ProtocolError> {
        let report = self.status_report(StatusKind::Heartbeat, machine, connection, now_ms);
        let message = self.encode(&report)?;
        self.stats.heartbeats = self.stats.heartbeats.saturating_add(1);
        self.stats.last_heartbeat_ms = Some(now_ms);
        debug!(seq = report.seq, state = %report.state, "heartbeat");
        Ok(message)
    }

    pub fn transition(
        &mut self,
        machine: &StateMachine,
        connection: ConnectionState,
        now_ms: u64,
    ) -> Result<OutboundMessage, ProtocolError> {
        let report = self.status_report(StatusKind::Transition, machine, connection, now_ms);
        self.stats.transitions = self.stats.transitions.saturating_add(1);
        self.encode(&report)
    }

    /// Full state for observers that may have missed updates while the link
    /// was down.
    pub fn resync(
        &mut self,
        machine: &StateMachine,
        connection: ConnectionState,
        power: Option<&PowerStatus>,
        outage_retries: u32,
        now_ms: u64,
    ) -> Result<OutboundMessage, ProtocolError> {
        let mut report = self.status_report(StatusKind::Resync, machine, connection, now_ms);
        let skip = machine.history().count().saturating_sub(RESYNC_HISTORY_LEN);
        report.resync = true;
        report.power = power.cloned();
        report.history = Some(machine.history().skip(skip).copied().collect());
        report.outage_retries = Some(outage_retries);
        self.stats.resyncs = self.stats.resyncs.saturating_add(1);
        self.encode(&report)
    }

    /// Last retained status before a graceful disconnect.
    pub fn final_status(
        &mut self,
        machine: &StateMachine,
        connection: ConnectionState,
        now_ms: u64,
    ) -> Result<OutboundMessage, ProtocolError> {
        let report = self.status_report(StatusKind::Final, machine, connection, now_ms);
        self.encode(&report)
    }

    pub fn ack(&mut self, ack: &CommandAck) -> Result<OutboundMessage, ProtocolError> {
        let payload = self.protocol.serialize_ack(ack)?;
        let message = OutboundMessage::ack(payload);
        self.stats.acks = self.stats.acks.saturating_add(1);
        Ok(message)
    }

    fn encode(&mut self, report: &StatusReport) -> Result<OutboundMessage, ProtocolError> {
        let payload = self.protocol.serialize_status(report)?;
        Ok(OutboundMessage::status(payload))
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn get_stats(&self) -> &TelemetryStats {
        &self.stats
    }
}
