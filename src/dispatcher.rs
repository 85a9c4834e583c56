use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dedup::CommandDedupWindow;
use crate::protocol::{
    CommandAck, NackReason, OutboundMessage, ProtocolError, ProtocolHandler, MAX_COMMAND_ID_LEN,
};
use crate::state_machine::{
    CommandRejection, Event, OperatingState, StateChange, StateCommand, StateMachine,
};

const CONTROL_PREFIX: &str = "control/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandName {
    EnterSafeMode,
    Shutdown,
    Resume,
    /// `control/<subsystem>[/...]`, forwarded to `cubesat/control/<subsystem>`.
    Control { subsystem: String },
}

impl CommandName {
    pub fn parse(name: &str) -> Result<Self, NackReason> {
        match name {
            "enter_safe_mode" => Ok(CommandName::EnterSafeMode),
            "shutdown" => Ok(CommandName::Shutdown),
            "resume" => Ok(CommandName::Resume),
            other => {
                let rest = other
                    .strip_prefix(CONTROL_PREFIX)
                    .ok_or(NackReason::UnknownCommand)?;
                let subsystem = rest.split('/').next().unwrap_or_default();
                if is_valid_subsystem(subsystem) {
                    Ok(CommandName::Control {
                        subsystem: subsystem.to_string(),
                    })
                } else {
                    Err(NackReason::InvalidSubsystem)
                }
            }
        }
    }

    pub fn state_command(&self) -> Option<StateCommand> {
        match self {
            CommandName::EnterSafeMode => Some(StateCommand::EnterSafeMode),
            CommandName::Shutdown => Some(StateCommand::Shutdown),
            CommandName::Resume => Some(StateCommand::Resume),
            CommandName::Control { .. } => None,
        }
    }
}

// Subsystem names become a topic segment, so wildcards and separators are out.
fn is_valid_subsystem(subsystem: &str) -> bool {
    !subsystem.is_empty()
        && subsystem
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}

// Longest prefix of `id` within `MAX_COMMAND_ID_LEN` bytes that ends on a
// char boundary.
fn truncate_id(id: &str) -> &str {
    if id.len() <= MAX_COMMAND_ID_LEN {
        return id;
    }
    let mut end = MAX_COMMAND_ID_LEN;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

/// A validated command. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub name: CommandName,
    pub args: Map<String, Value>,
    pub received_at_ms: u64,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchResult {
    /// State-machine command applied. `change` is `None` for self-loops.
    Executed {
        ack: CommandAck,
        change: Option<StateChange>,
    },
    /// Subsystem command handed to its control topic. `message` carries the
    /// raw command payload.
    Forwarded {
        ack: CommandAck,
        message: OutboundMessage,
    },
    Rejected { ack: CommandAck },
    /// Id already in the dedup window; `ack` is the one computed the first time.
    Duplicate { ack: CommandAck },
    /// Unparseable payload; nothing to acknowledge.
    Dropped { error: ProtocolError },
}

impl DispatchResult {
    pub fn ack(&self) -> Option<&CommandAck> {
        match self {
            DispatchResult::Executed { ack, .. }
            | DispatchResult::Forwarded { ack, .. }
            | DispatchResult::Rejected { ack }
            | DispatchResult::Duplicate { ack } => Some(ack),
            DispatchResult::Dropped { .. } => None,
        }
    }

    pub fn state_change(&self) -> Option<&StateChange> {
        match self {
            DispatchResult::Executed { change, .. } => change.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub dedup_expiry_ms: u64,
    pub block_control_in_safe_mode: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_expiry_ms: crate::dedup::DEFAULT_DEDUP_EXPIRY_MS,
            block_control_in_safe_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DispatchStats {
    pub received: u32,
    pub executed: u32,
    pub forwarded: u32,
    pub rejected: u32,
    pub duplicates: u32,
    pub dropped: u32,
}

#[derive(Debug)]
pub struct CommandDispatcher {
    protocol: ProtocolHandler,
    dedup: CommandDedupWindow,
    config: DispatcherConfig,
    stats: DispatchStats,
}

impl CommandDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            protocol: ProtocolHandler::new(),
            dedup: CommandDedupWindow::new(config.dedup_expiry_ms),
            config,
            stats: DispatchStats::default(),
        }
    }

    pub fn submit(&mut self, raw: &str, machine: &mut StateMachine, now_ms: u64) -> DispatchResult {
        self.stats.received = self.stats.received.saturating_add(1);

        let message = match self.protocol.parse_command(raw) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping malformed command");
                self.stats.dropped = self.stats.dropped.saturating_add(1);
                return DispatchResult::Dropped { error };
            }
        };

        if let Some(previous) = self.dedup.lookup(&message.id, now_ms) {
            debug!(id = %message.id, "duplicate command, re-acknowledging");
            let ack = previous.clone();
            self.stats.duplicates = self.stats.duplicates.saturating_add(1);
            return DispatchResult::Duplicate { ack };
        }

        let command = match Self::validate(message, now_ms) {
            Ok(command) => command,
            // The id is not a usable dedup key, so the nack is not remembered.
            Err((id, NackReason::InvalidId)) => {
                warn!(%id, "command id rejected");
                self.stats.rejected = self.stats.rejected.saturating_add(1);
                return DispatchResult::Rejected {
                    ack: CommandAck::nack(id, NackReason::InvalidId),
                };
            }
            Err((id, reason)) => return self.reject(id, reason, now_ms),
        };

        info!(
            id = %command.id,
            name = ?command.name,
            source = command.source.as_deref().unwrap_or("unknown"),
            "dispatching command"
        );

        match command.name.state_command() {
            Some(state_command) => self.execute(command.id, state_command, machine, now_ms),
            None => self.forward(command, machine.state(), now_ms),
        }
    }

    fn validate(
        message: crate::protocol::CommandMessage,
        now_ms: u64,
    ) -> Result<Command, (String, NackReason)> {
        if message.id.is_empty() || message.id.len() > MAX_COMMAND_ID_LEN {
            return Err((truncate_id(&message.id).to_string(), NackReason::InvalidId));
        }

        let name = match CommandName::parse(&message.name) {
            Ok(name) => name,
            Err(reason) => return Err((message.id, reason)),
        };

        if message
            .args
            .values()
            .any(|v| matches!(v, Value::Array(_) | Value::Object(_)))
        {
            return Err((message.id, NackReason::InvalidArgs));
        }

        Ok(Command {
            id: message.id,
            name,
            args: message.args,
            received_at_ms: now_ms,
            source: message.source,
        })
    }

    fn execute(
        &mut self,
        id: String,
        command: StateCommand,
        machine: &mut StateMachine,
        now_ms: u64,
    ) -> DispatchResult {
        if let Err(rejection) = machine.validate_command(command) {
            let reason = match rejection {
                CommandRejection::TerminalState => NackReason::TerminalState,
                CommandRejection::ResumeRejected => NackReason::ResumeRejected,
            };
            return self.reject(id, reason, now_ms);
        }

        let change = machine.apply(Event::Command(command), now_ms);
        let ack = CommandAck::ack(id);
        self.dedup.record(ack.clone(), now_ms);
        self.stats.executed = self.stats.executed.saturating_add(1);
        DispatchResult::Executed { ack, change }
    }

    fn forward(&mut self, command: Command, state: OperatingState, now_ms: u64) -> DispatchResult {
        let CommandName::Control { subsystem } = &command.name else {
            return self.reject(command.id, NackReason::UnknownCommand, now_ms);
        };

        if state.is_terminal() {
            return self.reject(command.id, NackReason::TerminalState, now_ms);
        }
        if self.config.block_control_in_safe_mode
            && matches!(state, OperatingState::SafeMode | OperatingState::CriticalFault)
        {
            return self.reject(command.id, NackReason::SafeModeActive, now_ms);
        }

        let message = OutboundMessage::control(subsystem, self.protocol.last_command_payload());
        let ack = CommandAck::forwarded(command.id);
        self.dedup.record(ack.clone(), now_ms);
        self.stats.forwarded = self.stats.forwarded.saturating_add(1);
        DispatchResult::Forwarded { ack, message }
    }

    fn reject(&mut self, id: String, reason: NackReason, now_ms: u64) -> DispatchResult {
        warn!(%id, %reason, "command rejected");
        let ack = CommandAck::nack(id, reason);
        self.dedup.record(ack.clone(), now_ms);
        self.stats.rejected = self.stats.rejected.saturating_add(1);
        DispatchResult::Rejected { ack }
    }

    pub fn purge_expired(&mut self, now_ms: u64) {
        self.dedup.purge_expired(now_ms);
    }

    pub fn dedup_window(&self) -> &CommandDedupWindow {
        &self.dedup
    }

    pub fn get_stats(&self) -> &DispatchStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::PowerStatus;
    use crate::protocol::AckResult;
    use crate::state_machine::{ConnectivityEvent, StateMachineConfig};

    fn nominal_machine() -> StateMachine {
        let mut sm = StateMachine::new(StateMachineConfig::default(), 0);
        sm.apply(Event::Connectivity(ConnectivityEvent::Connected), 0);
        sm.apply(Event::PowerUpdate(PowerStatus::new(Some(80.0), true, 1)), 1);
        sm
    }

    #[test]
    fn test_command_name_parsing() {
        assert_eq!(CommandName::parse("shutdown"), Ok(CommandName::Shutdown));
        assert_eq!(
            CommandName::parse("control/adcs"),
            Ok(CommandName::Control {
                subsystem: "adcs".to_string()
            })
        );
        assert_eq!(
            CommandName::parse("control/payload/capture"),
            Ok(CommandName::Control {
                subsystem: "payload".to_string()
            })
        );
        assert_eq!(CommandName::parse("control/"), Err(NackReason::InvalidSubsystem));
        assert_eq!(CommandName::parse("control/#"), Err(NackReason::InvalidSubsystem));
        assert_eq!(CommandName::parse("self_destruct"), Err(NackReason::UnknownCommand));
    }

    #[test]
    fn test_safe_mode_command_executes() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();

        let result = dispatcher.submit(r#"{"id":"c1","name":"enter_safe_mode"}"#, &mut sm, 10);
        assert_eq!(result.ack(), Some(&CommandAck::ack("c1")));
        assert_eq!(result.state_change().map(|c| c.to), Some(OperatingState::SafeMode));
        assert_eq!(sm.state(), OperatingState::SafeMode);
    }

    #[test]
    fn test_duplicate_is_not_reexecuted() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();

        let first = dispatcher.submit(r#"{"id":"c1","name":"enter_safe_mode"}"#, &mut sm, 10);
        let history_len = sm.history().count();

        let second = dispatcher.submit(r#"{"id":"c1","name":"enter_safe_mode"}"#, &mut sm, 20);
        assert!(matches!(second, DispatchResult::Duplicate { .. }));
        assert_eq!(first.ack(), second.ack());
        assert_eq!(sm.history().count(), history_len);
        assert_eq!(dispatcher.get_stats().duplicates, 1);
    }

    #[test]
    fn test_unknown_command_nacked_and_remembered() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();

        let result = dispatcher.submit(r#"{"id":"x1","name":"deploy_antenna"}"#, &mut sm, 10);
        let ack = result.ack().unwrap();
        assert_eq!(ack.result, AckResult::Nack);
        assert_eq!(ack.reason, Some(NackReason::UnknownCommand));
        assert_eq!(sm.state(), OperatingState::Nominal);

        let again = dispatcher.submit(r#"{"id":"x1","name":"shutdown"}"#, &mut sm, 11);
        assert_eq!(again.ack(), Some(ack));
        assert_eq!(sm.state(), OperatingState::Nominal);
    }

    #[test]
    fn test_control_command_forwarded_verbatim() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();
        let raw = r#"{"id":"f1","name":"control/eps","args":{"heater":true},"source":"ground"}"#;

        let result = dispatcher.submit(raw, &mut sm, 10);
        match result {
            DispatchResult::Forwarded { ack, message } => {
                assert_eq!(ack.result, AckResult::Forwarded);
                assert_eq!(message.topic, "cubesat/control/eps");
                assert_eq!(message.payload, raw);
                assert!(!message.retain);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_args_rejected() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();
        let result = dispatcher.submit(
            r#"{"id":"a1","name":"control/adcs","args":{"target":[1,2,3]}}"#,
            &mut sm,
            10,
        );
        assert_eq!(
            result.ack().and_then(|a| a.reason),
            Some(NackReason::InvalidArgs)
        );
    }

    #[test]
    fn test_control_blocked_in_safe_mode_when_configured() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig {
            block_control_in_safe_mode: true,
            ..DispatcherConfig::default()
        });
        let mut sm = nominal_machine();
        sm.apply(Event::Command(StateCommand::EnterSafeMode), 5);

        let result = dispatcher.submit(r#"{"id":"b1","name":"control/payload"}"#, &mut sm, 10);
        assert_eq!(
            result.ack().and_then(|a| a.reason),
            Some(NackReason::SafeModeActive)
        );
    }

    #[test]
    fn test_malformed_payload_dropped() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();

        let result = dispatcher.submit("{oops", &mut sm, 10);
        assert!(matches!(result, DispatchResult::Dropped { .. }));
        assert!(result.ack().is_none());

        let result = dispatcher.submit(r#"{"id":"m1"}"#, &mut sm, 11);
        assert!(matches!(result, DispatchResult::Dropped { .. }));
        assert!(dispatcher.dedup_window().is_empty());
    }

    #[test]
    fn test_commands_after_shutdown() {
        let mut dispatcher = CommandDispatcher::new(DispatcherConfig::default());
        let mut sm = nominal_machine();
        dispatcher.submit(r#"{"id":"s1","name":"shutdown"}"#, &mut sm, 10);
        assert_eq!(sm.state(), OperatingState::Shutdown);

        let result = dispatcher.submit(r#"{"id":"s2","name":"enter_safe_mode"}"#, &mut sm, 11);
        assert_eq!(
            result.ack().and_then(|a| a.reason),
            Some(NackReason::TerminalState)
        );

        let result = dispatcher.submit(r#"{"id":"s3","name":"shutdown"}"#, &mut sm, 12);
        assert_eq!(result.ack(), Some(&CommandAck::ack("s3")));
        assert!(result.state_change().is_none());
        assert_eq!(sm.state(), OperatingState::Shutdown);
    }
}
