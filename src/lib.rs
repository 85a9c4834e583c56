//! # Cubesat OBC decision core
//!
//! Fuses EPS power telemetry and ground commands into one authoritative
//! operating state, arbitrates subsystem control, and keeps a reliable
//! presence over an unreliable publish/subscribe link.
//!
//! ## Features
//!
//! - **Operating state machine**: BOOT, NOMINAL, LOW_POWER, SAFE_MODE,
//!   CRITICAL_FAULT and a terminal SHUTDOWN, with threshold hysteresis
//! - **Command dispatch**: allow-listed commands, idempotent by id, one
//!   ack/nack per command
//! - **Telemetry**: retained heartbeat, immediate transition publishes and a
//!   full resync after every (re)connection
//! - **Reconnection**: bounded exponential backoff with jitter, never gives up
//! - **Fail-safe**: stale power data drives CRITICAL_FAULT
//!
//! ## Quick Start
//!
//! ```rust
//! use cubesat_obc::{Action, AgentConfig, ConnectivityEvent, ObcAgent, ObcEvent};
//!
//! let now = 1_700_000_000_000;
//! let mut agent = ObcAgent::new(AgentConfig::default(), now);
//! assert_eq!(agent.start(now), vec![Action::Connect]);
//!
//! // The runtime executes the returned actions against a transport.
//! let actions = agent.handle(ObcEvent::Connectivity(ConnectivityEvent::Connected), now);
//! assert!(actions.iter().any(|a| matches!(a, Action::Publish(_))));
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - the single-writer core and its event/action types
//! - [`state_machine`] - operating states and the transition table
//! - [`dispatcher`] / [`dedup`] - command validation and idempotence
//! - [`power`] - EPS reading cache and staleness
//! - [`telemetry`] / [`reconnect`] - status publishing and backoff
//! - [`protocol`] - topics and wire formats
//! - [`transport`] / [`runtime`] - adapters and the tokio event loop
//! - [`config`] - TOML configuration

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

pub mod agent;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod power;
pub mod protocol;
pub mod reconnect;
pub mod runtime;
pub mod state_machine;
pub mod telemetry;
pub mod transport;

pub use agent::{Action, AgentConfig, AgentStats, ObcAgent, ObcEvent};
pub use config::{ConfigError, ObcConfig};
pub use dispatcher::{CommandDispatcher, DispatchResult, DispatcherConfig};
pub use power::{PowerStatus, PowerStatusCache};
pub use protocol::{
    CommandAck, InboundMessage, NackReason, OutboundMessage, ProtocolError, QoS, StatusReport,
};
pub use reconnect::{BackoffPolicy, ConnectionState, ReconnectManager};
pub use runtime::{now_ms, run, RunOutcome, RuntimeConfig};
pub use state_machine::{
    ConnectivityEvent, Event, OperatingState, StateChange, StateCommand, StateMachine,
    StateMachineConfig, TransitionCause,
};
pub use telemetry::TelemetryPublisher;
pub use transport::{
    ChannelTransport, LineTransport, LineTransportConfig, LoopbackPeer, Transport, TransportError,
};
