use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{CommandDispatcher, DispatchResult, DispatcherConfig};
use crate::power::{CacheUpdate, PowerStatus, PowerStatusCache};
use crate::protocol::{
    InboundMessage, OutboundMessage, ProtocolError, ProtocolHandler, QoS, COMMAND_TOPIC,
    EPS_STATUS_TOPIC,
};
use crate::reconnect::{BackoffPolicy, ConnectionState, ReconnectManager};
use crate::state_machine::{
    ConnectivityEvent, Event, OperatingState, StateChange, StateCommand, StateMachine,
    StateMachineConfig,
};
use crate::telemetry::TelemetryPublisher;

/// Default EPS reporting interval. The staleness window is twice this.
pub const DEFAULT_EPS_INTERVAL_MS: u64 = 5_000;
/// How long a shutdown with the link down waits to deliver the final status.
pub const DEFAULT_FINAL_STATUS_GRACE_MS: u64 = 30_000;

/// Everything the event loop feeds into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum ObcEvent {
    Inbound(InboundMessage),
    Connectivity(ConnectivityEvent),
    /// Staleness check and housekeeping.
    Tick,
    HeartbeatTick,
    ReconnectDue,
    /// Local stop request (signal or operator).
    ShutdownRequested,
}

/// Side effects requested by the core, executed in order by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Connect,
    Subscribe { topic: &'static str, qos: QoS },
    Publish(OutboundMessage),
    Disconnect,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentConfig {
    pub machine: StateMachineConfig,
    pub dispatcher: DispatcherConfig,
    pub backoff: BackoffPolicy,
    pub max_attempts: Option<u32>,
    pub staleness_window_ms: u64,
    pub final_status_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            machine: StateMachineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            backoff: BackoffPolicy::default(),
            max_attempts: None,
            staleness_window_ms: 2 * DEFAULT_EPS_INTERVAL_MS,
            final_status_grace_ms: DEFAULT_FINAL_STATUS_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub events_handled: u32,
    pub eps_readings_rejected: u32,
    pub unknown_topics: u32,
    pub publishes_skipped: u32,
    pub encode_failures: u32,
    pub final_status_abandoned: bool,
}

/// The onboard decision core.
///
/// Owns every piece of mutable state and is driven from a single task.
/// `handle` never blocks and never performs I/O: it returns the actions the
/// runtime must carry out against the transport.
#[derive(Debug)]
pub struct ObcAgent<R = StdRng> {
    machine: StateMachine,
    power: PowerStatusCache,
    dispatcher: CommandDispatcher,
    telemetry: TelemetryPublisher,
    reconnect: ReconnectManager<R>,
    protocol: ProtocolHandler,
    final_status_grace_ms: u64,
    /// Set while SHUTDOWN waits for a link to publish its final status.
    final_status_deadline_ms: Option<u64>,
    stopped: bool,
    stats: AgentStats,
}

impl ObcAgent<StdRng> {
    pub fn new(config: AgentConfig, now_ms: u64) -> Self {
        Self::with_rng(config, now_ms, StdRng::from_entropy())
    }
}

impl<R: Rng> ObcAgent<R> {
    pub fn with_rng(config: AgentConfig, now_ms: u64, rng: R) -> Self {
        Self {
            machine: StateMachine::new(config.machine, now_ms),
            power: PowerStatusCache::new(config.staleness_window_ms),
            dispatcher: CommandDispatcher::new(config.dispatcher),
            telemetry: TelemetryPublisher::new(),
            reconnect: ReconnectManager::with_rng(config.backoff, config.max_attempts, rng),
            protocol: ProtocolHandler::new(),
            final_status_grace_ms: config.final_status_grace_ms,
            final_status_deadline_ms: None,
            stopped: false,
            stats: AgentStats::default(),
        }
    }

    /// Issues the first connection attempt.
    pub fn start(&mut self, _now_ms: u64) -> Vec<Action> {
        info!(state = %self.machine.state(), "OBC core starting");
        self.reconnect.begin_initial_attempt();
        vec![Action::Connect]
    }

    pub fn handle(&mut self, event: ObcEvent, now_ms: u64) -> Vec<Action> {
        if self.stopped {
            return Vec::new();
        }
        self.stats.events_handled = self.stats.events_handled.saturating_add(1);

        let mut actions = Vec::new();
        if let Some(deadline) = self.final_status_deadline_ms {
            self.handle_while_closing(&event, deadline, now_ms, &mut actions);
            return actions;
        }

        match event {
            ObcEvent::Inbound(message) => self.on_inbound(message, now_ms, &mut actions),
            ObcEvent::Connectivity(ConnectivityEvent::Connected) => {
                self.on_connected(now_ms, &mut actions)
            }
            ObcEvent::Connectivity(ConnectivityEvent::Disconnected) => {
                self.machine
                    .apply(Event::Connectivity(ConnectivityEvent::Disconnected), now_ms);
                if let Some(deadline) = self.reconnect.on_disconnected(now_ms) {
                    debug!(retry_at_ms = deadline, "reconnect scheduled");
                }
            }
            ObcEvent::Tick => self.on_tick(now_ms, &mut actions),
            ObcEvent::HeartbeatTick => {
                if self.reconnect.is_connected() {
                    let message =
                        self.telemetry
                            .heartbeat(&self.machine, self.reconnect.state(), now_ms);
                    self.push_publish(message, &mut actions);
                }
            }
            ObcEvent::ReconnectDue => {
                if self.reconnect.begin_attempt(now_ms) {
                    actions.push(Action::Connect);
                }
            }
            ObcEvent::ShutdownRequested => {
                info!("local shutdown requested");
                let change = self
                    .machine
                    .apply(Event::Command(StateCommand::Shutdown), now_ms);
                if change.is_some() || self.machine.state() == OperatingState::Shutdown {
                    self.shutdown_sequence(now_ms, &mut actions);
                }
            }
        }
        actions
    }

    fn on_inbound(&mut self, message: InboundMessage, now_ms: u64, actions: &mut Vec<Action>) {
        match message.topic.as_str() {
            EPS_STATUS_TOPIC => self.on_eps_status(&message.payload, now_ms, actions),
            COMMAND_TOPIC => self.on_command(&message.payload, now_ms, actions),
            other => {
                debug!(topic = other, "ignoring message on unexpected topic");
                self.stats.unknown_topics = self.stats.unknown_topics.saturating_add(1);
            }
        }
    }

    fn on_eps_status(&mut self, payload: &str, now_ms: u64, actions: &mut Vec<Action>) {
        let reading = match self.parse_power(payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "dropping malformed EPS status");
                self.stats.eps_readings_rejected = self.stats.eps_readings_rejected.saturating_add(1);
                return;
            }
        };

        match self.power.update(reading.clone(), now_ms) {
            CacheUpdate::Accepted { usable: true } => {
                let change = self.machine.apply(Event::PowerUpdate(reading), now_ms);
                self.publish_transition(change, now_ms, actions);
            }
            CacheUpdate::Accepted { usable: false } => {
                debug!(
                    eps_ok = reading.eps_ok,
                    age_ms = reading.age_ms(now_ms),
                    "EPS reading cached but not usable"
                );
            }
            CacheUpdate::OutOfOrder => {}
        }
    }

    fn parse_power(&self, payload: &str) -> Result<PowerStatus, ProtocolError> {
        let message = self.protocol.parse_eps_status(payload)?;
        PowerStatus::from_message(&message)
    }

    fn on_command(&mut self, payload: &str, now_ms: u64, actions: &mut Vec<Action>) {
        let result = self.dispatcher.submit(payload, &mut self.machine, now_ms);

        match &result {
            DispatchResult::Dropped { .. } => return,
            DispatchResult::Forwarded { message, .. } => {
                self.push_publish(Ok(message.clone()), actions);
            }
            _ => {}
        }

        if let Some(ack) = result.ack() {
            let message = self.telemetry.ack(ack);
            self.push_publish(message, actions);
        }

        let change = result.state_change().copied();
        if change.is_some_and(|c| c.to == OperatingState::Shutdown) {
            self.shutdown_sequence(now_ms, actions);
        } else {
            self.publish_transition(change, now_ms, actions);
        }
    }

    fn on_connected(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        let outcome = self.reconnect.on_connected();
        self.machine
            .apply(Event::Connectivity(ConnectivityEvent::Connected), now_ms);

        actions.push(Action::Subscribe {
            topic: EPS_STATUS_TOPIC,
            qos: QoS::AtLeastOnce,
        });
        actions.push(Action::Subscribe {
            topic: COMMAND_TOPIC,
            qos: QoS::AtLeastOnce,
        });

        let message = self.telemetry.resync(
            &self.machine,
            self.reconnect.state(),
            self.power.latest(),
            outcome.outage_retries,
            now_ms,
        );
        self.push_publish(message, actions);
    }

    fn on_tick(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        let power_stale = self.power.is_stale(now_ms);
        let change = self.machine.apply(Event::Tick { power_stale }, now_ms);
        self.publish_transition(change, now_ms, actions);
        self.dispatcher.purge_expired(now_ms);
    }

    fn publish_transition(
        &mut self,
        change: Option<StateChange>,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        if change.is_none() {
            return;
        }
        let message = self
            .telemetry
            .transition(&self.machine, self.reconnect.state(), now_ms);
        self.push_publish(message, actions);
    }

    fn shutdown_sequence(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        if !self.reconnect.is_connected() {
            if self.final_status_grace_ms == 0 {
                warn!("shutdown with link down, stopping without final status");
                self.stats.final_status_abandoned = true;
                self.finish(actions);
                return;
            }
            let deadline = now_ms.saturating_add(self.final_status_grace_ms);
            warn!(
                grace_ms = self.final_status_grace_ms,
                "shutdown with link down, holding final status until reconnect"
            );
            self.final_status_deadline_ms = Some(deadline);
            return;
        }
        self.publish_final_status(now_ms, actions);
    }

    fn publish_final_status(&mut self, now_ms: u64, actions: &mut Vec<Action>) {
        info!("entering shutdown, publishing final status");
        let message = self
            .telemetry
            .final_status(&self.machine, self.reconnect.state(), now_ms);
        self.push_publish(message, actions);
        self.finish(actions);
    }

    fn finish(&mut self, actions: &mut Vec<Action>) {
        actions.push(Action::Disconnect);
        actions.push(Action::Stop);
        self.final_status_deadline_ms = None;
        self.stopped = true;
    }

    // SHUTDOWN reached without a link: keep reconnecting until the final
    // status is out or the grace period ends. Everything else is ignored.
    fn handle_while_closing(
        &mut self,
        event: &ObcEvent,
        deadline_ms: u64,
        now_ms: u64,
        actions: &mut Vec<Action>,
    ) {
        match event {
            ObcEvent::Connectivity(ConnectivityEvent::Connected) => {
                self.reconnect.on_connected();
                self.publish_final_status(now_ms, actions);
                return;
            }
            ObcEvent::Connectivity(ConnectivityEvent::Disconnected) => {
                self.reconnect.on_disconnected(now_ms);
            }
            ObcEvent::ReconnectDue => {
                if self.reconnect.begin_attempt(now_ms) {
                    actions.push(Action::Connect);
                }
            }
            ObcEvent::ShutdownRequested => {
                warn!("second shutdown request, stopping without final status");
                self.stats.final_status_abandoned = true;
                self.finish(actions);
                return;
            }
            _ => {}
        }

        if now_ms >= deadline_ms {
            error!("link not restored in time, stopping without final status");
            actions.clear();
            self.stats.final_status_abandoned = true;
            self.finish(actions);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.final_status_deadline_ms.is_some()
    }

    fn push_publish(
        &mut self,
        message: Result<OutboundMessage, ProtocolError>,
        actions: &mut Vec<Action>,
    ) {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to encode outbound message");
                self.stats.encode_failures = self.stats.encode_failures.saturating_add(1);
                return;
            }
        };

        // The resync on the next Connected carries whatever is skipped here.
        if !self.reconnect.is_connected() {
            debug!(topic = %message.topic, "link down, skipping publish");
            self.stats.publishes_skipped = self.stats.publishes_skipped.saturating_add(1);
            return;
        }
        actions.push(Action::Publish(message));
    }

    pub fn next_reconnect_at(&self) -> Option<u64> {
        self.reconnect.next_retry_at_ms()
    }

    pub fn state(&self) -> OperatingState {
        self.machine.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.reconnect.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn power_cache(&self) -> &PowerStatusCache {
        &self.power
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn telemetry(&self) -> &TelemetryPublisher {
        &self.telemetry
    }

    pub fn reconnect(&self) -> &ReconnectManager<R> {
        &self.reconnect
    }

    pub fn get_stats(&self) -> &AgentStats {
        &self.stats
    }
}
