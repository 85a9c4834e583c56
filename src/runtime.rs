//! Async driver for [`ObcAgent`].
//!
//! One task owns the agent and the transport. Inbound traffic arrives on the
//! event queue, the loop's own timers produce heartbeat, staleness and
//! reconnect events, and the resulting actions run strictly in order.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::agent::{Action, ObcAgent, ObcEvent, DEFAULT_EPS_INTERVAL_MS};
use crate::state_machine::ConnectivityEvent;
use crate::telemetry::DEFAULT_HEARTBEAT_INTERVAL_MS;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub heartbeat_interval_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            tick_interval_ms: DEFAULT_EPS_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The agent reached SHUTDOWN and asked the loop to stop.
    Stopped,
    /// Every event sender was dropped.
    QueueClosed,
}

/// Wall-clock Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn run<T, R>(
    agent: &mut ObcAgent<R>,
    transport: &mut T,
    events: &mut UnboundedReceiver<ObcEvent>,
    config: RuntimeConfig,
) -> RunOutcome
where
    T: Transport,
    R: Rng,
{
    let heartbeat_period = Duration::from_millis(config.heartbeat_interval_ms.max(1));
    let tick_period = Duration::from_millis(config.tick_interval_ms.max(1));
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    let mut staleness = interval_at(Instant::now() + tick_period, tick_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    staleness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending: VecDeque<Action> = agent.start(now_ms()).into();

    loop {
        while let Some(action) = pending.pop_front() {
            if action == Action::Stop {
                info!("event loop stopping");
                return RunOutcome::Stopped;
            }
            if let Err(e) = execute(transport, &action) {
                warn!(error = %e, ?action, "transport action failed");
                if matches!(action, Action::Disconnect) {
                    continue;
                }
                let event = ObcEvent::Connectivity(ConnectivityEvent::Disconnected);
                pending.extend(agent.handle(event, now_ms()));
            }
        }

        let reconnect_at = agent.next_reconnect_at();
        let event = tokio::select! {
            received = events.recv() => match received {
                Some(event) => event,
                None => {
                    info!("event queue closed, event loop exiting");
                    return RunOutcome::QueueClosed;
                }
            },
            _ = heartbeat.tick() => ObcEvent::HeartbeatTick,
            _ = staleness.tick() => ObcEvent::Tick,
            _ = sleep_until_ms(reconnect_at) => ObcEvent::ReconnectDue,
        };

        debug!(?event, "handling event");
        pending.extend(agent.handle(event, now_ms()));
    }
}

fn execute<T: Transport>(transport: &mut T, action: &Action) -> Result<(), TransportError> {
    match action {
        Action::Connect => transport.connect(),
        Action::Subscribe { topic, qos } => transport.subscribe(topic, *qos),
        Action::Publish(message) => transport.publish(message),
        Action::Disconnect => transport.disconnect(),
        Action::Stop => Ok(()),
    }
}

async fn sleep_until_ms(deadline_ms: Option<u64>) {
    match deadline_ms {
        Some(deadline) => {
            let wait = deadline.saturating_sub(now_ms());
            sleep(Duration::from_millis(wait)).await;
        }
        None => std::future::pending::<()>().await,
    }
}
