//! Authoritative operating mode of the spacecraft.
//!
//! The machine is a plain owned value: every change goes through
//! [`StateMachine::apply`], which evaluates one event against the transition
//! table and returns the resulting [`StateChange`], if any. Rules are checked
//! in a fixed order on every event: explicit commands first, then the
//! staleness fault, then battery thresholds.

use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use tracing::{info, warn};

use crate::power::PowerStatus;

pub const HISTORY_CAPACITY: usize = 32;
const_assert!(HISTORY_CAPACITY > 0);

pub const DEFAULT_LOW_POWER_PERCENT: f32 = 30.0;
pub const DEFAULT_SAFE_MODE_PERCENT: f32 = 15.0;
pub const DEFAULT_RECOVERY_PERCENT: f32 = 45.0;
pub const DEFAULT_STALE_TICK_LIMIT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingState {
    Boot,
    Nominal,
    LowPower,
    SafeMode,
    CriticalFault,
    Shutdown,
}

impl OperatingState {
    pub fn is_terminal(self) -> bool {
        self == OperatingState::Shutdown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingState::Boot => "BOOT",
            OperatingState::Nominal => "NOMINAL",
            OperatingState::LowPower => "LOW_POWER",
            OperatingState::SafeMode => "SAFE_MODE",
            OperatingState::CriticalFault => "CRITICAL_FAULT",
            OperatingState::Shutdown => "SHUTDOWN",
        }
    }
}

impl core::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    BootComplete,
    BatteryLow,
    BatteryCritical,
    PowerRestored,
    SafeModeCommand,
    ShutdownCommand,
    ResumeCommand,
    PowerDataStale,
    FaultRecovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateCommand {
    EnterSafeMode,
    Shutdown,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A valid reading that was fresh when it reached the cache.
    PowerUpdate(PowerStatus),
    Command(StateCommand),
    Connectivity(ConnectivityEvent),
    /// Periodic staleness check. `power_stale` is the cache's verdict at tick time.
    Tick { power_stale: bool },
}

/// One entry of the transition history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: OperatingState,
    pub to: OperatingState,
    pub cause: TransitionCause,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRejection {
    TerminalState,
    ResumeRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerThresholds {
    /// Enter LOW_POWER below this level when running on battery.
    pub low_power_percent: f32,
    /// Enter SAFE_MODE from LOW_POWER below this level.
    pub safe_mode_percent: f32,
    /// Return to NOMINAL above this level with external power present.
    pub recovery_percent: f32,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            low_power_percent: DEFAULT_LOW_POWER_PERCENT,
            safe_mode_percent: DEFAULT_SAFE_MODE_PERCENT,
            recovery_percent: DEFAULT_RECOVERY_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateMachineConfig {
    pub thresholds: PowerThresholds,
    pub stale_tick_limit: u8,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            thresholds: PowerThresholds::default(),
            stale_tick_limit: DEFAULT_STALE_TICK_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct StateMachine {
    state: OperatingState,
    entered_at_ms: u64,
    last_cause: Option<TransitionCause>,
    history: Deque<StateChange, HISTORY_CAPACITY>,
    config: StateMachineConfig,

    link_established: bool,
    stale_ticks: u8,
    power_fresh: bool,
    last_power: Option<PowerStatus>,
}

impl StateMachine {
    pub fn new(config: StateMachineConfig, now_ms: u64) -> Self {
        Self {
            state: OperatingState::Boot,
            entered_at_ms: now_ms,
            last_cause: None,
            history: Deque::new(),
            config,
            link_established: false,
            stale_ticks: 0,
            power_fresh: false,
            last_power: None,
        }
    }

    pub fn apply(&mut self, event: Event, now_ms: u64) -> Option<StateChange> {
        if self.state.is_terminal() {
            return None;
        }

        match event {
            Event::Command(command) => self.apply_command(command, now_ms),
            Event::Tick { power_stale } => self.apply_tick(power_stale, now_ms),
            Event::Connectivity(ConnectivityEvent::Connected) => {
                self.link_established = true;
                None
            }
            Event::Connectivity(ConnectivityEvent::Disconnected) => None,
            Event::PowerUpdate(reading) => self.apply_power(reading, now_ms),
        }
    }

    /// Checks whether `command` would be accepted in the current state
    /// without applying it.
    pub fn validate_command(&self, command: StateCommand) -> Result<(), CommandRejection> {
        match (self.state, command) {
            (OperatingState::Shutdown, StateCommand::Shutdown) => Ok(()),
            (OperatingState::Shutdown, _) => Err(CommandRejection::TerminalState),
            (_, StateCommand::Resume) => self
                .resume_target()
                .map(|_| ())
                .ok_or(CommandRejection::ResumeRejected),
            _ => Ok(()),
        }
    }

    fn apply_command(&mut self, command: StateCommand, now_ms: u64) -> Option<StateChange> {
        match command {
            StateCommand::Shutdown => {
                Some(self.transition(OperatingState::Shutdown, TransitionCause::ShutdownCommand, now_ms))
            }
            StateCommand::EnterSafeMode => {
                if self.state == OperatingState::SafeMode {
                    return None;
                }
                Some(self.transition(OperatingState::SafeMode, TransitionCause::SafeModeCommand, now_ms))
            }
            StateCommand::Resume => {
                let target = self.resume_target()?;
                Some(self.transition(target, TransitionCause::ResumeCommand, now_ms))
            }
        }
    }

    fn apply_tick(&mut self, power_stale: bool, now_ms: u64) -> Option<StateChange> {
        if !power_stale {
            self.stale_ticks = 0;
            return None;
        }

        self.power_fresh = false;
        self.stale_ticks = self.stale_ticks.saturating_add(1);

        if self.stale_ticks >= self.config.stale_tick_limit
            && self.state != OperatingState::CriticalFault
        {
            warn!(
                stale_ticks = self.stale_ticks,
                state = %self.state,
                "power data stale, declaring critical fault"
            );
            return Some(self.transition(
                OperatingState::CriticalFault,
                TransitionCause::PowerDataStale,
                now_ms,
            ));
        }
        None
    }

    fn apply_power(&mut self, reading: PowerStatus, now_ms: u64) -> Option<StateChange> {
        let battery = reading.battery_percent?;
        let external = reading.external_power;

        self.stale_ticks = 0;
        self.power_fresh = true;
        self.last_power = Some(reading);

        let t = self.config.thresholds;
        let (target, cause) = match self.state {
            OperatingState::Boot if self.link_established => {
                (OperatingState::Nominal, TransitionCause::BootComplete)
            }
            OperatingState::Nominal if battery < t.low_power_percent && !external => {
                (OperatingState::LowPower, TransitionCause::BatteryLow)
            }
            OperatingState::LowPower if battery < t.safe_mode_percent => {
                (OperatingState::SafeMode, TransitionCause::BatteryCritical)
            }
            OperatingState::LowPower | OperatingState::SafeMode
                if battery > t.recovery_percent && external =>
            {
                (OperatingState::Nominal, TransitionCause::PowerRestored)
            }
            OperatingState::CriticalFault => {
                (self.threshold_target(battery, external), TransitionCause::FaultRecovered)
            }
            _ => return None,
        };

        Some(self.transition(target, cause, now_ms))
    }

    /// NOMINAL or LOW_POWER, whichever the thresholds select for this reading.
    fn threshold_target(&self, battery: f32, external: bool) -> OperatingState {
        if battery < self.config.thresholds.low_power_percent && !external {
            OperatingState::LowPower
        } else {
            OperatingState::Nominal
        }
    }

    fn resume_target(&self) -> Option<OperatingState> {
        if self.state != OperatingState::SafeMode || !self.power_fresh {
            return None;
        }
        let reading = self.last_power.as_ref()?;
        let battery = reading.battery_percent?;
        if battery < self.config.thresholds.safe_mode_percent {
            return None;
        }
        Some(self.threshold_target(battery, reading.external_power))
    }

    fn transition(&mut self, to: OperatingState, cause: TransitionCause, now_ms: u64) -> StateChange {
        let change = StateChange {
            from: self.state,
            to,
            cause,
            timestamp_ms: now_ms,
        };

        if self.history.is_full() {
            self.history.pop_front();
        }
        // Cannot fail: a slot was freed above.
        let _ = self.history.push_back(change);

        self.state = to;
        self.entered_at_ms = now_ms;
        self.last_cause = Some(cause);

        info!(from = %change.from, to = %change.to, ?cause, "operating state transition");
        change
    }

    pub fn state(&self) -> OperatingState {
        self.state
    }

    pub fn entered_at_ms(&self) -> u64 {
        self.entered_at_ms
    }

    pub fn last_cause(&self) -> Option<TransitionCause> {
        self.last_cause
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StateChange> + '_ {
        self.history.iter()
    }

    pub fn stale_ticks(&self) -> u8 {
        self.stale_ticks
    }

    pub fn last_power(&self) -> Option<&PowerStatus> {
        self.last_power.as_ref()
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }
}
