//! Connection tracking and bounded exponential backoff.
//!
//! Nothing here sleeps. The manager only computes deadlines; the event loop
//! owns the timer and reports back through [`ReconnectManager::begin_attempt`],
//! [`ReconnectManager::on_connected`] and [`ReconnectManager::on_disconnected`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
pub const DEFAULT_JITTER_FRACTION: f64 = 0.2;

// Consecutive failures after which retry logging escalates.
const WARN_AFTER_RETRIES: u32 = 3;
const ERROR_AFTER_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
        }
    }
}

impl BackoffPolicy {
    /// `min(base * multiplier^(failures - 1), max)` for `failures >= 1`.
    pub fn nominal_delay_ms(&self, failures: u32) -> u64 {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    pub fn jittered_delay_ms<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> u64 {
        let nominal = self.nominal_delay_ms(failures) as f64;
        let jitter = self.jitter_fraction.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal as u64;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        (nominal * factor).round() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySeverity {
    Routine,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    /// Failed attempts during the outage that just ended.
    pub outage_retries: u32,
    /// False for the very first connection of the process.
    pub reconnected: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReconnectStats {
    pub connections: u32,
    pub disconnections: u32,
    pub failed_attempts: u32,
}

#[derive(Debug)]
pub struct ReconnectManager<R = StdRng> {
    policy: BackoffPolicy,
    max_attempts: Option<u32>,
    state: ConnectionState,
    retry_count: u32,
    next_retry_at_ms: Option<u64>,
    attempt_in_flight: bool,
    ever_connected: bool,
    stats: ReconnectStats,
    rng: R,
}

impl ReconnectManager<StdRng> {
    pub fn new(policy: BackoffPolicy, max_attempts: Option<u32>) -> Self {
        Self::with_rng(policy, max_attempts, StdRng::from_entropy())
    }
}

impl<R: Rng> ReconnectManager<R> {
    pub fn with_rng(policy: BackoffPolicy, max_attempts: Option<u32>, rng: R) -> Self {
        Self {
            policy,
            max_attempts,
            state: ConnectionState::Disconnected,
            retry_count: 0,
            next_retry_at_ms: None,
            attempt_in_flight: false,
            ever_connected: false,
            stats: ReconnectStats::default(),
            rng,
        }
    }

    /// Marks the initial connection attempt issued at startup.
    pub fn begin_initial_attempt(&mut self) {
        self.attempt_in_flight = true;
        self.next_retry_at_ms = None;
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_retry_at_ms.is_some_and(|deadline| now_ms >= deadline)
    }

    /// Consumes the pending deadline if it has passed. Returns true when the
    /// caller should issue a connect.
    pub fn begin_attempt(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) || self.state == ConnectionState::Connected {
            return false;
        }
        self.next_retry_at_ms = None;
        self.attempt_in_flight = true;
        debug!(attempt = self.retry_count + 1, "attempting reconnect");
        true
    }

    pub fn on_connected(&mut self) -> ConnectOutcome {
        let outcome = ConnectOutcome {
            outage_retries: self.retry_count,
            reconnected: self.ever_connected,
        };

        if outcome.reconnected {
            info!(retries = self.retry_count, "transport reconnected");
        } else {
            info!("transport connected");
        }

        self.state = ConnectionState::Connected;
        self.retry_count = 0;
        self.next_retry_at_ms = None;
        self.attempt_in_flight = false;
        self.ever_connected = true;
        self.stats.connections = self.stats.connections.saturating_add(1);
        outcome
    }

    /// Handles a link drop or a failed connect. Returns the deadline of the
    /// next attempt, or `None` when one is already scheduled.
    pub fn on_disconnected(&mut self, now_ms: u64) -> Option<u64> {
        match self.state {
            ConnectionState::Connected => {
                warn!("transport disconnected, scheduling reconnect");
                self.stats.disconnections = self.stats.disconnections.saturating_add(1);
                self.state = ConnectionState::Reconnecting;
                self.attempt_in_flight = false;
                Some(self.schedule(now_ms))
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting
                if self.attempt_in_flight =>
            {
                self.attempt_in_flight = false;
                self.state = ConnectionState::Reconnecting;
                self.retry_count = self.retry_count.saturating_add(1);
                self.stats.failed_attempts = self.stats.failed_attempts.saturating_add(1);
                let deadline = self.schedule(now_ms);
                self.log_failure(deadline.saturating_sub(now_ms));
                Some(deadline)
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                if self.next_retry_at_ms.is_none() {
                    self.state = ConnectionState::Reconnecting;
                    return Some(self.schedule(now_ms));
                }
                None
            }
        }
    }

    fn schedule(&mut self, now_ms: u64) -> u64 {
        let delay = self
            .policy
            .jittered_delay_ms(self.retry_count.saturating_add(1), &mut self.rng);
        let deadline = now_ms.saturating_add(delay);
        self.next_retry_at_ms = Some(deadline);
        deadline
    }

    pub fn severity(&self) -> RetrySeverity {
        let exhausted = self
            .max_attempts
            .is_some_and(|max| self.retry_count >= max);
        if exhausted || self.retry_count > ERROR_AFTER_RETRIES {
            RetrySeverity::Critical
        } else if self.retry_count > WARN_AFTER_RETRIES {
            RetrySeverity::Degraded
        } else {
            RetrySeverity::Routine
        }
    }

    fn log_failure(&self, delay_ms: u64) {
        let retries = self.retry_count;
        match self.severity() {
            RetrySeverity::Routine => {
                info!(retries, delay_ms, "reconnect attempt failed, retrying");
            }
            RetrySeverity::Degraded => {
                warn!(retries, delay_ms, "reconnect attempts keep failing");
            }
            RetrySeverity::Critical => {
                error!(
                    retries,
                    delay_ms,
                    max_attempts = ?self.max_attempts,
                    "transport unreachable, continuing to retry"
                );
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn next_retry_at_ms(&self) -> Option<u64> {
        self.next_retry_at_ms
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn get_stats(&self) -> &ReconnectStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ReconnectManager<StdRng> {
        ReconnectManager::with_rng(BackoffPolicy::default(), None, StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_nominal_delay_sequence() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=8).map(|n| policy.nominal_delay_ms(n)).collect();
        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
        assert_eq!(policy.nominal_delay_ms(500), 60_000);
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter_fraction: 0.0,
            ..BackoffPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.jittered_delay_ms(3, &mut rng), 4_000);
    }

    #[test]
    fn test_disconnect_schedules_first_retry() {
        let mut mgr = manager();
        mgr.on_connected();

        let deadline = mgr.on_disconnected(10_000).unwrap();
        assert_eq!(mgr.state(), ConnectionState::Reconnecting);
        assert!((10_800..=11_200).contains(&deadline));
        assert!(!mgr.is_due(10_500));
        assert!(mgr.is_due(deadline));
    }

    #[test]
    fn test_retry_count_resets_only_on_connect() {
        let mut mgr = manager();
        mgr.on_connected();
        let mut now = 0;
        let mut deadline = mgr.on_disconnected(now).unwrap();
        for _ in 0..3 {
            now = deadline;
            assert!(mgr.begin_attempt(now));
            deadline = mgr.on_disconnected(now).unwrap();
        }
        assert_eq!(mgr.retry_count(), 3);

        now = deadline;
        assert!(mgr.begin_attempt(now));
        let outcome = mgr.on_connected();
        assert_eq!(outcome.outage_retries, 3);
        assert!(outcome.reconnected);
        assert_eq!(mgr.retry_count(), 0);
        assert!(mgr.next_retry_at_ms().is_none());
    }

    #[test]
    fn test_duplicate_disconnect_keeps_deadline() {
        let mut mgr = manager();
        mgr.on_connected();
        let deadline = mgr.on_disconnected(0).unwrap();
        assert!(mgr.on_disconnected(100).is_none());
        assert_eq!(mgr.next_retry_at_ms(), Some(deadline));
        assert_eq!(mgr.retry_count(), 0);
    }

    #[test]
    fn test_connect_cancels_pending_retry() {
        let mut mgr = manager();
        mgr.on_connected();
        mgr.on_disconnected(0);
        mgr.on_connected();
        assert!(!mgr.is_due(u64::MAX));
        assert!(!mgr.begin_attempt(u64::MAX));
    }

    #[test]
    fn test_severity_escalates() {
        let mut mgr = ReconnectManager::with_rng(
            BackoffPolicy::default(),
            Some(5),
            StdRng::seed_from_u64(3),
        );
        mgr.begin_initial_attempt();
        let mut now = 0;
        assert_eq!(mgr.severity(), RetrySeverity::Routine);
        for _ in 0..4 {
            now = mgr.on_disconnected(now).unwrap();
            mgr.begin_attempt(now);
        }
        assert_eq!(mgr.severity(), RetrySeverity::Degraded);
        mgr.on_disconnected(now);
        assert_eq!(mgr.retry_count(), 5);
        assert_eq!(mgr.severity(), RetrySeverity::Critical);
    }
}
