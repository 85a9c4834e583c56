use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{AgentConfig, DEFAULT_EPS_INTERVAL_MS, DEFAULT_FINAL_STATUS_GRACE_MS};
use crate::dedup::DEFAULT_DEDUP_EXPIRY_MS;
use crate::dispatcher::DispatcherConfig;
use crate::reconnect::{
    BackoffPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_FRACTION, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MULTIPLIER,
};
use crate::runtime::RuntimeConfig;
use crate::state_machine::{PowerThresholds, StateMachineConfig, DEFAULT_STALE_TICK_LIMIT};
use crate::telemetry::DEFAULT_HEARTBEAT_INTERVAL_MS;
use crate::transport::LineTransportConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObcConfig {
    pub broker: BrokerConfig,
    pub power: PowerConfig,
    pub telemetry: TelemetryConfig,
    pub reconnect: ReconnectConfig,
    pub commands: CommandsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_s: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1884,
            client_id: "cubesat-obc".to_string(),
            keepalive_s: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    pub low_power_percent: f32,
    pub safe_mode_percent: f32,
    pub recovery_percent: f32,
    /// How often the EPS publishes a reading.
    pub eps_interval_ms: u64,
    /// Defaults to twice `eps_interval_ms` when unset.
    pub staleness_window_ms: Option<u64>,
    pub stale_tick_limit: u8,
}

impl Default for PowerConfig {
    fn default() -> Self {
        let thresholds = PowerThresholds::default();
        Self {
            low_power_percent: thresholds.low_power_percent,
            safe_mode_percent: thresholds.safe_mode_percent,
            recovery_percent: thresholds.recovery_percent,
            eps_interval_ms: DEFAULT_EPS_INTERVAL_MS,
            staleness_window_ms: None,
            stale_tick_limit: DEFAULT_STALE_TICK_LIMIT,
        }
    }
}

impl PowerConfig {
    pub fn staleness_window_ms(&self) -> u64 {
        self.staleness_window_ms
            .unwrap_or_else(|| self.eps_interval_ms.saturating_mul(2))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub heartbeat_interval_ms: u64,
    /// Staleness check period. Defaults to the EPS reporting interval.
    pub tick_interval_ms: Option<u64>,
    /// Wait for a link to publish the final status when shutting down
    /// disconnected. Zero stops immediately.
    pub final_status_grace_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            tick_interval_ms: None,
            final_status_grace_ms: DEFAULT_FINAL_STATUS_GRACE_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
    /// Retries keep going past this; it only raises log severity.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub dedup_expiry_ms: u64,
    pub block_control_in_safe_mode: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            dedup_expiry_ms: DEFAULT_DEDUP_EXPIRY_MS,
            block_control_in_safe_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ObcConfig {
    /// Reads and validates a TOML file, or returns the defaults when no path
    /// is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.power;
        for (name, value) in [
            ("power.low_power_percent", p.low_power_percent),
            ("power.safe_mode_percent", p.safe_mode_percent),
            ("power.recovery_percent", p.recovery_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if p.safe_mode_percent >= p.low_power_percent {
            return Err(ConfigError::Invalid(
                "power.safe_mode_percent must be below power.low_power_percent".to_string(),
            ));
        }
        // Recovery above the low-power line gives the thresholds hysteresis.
        if p.recovery_percent <= p.low_power_percent {
            return Err(ConfigError::Invalid(
                "power.recovery_percent must be above power.low_power_percent".to_string(),
            ));
        }
        if p.eps_interval_ms == 0 || p.staleness_window_ms() == 0 {
            return Err(ConfigError::Invalid(
                "power intervals must be non-zero".to_string(),
            ));
        }
        if p.stale_tick_limit == 0 {
            return Err(ConfigError::Invalid(
                "power.stale_tick_limit must be at least 1".to_string(),
            ));
        }

        if self.telemetry.heartbeat_interval_ms == 0 || self.tick_interval_ms() == 0 {
            return Err(ConfigError::Invalid(
                "telemetry intervals must be non-zero".to_string(),
            ));
        }

        let r = &self.reconnect;
        if r.base_delay_ms == 0 || r.max_delay_ms < r.base_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms".to_string(),
            ));
        }
        if !r.multiplier.is_finite() || r.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&r.jitter_fraction) {
            return Err(ConfigError::Invalid(
                "reconnect.jitter_fraction must be within 0..1".to_string(),
            ));
        }

        if self.broker.host.is_empty() || self.broker.client_id.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.host and broker.client_id must be set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval_ms(&self) -> u64 {
        self.telemetry
            .tick_interval_ms
            .unwrap_or(self.power.eps_interval_ms)
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            machine: StateMachineConfig {
                thresholds: PowerThresholds {
                    low_power_percent: self.power.low_power_percent,
                    safe_mode_percent: self.power.safe_mode_percent,
                    recovery_percent: self.power.recovery_percent,
                },
                stale_tick_limit: self.power.stale_tick_limit,
            },
            dispatcher: DispatcherConfig {
                dedup_expiry_ms: self.commands.dedup_expiry_ms,
                block_control_in_safe_mode: self.commands.block_control_in_safe_mode,
            },
            backoff: BackoffPolicy {
                base_delay_ms: self.reconnect.base_delay_ms,
                multiplier: self.reconnect.multiplier,
                max_delay_ms: self.reconnect.max_delay_ms,
                jitter_fraction: self.reconnect.jitter_fraction,
            },
            max_attempts: self.reconnect.max_attempts,
            staleness_window_ms: self.power.staleness_window_ms(),
            final_status_grace_ms: self.telemetry.final_status_grace_ms,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            heartbeat_interval_ms: self.telemetry.heartbeat_interval_ms,
            tick_interval_ms: self.tick_interval_ms(),
        }
    }

    pub fn transport_config(&self) -> LineTransportConfig {
        LineTransportConfig {
            host: self.broker.host.clone(),
            port: self.broker.port,
            client_id: self.broker.client_id.clone(),
            keepalive_s: self.broker.keepalive_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ObcConfig::default();
        config.validate().unwrap();
        assert_eq!(config.power.staleness_window_ms(), 10_000);
        assert_eq!(config.tick_interval_ms(), 5_000);

        let agent = config.agent_config();
        assert_eq!(agent, AgentConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ObcConfig::from_toml(
            r#"
            [broker]
            host = "10.0.0.2"

            [power]
            eps_interval_ms = 2000

            [commands]
            block_control_in_safe_mode = true
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.broker.host, "10.0.0.2");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.power.staleness_window_ms(), 4_000);
        assert_eq!(config.power.low_power_percent, 30.0);
        assert!(config.agent_config().dispatcher.block_control_in_safe_mode);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = ObcConfig::default();
        config.power.safe_mode_percent = 40.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = ObcConfig::default();
        config.power.recovery_percent = 25.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_toml_reports_parse_error() {
        let err = ObcConfig::from_toml("[power\nlow = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = ObcConfig::load(Some(Path::new("/nonexistent/obc.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
