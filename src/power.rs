use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::{EpsStatusMessage, ProtocolError};

const EPS_STATUS_OK: &str = "ok";

/// One EPS reading. `external_power` is already resolved to "external supply
/// present" by the EPS reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub battery_percent: Option<f32>,
    pub voltage: Option<f32>,
    pub external_power: bool,
    pub timestamp_ms: u64,
    pub eps_ok: bool,
}

impl PowerStatus {
    pub fn new(battery_percent: Option<f32>, external_power: bool, timestamp_ms: u64) -> Self {
        Self {
            battery_percent: battery_percent.map(|p| p.clamp(0.0, 100.0)),
            voltage: None,
            external_power,
            timestamp_ms,
            eps_ok: true,
        }
    }

    pub fn with_voltage(mut self, voltage: f32) -> Self {
        self.voltage = Some(voltage);
        self
    }

    pub fn from_message(msg: &EpsStatusMessage) -> Result<Self, ProtocolError> {
        if !msg.timestamp.is_finite() || msg.timestamp < 0.0 {
            return Err(ProtocolError::MalformedPayload(format!(
                "invalid EPS timestamp {}",
                msg.timestamp
            )));
        }

        let battery_percent = msg
            .battery
            .filter(|b| b.is_finite())
            .map(|b| b.clamp(0.0, 100.0) as f32);
        let voltage = msg.voltage.filter(|v| v.is_finite()).map(|v| v as f32);

        Ok(Self {
            battery_percent,
            voltage,
            external_power: msg.external_power,
            timestamp_ms: (msg.timestamp * 1000.0).round() as u64,
            // Older EPS firmware omits the status field entirely.
            eps_ok: msg.status.as_deref().map_or(true, |s| s == EPS_STATUS_OK),
        })
    }

    /// A reading the state machine can act on: the EPS reported healthy and
    /// the battery level is known.
    pub fn is_valid(&self) -> bool {
        self.eps_ok && self.battery_percent.is_some()
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// Reading stored. `usable` is true when it is valid and not already stale.
    Accepted { usable: bool },
    /// Timestamp not newer than the latest cached reading.
    OutOfOrder,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PowerCacheStats {
    pub readings_accepted: u32,
    pub readings_invalid: u32,
    pub readings_out_of_order: u32,
}

#[derive(Debug)]
pub struct PowerStatusCache {
    latest: Option<PowerStatus>,
    last_valid: Option<PowerStatus>,
    staleness_window_ms: u64,
    stats: PowerCacheStats,
}

impl PowerStatusCache {
    pub fn new(staleness_window_ms: u64) -> Self {
        Self {
            latest: None,
            last_valid: None,
            staleness_window_ms,
            stats: PowerCacheStats::default(),
        }
    }

    pub fn update(&mut self, reading: PowerStatus, now_ms: u64) -> CacheUpdate {
        if let Some(latest) = &self.latest {
            if reading.timestamp_ms <= latest.timestamp_ms {
                debug!(
                    reading_ts = reading.timestamp_ms,
                    latest_ts = latest.timestamp_ms,
                    "discarding out-of-order EPS reading"
                );
                self.stats.readings_out_of_order = self.stats.readings_out_of_order.saturating_add(1);
                return CacheUpdate::OutOfOrder;
            }
        }

        let valid = reading.is_valid();
        let fresh = reading.age_ms(now_ms) <= self.staleness_window_ms;

        self.stats.readings_accepted = self.stats.readings_accepted.saturating_add(1);
        if valid {
            self.last_valid = Some(reading.clone());
        } else {
            self.stats.readings_invalid = self.stats.readings_invalid.saturating_add(1);
        }
        self.latest = Some(reading);

        CacheUpdate::Accepted {
            usable: valid && fresh,
        }
    }

    /// True when no valid reading exists or the newest valid one is older
    /// than the staleness window.
    pub fn is_stale(&self, now_ms: u64) -> bool {
        match &self.last_valid {
            Some(reading) => reading.age_ms(now_ms) > self.staleness_window_ms,
            None => true,
        }
    }

    pub fn latest(&self) -> Option<&PowerStatus> {
        self.latest.as_ref()
    }

    pub fn last_valid(&self) -> Option<&PowerStatus> {
        self.last_valid.as_ref()
    }

    pub fn staleness_window_ms(&self) -> u64 {
        self.staleness_window_ms
    }

    pub fn get_stats(&self) -> &PowerCacheStats {
        &self.stats
    }
}
