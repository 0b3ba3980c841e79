use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::telemetry::{RetryPolicy, TelemetrySelection};

pub const DEFAULT_QUEUE_LEN: usize = 6;
pub const DEFAULT_SCHEDULE_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Timings of the mode supervisor, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub enabled: bool,
    pub detumble_delay_ms: u64,
    pub idle_poll_ms: u64,
    pub nominal_dwell_ms: u64,
    pub erp_dwell_ms: u64,
}

impl SupervisorConfig {
    pub fn detumble_delay(&self) -> Duration {
        Duration::from_millis(self.detumble_delay_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn nominal_dwell(&self) -> Duration {
        Duration::from_millis(self.nominal_dwell_ms)
    }

    pub fn erp_dwell(&self) -> Duration {
        Duration::from_millis(self.erp_dwell_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            detumble_delay_ms: 1000,
            idle_poll_ms: 1000,
            nominal_dwell_ms: 5000,
            erp_dwell_ms: 10_000,
        }
    }
}

/// Periodic environmental telemetry, disabled unless asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryStreamConfig {
    pub enabled: bool,
    pub period_ms: u64,
    pub selection: TelemetrySelection,
}

impl TelemetryStreamConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl Default for TelemetryStreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            period_ms: 3000,
            selection: TelemetrySelection::default(),
        }
    }
}

/// Startup configuration of the flight software.
///
/// A queue length of zero makes that module's initialisation fail; the rest of
/// the system starts degraded around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdhConfig {
    pub command_queue_len: usize,
    pub diary_queue_len: usize,
    pub data_queue_len: usize,
    pub schedule_capacity: usize,
    pub tick_period_ms: u64,
    pub supervisor: SupervisorConfig,
    pub telemetry_stream: TelemetryStreamConfig,
    /// COMM link poll period; polling is off when absent.
    pub link_poll_ms: Option<u64>,
    pub retry: RetryPolicy,
}

impl CdhConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be non-zero"));
        }
        if self.schedule_capacity == 0 {
            return Err(ConfigError::Invalid("schedule_capacity must be non-zero"));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be non-zero"));
        }
        if self.telemetry_stream.enabled && self.telemetry_stream.period_ms == 0 {
            return Err(ConfigError::Invalid("telemetry_stream.period_ms must be non-zero"));
        }
        if self.link_poll_ms == Some(0) {
            return Err(ConfigError::Invalid("link_poll_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn link_poll_period(&self) -> Option<Duration> {
        self.link_poll_ms.map(Duration::from_millis)
    }
}

impl Default for CdhConfig {
    fn default() -> Self {
        Self {
            command_queue_len: DEFAULT_QUEUE_LEN,
            diary_queue_len: DEFAULT_QUEUE_LEN,
            data_queue_len: DEFAULT_QUEUE_LEN,
            schedule_capacity: DEFAULT_SCHEDULE_CAPACITY,
            tick_period_ms: 1000,
            supervisor: SupervisorConfig::default(),
            telemetry_stream: TelemetryStreamConfig::default(),
            link_poll_ms: None,
            retry: RetryPolicy::default(),
        }
    }
}
