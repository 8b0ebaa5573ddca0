//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`D2D_*`)
//!
//! Timing values are configuration, not protocol constants: the
//! defaults suit 802.15.4/BLE-class lossy links and are expected to
//! be tuned per transport.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{D2dError, Result};
use crate::icd::{IcdClass, IcdConfig};
use crate::mrp::MrpConfig;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reliable-message timing and attempt bounds
    #[serde(default)]
    pub mrp: MrpSettings,

    /// Duty-cycle intervals and class
    #[serde(default)]
    pub icd: IcdSettings,

    /// Table capacities
    #[serde(default)]
    pub tables: TableSettings,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| D2dError::Config(format!("Failed to read config file: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| D2dError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("D2D_MRP_MAX_ATTEMPTS") {
            if let Ok(val) = val.parse() {
                config.mrp.max_attempts = val;
            }
        }
        if let Ok(val) = std::env::var("D2D_MRP_RETRY_INTERVAL_MS") {
            if let Ok(val) = val.parse() {
                config.mrp.initial_retry_interval_ms = val;
            }
        }
        if let Ok(val) = std::env::var("D2D_ICD_CLASS") {
            match val.to_lowercase().as_str() {
                "sit" => config.icd.class = IcdClass::Sit,
                "lit" => config.icd.class = IcdClass::Lit,
                other => tracing::warn!("Unknown D2D_ICD_CLASS value: {other}"),
            }
        }
        if let Ok(val) = std::env::var("D2D_ICD_SLOW_POLL_MS") {
            if let Ok(val) = val.parse() {
                config.icd.slow_poll_interval_ms = val;
            }
        }

        config
    }
}

/// Reliable-message protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrpSettings {
    /// Delay before the first retransmission, in milliseconds
    pub initial_retry_interval_ms: u64,

    /// Multiplier applied to the retry interval after each attempt
    pub backoff_factor: f64,

    /// Retransmissions attempted beyond the original send
    pub max_attempts: u8,

    /// Standalone-ack delay window, in milliseconds
    pub ack_delay_ms: u64,

    /// Per-peer acknowledgment timeout, in milliseconds
    pub ack_timeout_ms: u64,
}

impl Default for MrpSettings {
    fn default() -> Self {
        let mrp = MrpConfig::default();
        Self {
            initial_retry_interval_ms: mrp.initial_retry_interval.as_millis() as u64,
            backoff_factor: mrp.backoff_factor,
            max_attempts: mrp.max_attempts,
            ack_delay_ms: mrp.ack_delay.as_millis() as u64,
            ack_timeout_ms: 300,
        }
    }
}

impl MrpSettings {
    /// Convert to the engine's runtime configuration
    pub fn to_mrp_config(&self) -> MrpConfig {
        MrpConfig {
            initial_retry_interval: Duration::from_millis(self.initial_retry_interval_ms),
            backoff_factor: self.backoff_factor,
            max_attempts: self.max_attempts,
            ack_delay: Duration::from_millis(self.ack_delay_ms),
        }
    }

    /// Default acknowledgment timeout for new unicast sessions
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Intermittently-connected-device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcdSettings {
    /// Liveness class (`sit` or `lit`)
    pub class: IcdClass,

    /// Poll interval while Idle, in milliseconds
    pub slow_poll_interval_ms: u64,

    /// Poll interval while Active, in milliseconds
    pub fast_poll_interval_ms: u64,

    /// Active-mode duration after the last activity, in milliseconds
    pub active_mode_duration_ms: u64,
}

impl Default for IcdSettings {
    fn default() -> Self {
        let icd = IcdConfig::default();
        Self {
            class: icd.class,
            slow_poll_interval_ms: icd.slow_poll_interval.as_millis() as u64,
            fast_poll_interval_ms: icd.fast_poll_interval.as_millis() as u64,
            active_mode_duration_ms: icd.active_mode_duration.as_millis() as u64,
        }
    }
}

impl IcdSettings {
    /// Convert to the manager's runtime configuration
    pub fn to_icd_config(&self) -> IcdConfig {
        IcdConfig {
            class: self.class,
            slow_poll_interval: Duration::from_millis(self.slow_poll_interval_ms),
            fast_poll_interval: Duration::from_millis(self.fast_poll_interval_ms),
            active_mode_duration: Duration::from_millis(self.active_mode_duration_ms),
        }
    }
}

/// Table capacity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSettings {
    /// Maximum live sessions
    pub max_sessions: usize,

    /// Maximum live exchanges
    pub max_exchanges: usize,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            max_exchanges: 16,
        }
    }
}
