//! Configuration loading traits and types.
//!
//! Two configuration documents feed the master:
//!
//! - the **device descriptor** (JSON, see [`crate::descriptor`]) describing
//!   devices, channels, mappings and objects;
//! - the **master settings** ([`MasterConfig`], TOML) describing timing,
//!   scheduling and where the descriptor lives.
//!
//! # TOML Example
//!
//! ```toml
//! [master]
//! index = 0
//! frequency_hz = 1000
//! health_check_interval_ms = 1000
//!
//! [devices]
//! path = "/etc/ecat/slaves.json"
//! sort = true
//!
//! [logging]
//! level = "debug"
//! ```

use crate::consts::{
    DEFAULT_DEVICES_PATH, DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_FREQUENCY_HZ,
    DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_MASTER_INDEX, DEFAULT_REQUEST_POLL_INTERVAL_US,
    NSEC_PER_SEC,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
///
/// Every variant aborts the load attempt; nothing is retained from a
/// configuration that fails to load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// TOML or JSON parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Channel direction is neither "input" nor "output".
    #[error("\"{0}\" is invalid value. 'direction' value must be \"input\" or \"output\"")]
    InvalidDirection(String),

    /// A required member is absent.
    #[error("{context}: missing required field '{field}'")]
    MissingField {
        /// Where the field was expected (e.g. "device 2 / sync 0").
        context: String,
        /// Field name.
        field: &'static str,
    },

    /// A numeric field is neither an integer nor a hex string, or overflows.
    #[error("{field}: invalid numeric value '{value}'")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
        /// Offending value as text.
        value: String,
    },

    /// Two data entries address the same object on the same device.
    #[error("duplicate object 0x{index:04x}:{subindex:02x} on device {position}")]
    DuplicateObject {
        /// Device position.
        position: u16,
        /// Object index.
        index: u16,
        /// Object sub-index.
        subindex: u8,
    },
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Exchange period, given either as a frequency or an explicit period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Cycles per second.
    Frequency(u32),
    /// Period in microseconds.
    Micros(u64),
}

impl Period {
    /// Period length in nanoseconds.
    ///
    /// # Errors
    /// `ValidationError` for a zero frequency or a zero period.
    pub fn as_nanos(&self) -> Result<u64, ConfigError> {
        match *self {
            Self::Frequency(0) => Err(ConfigError::ValidationError(
                "frequency must be greater than 0".to_string(),
            )),
            Self::Frequency(hz) => Ok(NSEC_PER_SEC / hz as u64),
            Self::Micros(0) => Err(ConfigError::ValidationError(
                "period must be greater than 0".to_string(),
            )),
            Self::Micros(us) => us.checked_mul(1000).ok_or_else(|| {
                ConfigError::ValidationError(format!("period of {us}us overflows"))
            }),
        }
    }
}

impl Default for Period {
    fn default() -> Self {
        Self::Frequency(DEFAULT_FREQUENCY_HZ)
    }
}

fn default_master_index() -> u32 {
    DEFAULT_MASTER_INDEX
}

fn default_health_check_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

fn default_drain_timeout_ms() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_MS
}

fn default_request_poll_interval_us() -> u64 {
    DEFAULT_REQUEST_POLL_INTERVAL_US
}

fn default_devices_path() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICES_PATH)
}

/// `[master]` section: timing and scheduling of the cyclic session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterSection {
    /// Index of the master requested from the driver.
    #[serde(default = "default_master_index")]
    pub index: u32,

    /// Exchange frequency in Hz. Mutually exclusive with `period_us`.
    #[serde(default)]
    pub frequency_hz: Option<u32>,

    /// Exchange period in microseconds. Mutually exclusive with `frequency_hz`.
    #[serde(default)]
    pub period_us: Option<u64>,

    /// Interval between slow-path master/device state refreshes.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Upper bound on waiting for the OP bit to clear after deactivation.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Sleep between two polls of an object request.
    #[serde(default = "default_request_poll_interval_us")]
    pub request_poll_interval_us: u64,

    /// Minimum interval between two operational cycle reports (0 = every cycle).
    #[serde(default)]
    pub data_interval_ms: u64,

    /// SCHED_FIFO priority of the cyclic thread (`rt` feature). Defaults to max.
    #[serde(default)]
    pub rt_priority: Option<i32>,

    /// CPU core the cyclic thread is pinned to (`rt` feature).
    #[serde(default)]
    pub cpu_core: Option<usize>,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            index: DEFAULT_MASTER_INDEX,
            frequency_hz: None,
            period_us: None,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            request_poll_interval_us: DEFAULT_REQUEST_POLL_INTERVAL_US,
            data_interval_ms: 0,
            rt_priority: None,
            cpu_core: None,
        }
    }
}

/// `[devices]` section: where the device descriptor lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevicesSection {
    /// Path to the JSON device descriptor.
    #[serde(default = "default_devices_path")]
    pub path: PathBuf,

    /// Sort the flattened entries after loading.
    #[serde(default)]
    pub sort: bool,
}

impl Default for DevicesSection {
    fn default() -> Self {
        Self {
            path: default_devices_path(),
            sort: false,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Logging verbosity level.
    #[serde(default)]
    pub level: LogLevel,
}

/// Master settings loaded from `master.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Timing and scheduling.
    #[serde(default)]
    pub master: MasterSection,
    /// Descriptor location.
    #[serde(default)]
    pub devices: DevicesSection,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingSection,
}

impl MasterConfig {
    /// Validate the configuration.
    ///
    /// # Validation Rules
    /// 1. At most one of `frequency_hz` / `period_us`
    /// 2. The resulting period is non-zero
    /// 3. `health_check_interval_ms` > 0
    /// 4. `request_poll_interval_us` > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.master.frequency_hz.is_some() && self.master.period_us.is_some() {
            return Err(ConfigError::ValidationError(
                "frequency_hz and period_us are mutually exclusive".to_string(),
            ));
        }

        self.period().as_nanos()?;

        if self.master.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.master.request_poll_interval_us == 0 {
            return Err(ConfigError::ValidationError(
                "request_poll_interval_us must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Configured exchange period.
    pub fn period(&self) -> Period {
        match (self.master.frequency_hz, self.master.period_us) {
            (_, Some(us)) => Period::Micros(us),
            (Some(hz), None) => Period::Frequency(hz),
            (None, None) => Period::default(),
        }
    }

    /// Slow-path refresh interval.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.master.health_check_interval_ms)
    }

    /// Drain phase bound.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.master.drain_timeout_ms)
    }

    /// Object request poll interval.
    pub fn request_poll_interval(&self) -> Duration {
        Duration::from_micros(self.master.request_poll_interval_us)
    }

    /// Minimum interval between operational cycle reports.
    pub fn data_interval(&self) -> Duration {
        Duration::from_millis(self.master.data_interval_ms)
    }

    /// Load and validate from a TOML file.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.to_path_buf())
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
