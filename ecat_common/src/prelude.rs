//! Prelude module for common re-exports.
//!
//! ```rust
//! use ecat_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, MasterConfig, Period};
pub use crate::descriptor::{DeviceDescriptor, load_devices, parse_devices_json};
pub use crate::flatten::{FlatConfig, flatten, sort_entries};

// ─── Entries and values ─────────────────────────────────────────────
pub use crate::codec::{CodecError, PdoEntryOffset, ValueFormat};
pub use crate::entry::{Direction, RuntimeEntry, StartupParameter, WatchdogMode};

// ─── Bus state ──────────────────────────────────────────────────────
pub use crate::state::{AlState, DeviceState, DomainState, MasterState, WcState};

// ─── Driver ─────────────────────────────────────────────────────────
pub use crate::driver::{
    DeviceHandle, DriverError, DriverFactory, MasterDriver, PdoEntryRegistration, RequestHandle,
    RequestState, SdoValue, SlaveIdentity,
};
