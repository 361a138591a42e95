//! Device descriptor schema.
//!
//! The descriptor is a JSON array of devices. Each device may declare sync
//! channels, each channel carries mapping objects (PDOs), each mapping lists
//! the objects it transports:
//!
//! ```json
//! [
//!   {
//!     "alias": 0, "position": 0, "vendor_id": "0x00000002", "product_code": "0x044c2c52",
//!     "syncs": [
//!       { "index": 2, "watchdog_enabled": true, "pdos": [
//!         { "index": "0x1600", "entries": [
//!           { "index": "0x7000", "subindex": 1, "size": 16, "add_to_domain": true }
//!         ] }
//!       ] }
//!     ],
//!     "parameters": [ { "index": "0x8000", "subindex": 6, "size": 8, "value": 1 } ]
//!   }
//! ]
//! ```
//!
//! Required members are modelled as `Option` so the flattener can report
//! exactly which one is missing and where.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Numeric member: either a native integer or a hexadecimal string.
///
/// Strings are stripped of every non-hex character before being parsed in
/// base 16, so `"0x1A00"`, `"1a00"` and `"#1A00"` all mean `0x1a00`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumericField {
    /// Plain JSON integer.
    Int(u64),
    /// Hex string.
    Hex(String),
}

impl NumericField {
    /// Normalized value.
    pub fn value(&self, field: &'static str) -> Result<u64, ConfigError> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Hex(text) => {
                let digits = normalize_hex(text);
                u64::from_str_radix(&digits, 16).map_err(|_| ConfigError::InvalidNumber {
                    field,
                    value: text.clone(),
                })
            }
        }
    }

    /// Normalized value narrowed to the target integer type.
    pub fn narrow<T: TryFrom<u64>>(&self, field: &'static str) -> Result<T, ConfigError> {
        let raw = self.value(field)?;
        T::try_from(raw).map_err(|_| ConfigError::InvalidNumber {
            field,
            value: raw.to_string(),
        })
    }
}

impl From<u64> for NumericField {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for NumericField {
    fn from(value: &str) -> Self {
        Self::Hex(value.to_string())
    }
}

/// Keep only hex digits.
pub fn normalize_hex(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_hexdigit()).collect()
}

/// One physical device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Alias address.
    pub alias: Option<NumericField>,
    /// Topological position on the bus.
    pub position: Option<NumericField>,
    /// Vendor identifier.
    pub vendor_id: Option<NumericField>,
    /// Product code.
    pub product_code: Option<NumericField>,
    /// Sync channels. Absent or empty: the device is only declared present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syncs: Option<Vec<SyncDescriptor>>,
    /// Startup parameters pushed once during bring-up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Vec<ParameterDescriptor>>,
}

/// One sync channel of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDescriptor {
    /// Channel index.
    pub index: Option<NumericField>,
    /// `"input"` or `"output"`; defaults from the channel index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Enable the channel watchdog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_enabled: Option<bool>,
    /// Mapping objects assigned to this channel.
    pub pdos: Option<Vec<PdoDescriptor>>,
}

/// One mapping object (PDO).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdoDescriptor {
    /// Mapping index (e.g. `0x1600`).
    pub index: Option<NumericField>,
    /// Mapped objects. Absent or empty: mapping kept with its default content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<EntryDescriptor>>,
}

/// One mapped object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDescriptor {
    /// Object index.
    pub index: Option<NumericField>,
    /// Object sub-index.
    pub subindex: Option<NumericField>,
    /// Size in bits.
    pub size: Option<NumericField>,
    /// Exchange this object cyclically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_to_domain: Option<bool>,
    /// Swap byte order of 16/32-bit values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_endian: Option<bool>,
    /// Interpret the value as two's complement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed: Option<bool>,
}

/// One startup parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    /// Object index.
    pub index: Option<NumericField>,
    /// Object sub-index.
    pub subindex: Option<NumericField>,
    /// Size in bits (8, 16, anything else is sent as 32).
    pub size: Option<NumericField>,
    /// Value to push.
    pub value: Option<NumericField>,
}

/// Parse a descriptor document.
///
/// # Errors
/// `ParseError` if the text is not a JSON array of device objects.
pub fn parse_devices_json(text: &str) -> Result<Vec<DeviceDescriptor>, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Read and parse a descriptor file.
pub fn load_devices(path: &Path) -> Result<Vec<DeviceDescriptor>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.to_path_buf())
        } else {
            ConfigError::ParseError(format!("{}: {e}", path.display()))
        }
    })?;
    parse_devices_json(&content)
}
