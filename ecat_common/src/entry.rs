//! Flattened runtime entries and startup parameters.
//!
//! A [`RuntimeEntry`] is one object occurrence bound to one device, as
//! produced by the flattener. Entries carry only configuration; the
//! driver-assigned offsets and the exchanged values live in the cyclic
//! domain table built after registration.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Transfer direction of a sync channel, as seen from the master.
///
/// The discriminants follow the driver's numbering so that sorting by
/// direction places outputs before inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Direction {
    /// No channel (device presence placeholder).
    #[default]
    Unassigned = 0,
    /// Master writes, device reads.
    Output = 1,
    /// Device writes, master reads.
    Input = 2,
}

const_assert_eq!(core::mem::size_of::<Direction>(), 1);

impl Direction {
    /// Default direction of a sync channel: even channels are outputs,
    /// odd channels inputs (SM0 out, SM1 in, SM2 out, SM3 in).
    pub const fn default_for_channel(index: u8) -> Self {
        if index % 2 == 0 { Self::Output } else { Self::Input }
    }

    /// Parse an explicit `direction` member.
    ///
    /// # Errors
    /// `InvalidDirection` for anything other than `"input"` / `"output"`.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        match text {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            other => Err(ConfigError::InvalidDirection(other.to_string())),
        }
    }

    /// True for [`Direction::Output`].
    pub const fn is_output(&self) -> bool {
        matches!(self, Self::Output)
    }
}

/// Watchdog mode of a sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogMode {
    /// Watchdog active.
    Enable,
    /// Watchdog inactive.
    Disable,
}

impl From<bool> for WatchdogMode {
    fn from(enabled: bool) -> Self {
        if enabled { Self::Enable } else { Self::Disable }
    }
}

/// One object occurrence bound to one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEntry {
    /// Device alias.
    pub alias: u16,
    /// Device position.
    pub position: u16,
    /// Device vendor identifier.
    pub vendor_id: u32,
    /// Device product code.
    pub product_code: u32,
    /// Sync channel index.
    pub sync_index: u8,
    /// Mapping (PDO) index, 0 for device placeholders.
    pub pdo_index: u16,
    /// Object index, 0 for placeholders.
    pub index: u16,
    /// Object sub-index.
    pub subindex: u8,
    /// Width in bits.
    pub bit_len: u8,
    /// Exchanged cyclically.
    pub add_to_domain: bool,
    /// Transfer direction, fixed at creation.
    pub direction: Direction,
    /// Swap byte order of the decoded/encoded value.
    pub swap_endian: bool,
    /// Two's complement value.
    pub signed: bool,
    /// Channel watchdog enabled.
    pub watchdog_enabled: bool,
}

impl RuntimeEntry {
    /// Entry that only marks a device as present.
    pub fn device_placeholder(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_code,
            ..Self::default()
        }
    }

    /// Mapping index 0: no channel/mapping configuration is issued for it.
    pub const fn is_placeholder(&self) -> bool {
        self.pdo_index == 0
    }

    /// Carries exchangeable data (non-zero index and width).
    pub const fn carries_data(&self) -> bool {
        self.index != 0 && self.bit_len > 0
    }

    /// Selected for the cyclic domain. A zero object index marks padding and
    /// is excluded regardless of the flag.
    pub const fn is_cyclic(&self) -> bool {
        self.add_to_domain && self.index != 0
    }

    /// `index << 16 | subindex << 8 | bit_len`, used to detect consecutive
    /// duplicate mapping rows.
    pub const fn mapping_composite(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.subindex as u32) << 8) | self.bit_len as u32
    }
}

/// One object value pushed to a device once during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupParameter {
    /// Device position.
    pub position: u16,
    /// Object index.
    pub index: u16,
    /// Object sub-index.
    pub subindex: u8,
    /// Size in bits.
    pub bit_len: u8,
    /// Value.
    pub value: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_direction_table() {
        assert_eq!(Direction::default_for_channel(0), Direction::Output);
        assert_eq!(Direction::default_for_channel(1), Direction::Input);
        assert_eq!(Direction::default_for_channel(2), Direction::Output);
        assert_eq!(Direction::default_for_channel(3), Direction::Input);
        assert_eq!(Direction::default_for_channel(6), Direction::Output);
    }

    #[test]
    fn direction_parse() {
        assert_eq!(Direction::parse("input").unwrap(), Direction::Input);
        assert_eq!(Direction::parse("output").unwrap(), Direction::Output);
        assert_eq!(
            Direction::parse("Output"),
            Err(ConfigError::InvalidDirection("Output".to_string()))
        );
    }

    #[test]
    fn outputs_sort_before_inputs() {
        assert!(Direction::Output < Direction::Input);
        assert!(Direction::Unassigned < Direction::Output);
    }

    #[test]
    fn cyclic_requires_index() {
        let mut entry = RuntimeEntry {
            pdo_index: 0x1600,
            add_to_domain: true,
            ..RuntimeEntry::default()
        };
        assert!(!entry.is_cyclic());
        entry.index = 0x7000;
        assert!(entry.is_cyclic());
        assert!(!entry.is_placeholder());
    }

    #[test]
    fn mapping_composite_layout() {
        let entry = RuntimeEntry {
            index: 0x7000,
            subindex: 0x01,
            bit_len: 16,
            ..RuntimeEntry::default()
        };
        assert_eq!(entry.mapping_composite(), 0x7000_0110);
    }
}
