//! Bus, device and domain state snapshots.
//!
//! The application-layer state word is a bit set: the master reports the
//! union of the states of all responding devices, a single device reports
//! exactly one state.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use std::fmt;

bitflags! {
    /// Application-layer state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct AlState: u8 {
        /// Init.
        const INIT   = 0x01;
        /// Pre-operational: mailbox up, object requests allowed.
        const PREOP  = 0x02;
        /// Safe-operational: inputs exchanged, outputs held safe.
        const SAFEOP = 0x04;
        /// Operational: full process-data exchange.
        const OP     = 0x08;
    }
}

const_assert_eq!(core::mem::size_of::<AlState>(), 1);

impl AlState {
    /// Build from the raw state word. Unknown bits are dropped.
    pub const fn from_raw(raw: u8) -> Self {
        Self::from_bits_truncate(raw)
    }

    /// At least one device is operational. Tests bit 3 only.
    pub const fn is_operational(&self) -> bool {
        self.contains(Self::OP)
    }

    /// Mailbox communication is possible (PREOP, SAFEOP or OP).
    pub const fn accepts_requests(&self) -> bool {
        self.intersects(Self::PREOP.union(Self::SAFEOP).union(Self::OP))
    }

    /// Per-bit view for reporting.
    pub const fn details(&self) -> AlStateDetails {
        AlStateDetails {
            init: self.contains(Self::INIT),
            preop: self.contains(Self::PREOP),
            safeop: self.contains(Self::SAFEOP),
            op: self.contains(Self::OP),
        }
    }
}

impl fmt::Display for AlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "UNKNOWN");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{name}")?;
            first = false;
        }
        Ok(())
    }
}

/// Decomposed [`AlState`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlStateDetails {
    pub init: bool,
    pub preop: bool,
    pub safeop: bool,
    pub op: bool,
}

/// Master-wide state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterState {
    /// Number of devices answering on the bus.
    pub slaves_responding: u32,
    /// Union of the device states.
    pub al_states: AlState,
    /// Physical link up.
    pub link_up: bool,
}

/// State of one configured device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Current application-layer state.
    pub al_state: AlState,
    /// Device answers on the bus.
    pub online: bool,
    /// Device reached OP with the requested configuration.
    pub operational: bool,
}

/// Working-counter evaluation of the last exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcState {
    /// No device exchanged data.
    #[default]
    Zero,
    /// Some devices exchanged data.
    Incomplete,
    /// All registered devices exchanged data.
    Complete,
}

/// State of the process-data domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainState {
    pub working_counter: u32,
    pub wc_state: WcState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operational_tests_bit_three() {
        assert!(AlState::from_raw(0x08).is_operational());
        assert!(AlState::from_raw(0x0C).is_operational());
        assert!(!AlState::from_raw(0x04).is_operational());
        assert!(!AlState::from_raw(0x07).is_operational());
    }

    #[test]
    fn details_decompose_union() {
        let details = AlState::from_raw(0x0A).details();
        assert_eq!(
            details,
            AlStateDetails { init: false, preop: true, safeop: false, op: true }
        );
    }

    #[test]
    fn request_eligibility() {
        assert!(!AlState::INIT.accepts_requests());
        assert!(!AlState::empty().accepts_requests());
        assert!(AlState::PREOP.accepts_requests());
        assert!(AlState::SAFEOP.accepts_requests());
        assert!(AlState::OP.accepts_requests());
    }

    #[test]
    fn unknown_bits_dropped() {
        assert_eq!(AlState::from_raw(0x18), AlState::OP);
    }

    #[test]
    fn display_lists_set_bits() {
        assert_eq!(AlState::from_raw(0x06).to_string(), "PREOP+SAFEOP");
        assert_eq!(AlState::empty().to_string(), "UNKNOWN");
    }
}
