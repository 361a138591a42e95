//! Fieldbus master driver trait and error types.
//!
//! This module defines:
//! - `MasterDriver` trait - Interface to the external fieldbus master
//! - `DriverError` enum - Errors reported by the driver
//! - Handle and value types exchanged across the trait
//!
//! The driver owns device addressing, frame transmission, the state
//! machines of master and devices, and the memory layout of the domain
//! buffer. Everything above it talks to the bus only through this trait.

use crate::codec::PdoEntryOffset;
use crate::entry::{Direction, WatchdogMode};
use crate::state::{DeviceState, DomainState, MasterState};
use thiserror::Error;

/// Errors reported by a master driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The master could not be acquired.
    #[error("Master {0} unavailable")]
    MasterUnavailable(u32),

    /// An operation was rejected by the driver.
    #[error("{operation} failed: {reason}")]
    Rejected {
        /// Driver operation name.
        operation: &'static str,
        /// Driver-provided reason.
        reason: String,
    },

    /// A handle does not refer to a live object.
    #[error("Invalid {kind} handle {id}")]
    InvalidHandle {
        /// Handle kind ("device", "request").
        kind: &'static str,
        /// Handle value.
        id: usize,
    },

    /// Operation requires an acquired master.
    #[error("Master not acquired")]
    NotAcquired,
}

/// Factory function type for creating driver instances.
pub type DriverFactory = fn() -> Box<dyn MasterDriver>;

/// Handle of a configured device, issued by [`MasterDriver::slave_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub usize);

/// Handle of an object request, issued by [`MasterDriver::create_sdo_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub usize);

/// Bus identity of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SlaveIdentity {
    pub alias: u16,
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
}

/// One object to place into the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoEntryRegistration {
    /// Owning device.
    pub slave: SlaveIdentity,
    /// Object index.
    pub index: u16,
    /// Object sub-index.
    pub subindex: u8,
}

/// Typed startup value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoValue {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl SdoValue {
    /// Select the typed variant from a size in bits: 8 and 16 map to their
    /// own width, every other size is sent as 32 bits.
    pub const fn from_sized(bit_len: u8, value: u32) -> Self {
        match bit_len {
            8 => Self::U8(value as u8),
            16 => Self::U16(value as u16),
            _ => Self::U32(value),
        }
    }
}

/// Lifecycle of an object request as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Not submitted (or reset by the driver).
    Unused,
    /// In flight.
    Busy,
    /// Completed; payload valid.
    Success,
    /// Completed with an error.
    Error,
}

/// Interface to the external fieldbus master.
///
/// # Lifecycle
///
/// 1. `request_master()` - acquire the master
/// 2. `slave_config()` / `config_*` / `pdo_*` - configure devices (pre-RT)
/// 3. `create_domain()` + `register_pdo_entries()` - lay out the domain
/// 4. `activate()` - hand the configuration to the bus
/// 5. `receive` → `domain_process` → `domain_queue` → `send` - every cycle
/// 6. `deactivate()` then `release()` - shutdown
///
/// # Timing Contracts
///
/// | Operation | RT Constraint |
/// |-----------|---------------|
/// | configuration, activation | None (pre-RT) |
/// | `receive` .. `send`, `domain_data` | **HARD**, no allocation |
/// | state queries | bounded, called on the throttled slow path |
/// | object requests | None (caller thread) |
pub trait MasterDriver: Send {
    /// Returns the driver's unique identifier (e.g., "simulation").
    fn name(&self) -> &'static str;

    /// Returns the driver's semantic version.
    fn version(&self) -> &'static str;

    /// Acquire master `index`.
    fn request_master(&mut self, index: u32) -> Result<(), DriverError>;

    /// Create the configuration handle of one device.
    fn slave_config(&mut self, slave: SlaveIdentity) -> Result<DeviceHandle, DriverError>;

    /// Set direction and watchdog mode of a sync channel.
    fn config_sync_manager(
        &mut self,
        device: DeviceHandle,
        sync_index: u8,
        direction: Direction,
        watchdog: WatchdogMode,
    ) -> Result<(), DriverError>;

    /// Clear the mapping assignment list of a sync channel.
    fn pdo_assign_clear(&mut self, device: DeviceHandle, sync_index: u8) -> Result<(), DriverError>;

    /// Append a mapping to a sync channel.
    fn pdo_assign_add(
        &mut self,
        device: DeviceHandle,
        sync_index: u8,
        pdo_index: u16,
    ) -> Result<(), DriverError>;

    /// Clear the object list of a mapping.
    fn pdo_mapping_clear(&mut self, device: DeviceHandle, pdo_index: u16) -> Result<(), DriverError>;

    /// Append an object to a mapping.
    fn pdo_mapping_add(
        &mut self,
        device: DeviceHandle,
        pdo_index: u16,
        index: u16,
        subindex: u8,
        bit_len: u8,
    ) -> Result<(), DriverError>;

    /// Queue a startup value, written when the device is brought up.
    fn config_sdo(
        &mut self,
        device: DeviceHandle,
        index: u16,
        subindex: u8,
        value: SdoValue,
    ) -> Result<(), DriverError>;

    /// Create the process-data domain.
    fn create_domain(&mut self) -> Result<(), DriverError>;

    /// Register objects in the domain; returns one offset per registration,
    /// in order.
    fn register_pdo_entries(
        &mut self,
        entries: &[PdoEntryRegistration],
    ) -> Result<Vec<PdoEntryOffset>, DriverError>;

    /// Size of the domain buffer in bytes. Valid after activation.
    fn domain_size(&self) -> usize;

    /// Activate the configuration.
    fn activate(&mut self) -> Result<(), DriverError>;

    /// Stop exchanging process data; devices fall back out of OP.
    fn deactivate(&mut self);

    /// Release the master and every handle issued by it.
    fn release(&mut self);

    // ─── Cyclic path ────────────────────────────────────────────────

    /// Fetch received frames.
    fn receive(&mut self);

    /// Evaluate the received domain data.
    fn domain_process(&mut self);

    /// Queue the domain for the next frame.
    fn domain_queue(&mut self);

    /// Transmit queued frames.
    fn send(&mut self);

    /// Raw domain buffer. Empty before activation.
    fn domain_data(&mut self) -> &mut [u8];

    // ─── State ──────────────────────────────────────────────────────

    /// Working-counter evaluation of the last exchange.
    fn domain_state(&self) -> DomainState;

    /// Aggregate master state.
    fn master_state(&self) -> MasterState;

    /// State of one configured device.
    fn slave_config_state(&self, device: DeviceHandle) -> Result<DeviceState, DriverError>;

    // ─── Object requests ────────────────────────────────────────────

    /// Create an object request with a payload buffer of `size` bytes.
    fn create_sdo_request(
        &mut self,
        device: DeviceHandle,
        index: u16,
        subindex: u8,
        size: usize,
    ) -> Result<RequestHandle, DriverError>;

    /// Submit a read.
    fn request_read(&mut self, request: RequestHandle) -> Result<(), DriverError>;

    /// Submit a write of the current payload.
    fn request_write(&mut self, request: RequestHandle) -> Result<(), DriverError>;

    /// Current state of a request.
    fn request_state(&mut self, request: RequestHandle) -> Result<RequestState, DriverError>;

    /// Request payload.
    fn request_data(&self, request: RequestHandle) -> Result<&[u8], DriverError>;

    /// Mutable request payload.
    fn request_data_mut(&mut self, request: RequestHandle) -> Result<&mut [u8], DriverError>;

    /// Drop a finished request.
    /// Default: no-op (requests are released with the master)
    fn release_request(&mut self, _request: RequestHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::Rejected {
            operation: "pdo_assign_add",
            reason: "channel busy".to_string(),
        };
        assert!(err.to_string().contains("pdo_assign_add"));
        assert!(err.to_string().contains("channel busy"));

        let err = DriverError::InvalidHandle { kind: "device", id: 7 };
        assert_eq!(err.to_string(), "Invalid device handle 7");
    }

    #[test]
    fn test_sdo_value_sizing() {
        assert_eq!(SdoValue::from_sized(8, 0x1FF), SdoValue::U8(0xFF));
        assert_eq!(SdoValue::from_sized(16, 0x1_0001), SdoValue::U16(1));
        assert_eq!(SdoValue::from_sized(32, 5), SdoValue::U32(5));
        assert_eq!(SdoValue::from_sized(24, 5), SdoValue::U32(5));
    }
}
