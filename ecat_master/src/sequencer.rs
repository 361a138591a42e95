//! Channel/mapping sequencer.
//!
//! Programs the devices from the flattened entries: one configuration
//! handle per device, then one pass that configures each sync channel,
//! rebuilds its mapping assignment and rebuilds each mapping's object list.
//!
//! The pass keeps four "last seen" sentinels (device, channel, mapping,
//! object) and only talks to the driver when one of them changes:
//!
//! ```text
//! new device   → reset channel, mapping, object
//! new channel  → config_sync_manager + pdo_assign_clear, reset mapping, object
//! new mapping  → pdo_assign_add + pdo_mapping_clear, reset object
//! new object   → pdo_mapping_add
//! ```
//!
//! Entries with mapping index 0 mark device presence only and issue nothing.
//! Every driver failure aborts bring-up with a [`BringUpError`].

use ecat_common::codec::PdoEntryOffset;
use ecat_common::driver::{DeviceHandle, DriverError, MasterDriver, SdoValue, SlaveIdentity};
use ecat_common::entry::{RuntimeEntry, StartupParameter, WatchdogMode};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

/// Bring-up step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    RequestMaster,
    SlaveConfig,
    SyncManager,
    PdoAssignClear,
    PdoAssignAdd,
    PdoMappingClear,
    PdoMappingAdd,
    StartupParameter,
    CreateDomain,
    RegisterEntries,
    Activate,
}

impl fmt::Display for BringUpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RequestMaster => "master request",
            Self::SlaveConfig => "device configuration",
            Self::SyncManager => "sync channel configuration",
            Self::PdoAssignClear => "mapping assignment clear",
            Self::PdoAssignAdd => "mapping assignment",
            Self::PdoMappingClear => "mapping clear",
            Self::PdoMappingAdd => "object mapping",
            Self::StartupParameter => "startup parameter",
            Self::CreateDomain => "domain creation",
            Self::RegisterEntries => "domain registration",
            Self::Activate => "activation",
        };
        f.write_str(name)
    }
}

/// Unrecoverable bring-up failure.
///
/// Running with a partially configured bus risks wrong physical outputs, so
/// none of these are retried; the embedding process is expected to log and
/// exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BringUpError {
    /// A master-wide step failed.
    #[error("{step} failed: {source}")]
    Master {
        step: BringUpStep,
        #[source]
        source: DriverError,
    },

    /// A per-device step failed.
    #[error("{step} failed for device {position}: {source}")]
    Device {
        step: BringUpStep,
        position: u16,
        #[source]
        source: DriverError,
    },

    /// Startup parameter addressed to a position without device entries.
    #[error("Startup parameter 0x{index:04x}:{subindex:02x} targets unknown device {position}")]
    UnknownDevice { position: u16, index: u16, subindex: u8 },

    /// The driver returned a different number of offsets than requested.
    #[error("Domain registration returned {actual} offsets for {expected} entries")]
    OffsetCount { expected: usize, actual: usize },

    /// A registered entry does not fit in the domain buffer.
    #[error(
        "Entry {position}:0x{index:04x}:{subindex:02x} at byte {} exceeds domain size {domain_size}",
        .offset.byte
    )]
    OffsetOutOfRange {
        position: u16,
        index: u16,
        subindex: u8,
        offset: PdoEntryOffset,
        domain_size: usize,
    },
}

impl BringUpError {
    pub(crate) fn master(step: BringUpStep) -> impl FnOnce(DriverError) -> Self {
        move |source| Self::Master { step, source }
    }

    fn device(step: BringUpStep, position: u16) -> impl FnOnce(DriverError) -> Self {
        move |source| Self::Device { step, position, source }
    }
}

/// One configured device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub alias: u16,
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    /// Driver handle.
    #[serde(skip)]
    pub handle: DeviceHandle,
}

impl DeviceRecord {
    pub const fn identity(&self) -> SlaveIdentity {
        SlaveIdentity {
            alias: self.alias,
            position: self.position,
            vendor_id: self.vendor_id,
            product_code: self.product_code,
        }
    }
}

/// Result of the configuration pass.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredDevices {
    /// One record per distinct position, in first-seen order.
    pub records: Vec<DeviceRecord>,
    by_position: HashMap<u16, usize>,
}

impl ConfiguredDevices {
    /// Record of the device at `position`.
    pub fn get(&self, position: u16) -> Option<&DeviceRecord> {
        self.by_position.get(&position).map(|&i| &self.records[i])
    }

    pub fn handle(&self, position: u16) -> Option<DeviceHandle> {
        self.get(position).map(|r| r.handle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Last-seen values of the configuration pass.
#[derive(Debug, Default)]
struct Sentinels {
    position: Option<u16>,
    channel: Option<u8>,
    mapping: Option<u16>,
    object: Option<u32>,
}

/// Create device handles and program channels and mappings.
///
/// # Errors
/// The first failing driver call, as [`BringUpError::Device`].
pub fn configure_devices(
    driver: &mut dyn MasterDriver,
    entries: &[RuntimeEntry],
) -> Result<ConfiguredDevices, BringUpError> {
    let mut devices = ConfiguredDevices::default();

    for entry in entries {
        if devices.by_position.contains_key(&entry.position) {
            continue;
        }
        let identity = SlaveIdentity {
            alias: entry.alias,
            position: entry.position,
            vendor_id: entry.vendor_id,
            product_code: entry.product_code,
        };
        let handle = driver
            .slave_config(identity)
            .map_err(BringUpError::device(BringUpStep::SlaveConfig, entry.position))?;
        debug!(
            "Device {}: vendor 0x{:08x} product 0x{:08x}",
            entry.position, entry.vendor_id, entry.product_code
        );
        devices.by_position.insert(entry.position, devices.records.len());
        devices.records.push(DeviceRecord {
            alias: entry.alias,
            position: entry.position,
            vendor_id: entry.vendor_id,
            product_code: entry.product_code,
            handle,
        });
    }

    // Channels of one device stay contiguous even if the caller interleaved
    // them; the sort is stable so mapping and object order is kept.
    let mut order: Vec<&RuntimeEntry> = entries.iter().filter(|e| !e.is_placeholder()).collect();
    order.sort_by_key(|e| (e.position, e.sync_index));

    let mut last = Sentinels::default();
    let mut channels = 0usize;

    for entry in order {
        let position = entry.position;
        let Some(device) = devices.handle(position) else {
            continue;
        };

        if last.position != Some(position) {
            last = Sentinels {
                position: Some(position),
                ..Sentinels::default()
            };
        }

        if last.channel != Some(entry.sync_index) {
            let watchdog = WatchdogMode::from(entry.watchdog_enabled);
            debug!(
                "Device {position} SM{}: {:?}, watchdog {:?}",
                entry.sync_index, entry.direction, watchdog
            );
            driver
                .config_sync_manager(device, entry.sync_index, entry.direction, watchdog)
                .map_err(BringUpError::device(BringUpStep::SyncManager, position))?;
            driver
                .pdo_assign_clear(device, entry.sync_index)
                .map_err(BringUpError::device(BringUpStep::PdoAssignClear, position))?;
            last.channel = Some(entry.sync_index);
            last.mapping = None;
            last.object = None;
            channels += 1;
        }

        if last.mapping != Some(entry.pdo_index) {
            debug!("Device {position} SM{}: assign 0x{:04x}", entry.sync_index, entry.pdo_index);
            driver
                .pdo_assign_add(device, entry.sync_index, entry.pdo_index)
                .map_err(BringUpError::device(BringUpStep::PdoAssignAdd, position))?;
            driver
                .pdo_mapping_clear(device, entry.pdo_index)
                .map_err(BringUpError::device(BringUpStep::PdoMappingClear, position))?;
            last.mapping = Some(entry.pdo_index);
            last.object = None;
        }

        let composite = entry.mapping_composite();
        if composite != 0 && last.object != Some(composite) {
            debug!(
                "Device {position} 0x{:04x}: map 0x{:04x}:{:02x} ({} bits)",
                entry.pdo_index, entry.index, entry.subindex, entry.bit_len
            );
            driver
                .pdo_mapping_add(device, entry.pdo_index, entry.index, entry.subindex, entry.bit_len)
                .map_err(BringUpError::device(BringUpStep::PdoMappingAdd, position))?;
            last.object = Some(composite);
        }
    }

    info!("Configured {} devices, {} sync channels", devices.len(), channels);
    Ok(devices)
}

/// Queue every startup parameter on its device: 8-bit and 16-bit sizes use
/// their own width, anything else is sent as 32 bits.
///
/// # Errors
/// [`BringUpError::UnknownDevice`] or the failing driver call.
pub fn apply_startup_parameters(
    driver: &mut dyn MasterDriver,
    devices: &ConfiguredDevices,
    parameters: &[StartupParameter],
) -> Result<(), BringUpError> {
    for param in parameters {
        let device = devices.handle(param.position).ok_or(BringUpError::UnknownDevice {
            position: param.position,
            index: param.index,
            subindex: param.subindex,
        })?;
        let value = SdoValue::from_sized(param.bit_len, param.value);
        debug!(
            "Device {} startup 0x{:04x}:{:02x} = {:?}",
            param.position, param.index, param.subindex, value
        );
        driver
            .config_sdo(device, param.index, param.subindex, value)
            .map_err(BringUpError::device(BringUpStep::StartupParameter, param.position))?;
    }
    if !parameters.is_empty() {
        info!("Queued {} startup parameters", parameters.len());
    }
    Ok(())
}
