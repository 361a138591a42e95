//! State shared between the simulation driver and its test probe.
//!
//! The driver itself lives behind the master's driver lock; the probe keeps
//! a second handle on this state so tests and demos can inspect the call
//! journal and steer device states while a session runs.

use super::config::{ObjectAddress, RequestBehaviour};
use ecat_common::driver::{DeviceHandle, RequestHandle, SdoValue, SlaveIdentity};
use ecat_common::entry::{Direction, WatchdogMode};
use ecat_common::state::AlState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One configuration or request call received by the driver.
///
/// Cyclic calls (receive, process, queue, send) are not journaled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    RequestMaster { index: u32 },
    SlaveConfig { slave: SlaveIdentity },
    SyncManager {
        device: DeviceHandle,
        sync_index: u8,
        direction: Direction,
        watchdog: WatchdogMode,
    },
    PdoAssignClear { device: DeviceHandle, sync_index: u8 },
    PdoAssignAdd { device: DeviceHandle, sync_index: u8, pdo_index: u16 },
    PdoMappingClear { device: DeviceHandle, pdo_index: u16 },
    PdoMappingAdd {
        device: DeviceHandle,
        pdo_index: u16,
        index: u16,
        subindex: u8,
        bit_len: u8,
    },
    ConfigSdo { device: DeviceHandle, index: u16, subindex: u8, value: SdoValue },
    CreateDomain,
    RegisterEntries { count: usize },
    Activate,
    Deactivate,
    Release,
    CreateRequest { device: DeviceHandle, index: u16, subindex: u8, size: usize },
    RequestRead { request: RequestHandle },
    RequestWrite { request: RequestHandle },
}

#[derive(Debug, Default)]
pub(super) struct BusState {
    pub(super) journal: Vec<DriverCall>,
    pub(super) overrides: HashMap<u16, AlState>,
    pub(super) objects: HashMap<ObjectAddress, Vec<u8>>,
    pub(super) requests: RequestBehaviour,
}

/// Shared handle on the simulated bus.
#[derive(Debug, Clone, Default)]
pub struct SimulationProbe {
    inner: Arc<Mutex<BusState>>,
}

impl SimulationProbe {
    pub(super) fn new(requests: RequestBehaviour) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusState {
                requests,
                ..BusState::default()
            })),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn record(&self, call: DriverCall) {
        self.lock().journal.push(call);
    }

    /// Copy of the call journal.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.lock().journal.clone()
    }

    /// Number of journaled calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.lock().journal.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().journal.clear();
    }

    /// Force the state reported for the device at `position`.
    pub fn set_device_state(&self, position: u16, state: AlState) {
        self.lock().overrides.insert(position, state);
    }

    /// Return the device at `position` to its simulated state.
    pub fn clear_device_state(&self, position: u16) {
        self.lock().overrides.remove(&position);
    }

    pub fn set_request_behaviour(&self, behaviour: RequestBehaviour) {
        self.lock().requests = behaviour;
    }

    /// Seed the object dictionary of a device.
    pub fn set_object(&self, position: u16, index: u16, subindex: u8, bytes: &[u8]) {
        self.lock().objects.insert((position, index, subindex), bytes.to_vec());
    }

    /// Current content of a device object.
    pub fn object(&self, position: u16, index: u16, subindex: u8) -> Option<Vec<u8>> {
        self.lock().objects.get(&(position, index, subindex)).cloned()
    }
}
