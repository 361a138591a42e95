//! Session state shared between the cyclic thread and caller threads.
//!
//! [`SessionContext`] is the loaded configuration (flattened tables), built
//! by `load_configuration` and reused by every session. [`SharedDomain`] is
//! created per session once bring-up succeeds and holds everything both
//! sides touch:
//!
//! | Field | Written by | Synchronization |
//! |-------|------------|-----------------|
//! | cyclic table values | cycle thread / callers | per-entry atomics |
//! | device states, master state, domain state | cycle thread (slow path) | `Mutex` snapshot |
//! | driver | cycle thread / request path | `Mutex`, held for one cycle or one poll |
//! | cycle state, stop flag, statistics | cycle thread / callers | atomics |

use crate::domain::{DomainTable, EntryError};
use crate::sequencer::{ConfiguredDevices, DeviceRecord};
use ecat_common::driver::MasterDriver;
use ecat_common::entry::{RuntimeEntry, StartupParameter};
use ecat_common::flatten::FlatConfig;
use ecat_common::state::{DeviceState, DomainState, MasterState};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Loaded configuration: flattened runtime entries and startup parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    flat: FlatConfig,
}

impl SessionContext {
    pub fn new(flat: FlatConfig) -> Self {
        Self { flat }
    }

    pub fn entries(&self) -> &[RuntimeEntry] {
        &self.flat.entries
    }

    pub fn parameters(&self) -> &[StartupParameter] {
        &self.flat.parameters
    }

    /// Distinct device positions, in first-seen order.
    pub fn positions(&self) -> Vec<u16> {
        self.flat.positions()
    }

    /// Number of entries that will be placed in the domain.
    pub fn cyclic_count(&self) -> usize {
        self.flat.cyclic_count()
    }
}

/// Lifecycle of the cyclic exchange engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum CycleState {
    /// Bring-up done, thread not yet looping.
    NotReady = 0,
    /// Exchanging every period.
    Running = 1,
    /// Stop observed; waiting for devices to leave OP.
    Draining = 2,
    /// Master released, tables torn down.
    Stopped = 3,
}

impl CycleState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::NotReady,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "not-ready"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One configured device with its last observed state.
#[derive(Debug)]
pub struct DeviceSlot {
    record: DeviceRecord,
    state: Mutex<DeviceState>,
}

impl DeviceSlot {
    pub fn record(&self) -> &DeviceRecord {
        &self.record
    }

    /// Last state refreshed by the slow path.
    pub fn state(&self) -> DeviceState {
        *lock(&self.state)
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        *lock(&self.state) = state;
    }
}

/// Snapshot of one device for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub position: u16,
    pub alias: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub state: DeviceState,
}

/// Per-session state shared by the cyclic thread and caller threads.
pub struct SharedDomain {
    table: DomainTable,
    devices: Vec<DeviceSlot>,
    driver: Mutex<Box<dyn MasterDriver>>,
    master: Mutex<MasterState>,
    domain: Mutex<DomainState>,
    state: AtomicU8,
    stop: AtomicBool,
    cycles: AtomicU64,
    latency_ns: AtomicU64,
    jitter_ns: AtomicU64,
}

impl SharedDomain {
    pub fn new(table: DomainTable, devices: ConfiguredDevices, driver: Box<dyn MasterDriver>) -> Self {
        Self {
            table,
            devices: devices
                .records
                .into_iter()
                .map(|record| DeviceSlot {
                    record,
                    state: Mutex::new(DeviceState::default()),
                })
                .collect(),
            driver: Mutex::new(driver),
            master: Mutex::new(MasterState::default()),
            domain: Mutex::new(DomainState::default()),
            state: AtomicU8::new(CycleState::NotReady as u8),
            stop: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            latency_ns: AtomicU64::new(0),
            jitter_ns: AtomicU64::new(0),
        }
    }

    /// Cyclic table, or `NoDomain` once the session has stopped.
    pub fn table(&self) -> Result<&DomainTable, EntryError> {
        if self.cycle_state() == CycleState::Stopped {
            return Err(EntryError::NoDomain);
        }
        Ok(&self.table)
    }

    pub(crate) fn raw_table(&self) -> &DomainTable {
        &self.table
    }

    pub fn devices(&self) -> &[DeviceSlot] {
        &self.devices
    }

    /// Device configured at `position`.
    pub fn device(&self, position: u16) -> Option<&DeviceSlot> {
        self.devices.iter().find(|d| d.record.position == position)
    }

    pub fn device_statuses(&self) -> Vec<DeviceStatus> {
        self.devices
            .iter()
            .map(|d| DeviceStatus {
                position: d.record.position,
                alias: d.record.alias,
                vendor_id: d.record.vendor_id,
                product_code: d.record.product_code,
                state: d.state(),
            })
            .collect()
    }

    /// Exclusive access to the driver. Hold it for one cycle or one poll.
    pub(crate) fn driver(&self) -> MutexGuard<'_, Box<dyn MasterDriver>> {
        lock(&self.driver)
    }

    pub fn master_state(&self) -> MasterState {
        *lock(&self.master)
    }

    pub(crate) fn set_master_state(&self, state: MasterState) {
        *lock(&self.master) = state;
    }

    pub fn domain_state(&self) -> DomainState {
        *lock(&self.domain)
    }

    pub(crate) fn set_domain_state(&self, state: DomainState) {
        *lock(&self.domain) = state;
    }

    pub fn cycle_state(&self) -> CycleState {
        CycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_cycle_state(&self, state: CycleState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Ask the cyclic thread to drain. Observed at the next period boundary.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Cycles executed so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Moving averages of period latency and jitter, in nanoseconds.
    pub fn latency_and_jitter(&self) -> (u64, u64) {
        (
            self.latency_ns.load(Ordering::Relaxed),
            self.jitter_ns.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn publish_stats(&self, cycles: u64, latency_ns: u64, jitter_ns: u64) {
        self.cycles.store(cycles, Ordering::Relaxed);
        self.latency_ns.store(latency_ns, Ordering::Relaxed);
        self.jitter_ns.store(jitter_ns, Ordering::Relaxed);
    }
}

impl fmt::Debug for SharedDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDomain")
            .field("entries", &self.table.len())
            .field("devices", &self.devices.len())
            .field("state", &self.cycle_state())
            .finish()
    }
}

/// Lock, recovering the data of a poisoned mutex.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
