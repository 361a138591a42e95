//! EcatMaster: configuration, session lifecycle and the runtime surface.
//!
//! The `EcatMaster` struct is the main entry point. It owns the loaded
//! configuration and, while a session runs, the [`SharedDomain`] that the
//! cyclic thread exchanges through.
//!
//! # Lifecycle
//!
//! ```text
//! load_configuration ──► start ──► (cyclic thread) ──► stop ──► SessionHandle::wait
//!        ▲                  │                                          │
//!        └──────────────────┴────────── reload after stop ◄────────────┘
//! ```

use crate::cycle::{CycleCallback, CycleEngine, CycleReport, CycleSettings, CycleStats};
use crate::domain::{EntryError, EntrySnapshot, EntryValue, register_domain};
use crate::driver_registry::DriverRegistry;
use crate::request::{self, ObjectRequest, ObjectValue, RequestError};
use crate::sequencer::{BringUpError, BringUpStep, apply_startup_parameters, configure_devices};
use crate::session::{CycleState, DeviceStatus, SessionContext, SharedDomain};
use ecat_common::config::{ConfigError, MasterConfig, Period};
use ecat_common::descriptor::{load_devices, parse_devices_json};
use ecat_common::driver::MasterDriver;
use ecat_common::flatten::flatten;
use ecat_common::state::{AlStateDetails, DomainState, MasterState};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors surfaced by [`EcatMaster`].
#[derive(Debug, Error)]
pub enum MasterError {
    /// Configuration could not be loaded; the previous one is kept.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Session bring-up failed; the master has been released.
    #[error("Bring-up failed: {0}")]
    BringUp(#[from] BringUpError),

    /// Cyclic table access failed.
    #[error(transparent)]
    Entry(#[from] EntryError),

    /// Object request failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Operation not allowed while a session runs.
    #[error("A cyclic session is active")]
    SessionActive,

    /// No configuration loaded.
    #[error("No configuration loaded")]
    NotConfigured,

    /// Driver name not registered.
    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    /// The cyclic thread could not be spawned.
    #[error("Cannot spawn cyclic thread: {0}")]
    ThreadSpawn(String),

    /// The cyclic thread panicked.
    #[error("Cyclic thread panicked")]
    CycleThreadPanicked,
}

impl MasterError {
    /// Bring-up failures leave the bus in an unknown configuration; the
    /// process should log and exit.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BringUp(_))
    }
}

/// Where the device descriptor comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// JSON file on disk.
    Path(PathBuf),
    /// Inline JSON text.
    Text(String),
}

/// Completion signal of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    thread: JoinHandle<CycleStats>,
}

impl SessionHandle {
    /// Block until the session has drained and released the master.
    pub fn wait(self) -> Result<CycleStats, MasterError> {
        self.thread.join().map_err(|_| MasterError::CycleThreadPanicked)
    }

    /// The cyclic thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Fieldbus process-data master.
pub struct EcatMaster {
    /// Master settings
    config: MasterConfig,
    /// Available drivers
    registry: DriverRegistry,
    /// Driver used by the next session
    driver_name: String,
    /// Driver instance handed in by the embedder, used once
    injected: Option<Box<dyn MasterDriver>>,
    /// Loaded configuration
    context: Option<SessionContext>,
    /// Current or last session
    session: Option<Arc<SharedDomain>>,
    /// Exchange period, shared with the cyclic thread
    period_ns: Arc<AtomicU64>,
}

impl EcatMaster {
    /// Create a master with the given settings and driver registry.
    ///
    /// # Errors
    /// `MasterError::Config` if the settings do not validate.
    pub fn new(config: MasterConfig, registry: DriverRegistry, driver_name: &str) -> Result<Self, MasterError> {
        config.validate()?;
        let period_ns = config.period().as_nanos()?;
        info!(
            "EcatMaster created: driver={driver_name}, period={period_ns} ns, health check={:?}",
            config.health_check_interval()
        );
        Ok(Self {
            config,
            registry,
            driver_name: driver_name.to_string(),
            injected: None,
            context: None,
            session: None,
            period_ns: Arc::new(AtomicU64::new(period_ns)),
        })
    }

    /// Master with default settings and the built-in simulation driver.
    pub fn simulated() -> Self {
        let period_ns = MasterConfig::default().period().as_nanos().unwrap_or(1_000_000);
        Self {
            config: MasterConfig::default(),
            registry: DriverRegistry::with_builtin(),
            driver_name: "simulation".to_string(),
            injected: None,
            context: None,
            session: None,
            period_ns: Arc::new(AtomicU64::new(period_ns)),
        }
    }

    /// Use `driver` for the next session instead of creating one from the
    /// registry.
    pub fn inject_driver(&mut self, driver: Box<dyn MasterDriver>) {
        self.injected = Some(driver);
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Loaded configuration, if any.
    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    fn active_session(&self) -> Option<&Arc<SharedDomain>> {
        self.session
            .as_ref()
            .filter(|s| s.cycle_state() != CycleState::Stopped)
    }

    /// Parse, flatten and (optionally) sort a device descriptor. The new
    /// configuration replaces the old one only if every step succeeds.
    ///
    /// # Errors
    /// `SessionActive` while a session runs, `Config` on any load failure.
    pub fn load_configuration(&mut self, source: ConfigSource, sort: bool) -> Result<(), MasterError> {
        if self.active_session().is_some() {
            return Err(MasterError::SessionActive);
        }
        let devices = match &source {
            ConfigSource::Path(path) => load_devices(path)?,
            ConfigSource::Text(text) => parse_devices_json(text)?,
        };
        let flat = flatten(&devices, sort)?;
        info!(
            "Configuration loaded: {} devices, {} entries ({} cyclic), {} startup parameters",
            devices.len(),
            flat.entries.len(),
            flat.cyclic_count(),
            flat.parameters.len()
        );
        self.context = Some(SessionContext::new(flat));
        Ok(())
    }

    /// Bring the bus up and start the cyclic thread.
    ///
    /// Bring-up runs on the calling thread; once it succeeds the returned
    /// handle completes when the session has stopped and released the master.
    ///
    /// # Errors
    /// `BringUp` (fatal) if any configuration step fails.
    pub fn start<F>(&mut self, callback: F) -> Result<SessionHandle, MasterError>
    where
        F: FnMut(&CycleReport) + Send + 'static,
    {
        if self.active_session().is_some() {
            return Err(MasterError::SessionActive);
        }
        let context = self.context.as_ref().ok_or(MasterError::NotConfigured)?;
        let mut driver = match self.injected.take() {
            Some(driver) => driver,
            None => self
                .registry
                .create_driver(&self.driver_name)
                .map_err(|_| MasterError::DriverNotFound(self.driver_name.clone()))?,
        };
        info!("Starting session with driver {} v{}", driver.name(), driver.version());

        let shared = match bring_up(&mut *driver, &self.config, context) {
            Ok((table, devices)) => Arc::new(SharedDomain::new(table, devices, driver)),
            Err(e) => {
                error!("{e}");
                driver.release();
                return Err(MasterError::BringUp(e));
            }
        };

        let settings = CycleSettings {
            period_ns: Arc::clone(&self.period_ns),
            health_interval: self.config.health_check_interval(),
            drain_timeout: self.config.drain_timeout(),
            data_interval: self.config.data_interval(),
            rt_priority: self.config.master.rt_priority,
            cpu_core: self.config.master.cpu_core,
        };
        let callback: CycleCallback = Box::new(callback);
        let engine = CycleEngine::new(Arc::clone(&shared), settings, callback);
        let thread = std::thread::Builder::new()
            .name("ecat-cycle".to_string())
            .spawn(move || engine.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                shared.driver().release();
                shared.set_cycle_state(CycleState::Stopped);
                return Err(MasterError::ThreadSpawn(e.to_string()));
            }
        };

        self.session = Some(shared);
        Ok(SessionHandle { thread })
    }

    /// Request a cooperative stop; the session drains at the next period
    /// boundary. No-op without a session.
    pub fn stop(&self) {
        if let Some(session) = self.active_session() {
            info!("Stop requested");
            session.request_stop();
        }
    }

    /// Change the exchange period. Takes effect at the next wake-up.
    ///
    /// # Errors
    /// `Config` for a zero frequency or period.
    pub fn set_period(&self, period: Period) -> Result<(), MasterError> {
        let ns = period.as_nanos()?;
        self.period_ns.store(ns, Ordering::Relaxed);
        info!("Period set to {ns} ns");
        Ok(())
    }

    /// Current exchange period in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns.load(Ordering::Relaxed)
    }

    /// At least one device reported OP at the last refresh.
    pub fn is_operational(&self) -> bool {
        self.active_session()
            .is_some_and(|s| s.master_state().al_states.is_operational())
    }

    /// Lifecycle state of the current session.
    pub fn cycle_state(&self) -> Option<CycleState> {
        self.session.as_ref().map(|s| s.cycle_state())
    }

    fn shared(&self) -> Result<&SharedDomain, EntryError> {
        self.session.as_deref().ok_or(EntryError::NoDomain)
    }

    /// Full cyclic table.
    pub fn snapshot_domain(&self) -> Result<Vec<EntrySnapshot>, MasterError> {
        Ok(self.shared()?.table()?.snapshot())
    }

    /// `(position, index, subindex, value)` of every cyclic entry.
    pub fn snapshot_values(&self) -> Result<Vec<EntryValue>, MasterError> {
        Ok(self.shared()?.table()?.values())
    }

    /// Aggregate state from the last refresh; default without a session.
    pub fn master_state(&self) -> MasterState {
        self.active_session()
            .map(|s| s.master_state())
            .unwrap_or_default()
    }

    /// Per-bit view of [`Self::master_state`].
    pub fn master_state_details(&self) -> AlStateDetails {
        self.master_state().al_states.details()
    }

    /// Domain health after the last receive.
    pub fn domain_state(&self) -> DomainState {
        self.active_session()
            .map(|s| s.domain_state())
            .unwrap_or_default()
    }

    /// Configured devices with their last observed state.
    pub fn device_states(&self) -> Vec<DeviceStatus> {
        self.active_session()
            .map(|s| s.device_statuses())
            .unwrap_or_default()
    }

    /// Cycles executed by the current session.
    pub fn cycle_count(&self) -> u64 {
        self.active_session().map_or(0, |s| s.cycle_count())
    }

    /// Moving averages of period latency and jitter [ns].
    pub fn latency_and_jitter(&self) -> (u64, u64) {
        self.active_session()
            .map(|s| s.latency_and_jitter())
            .unwrap_or_default()
    }

    /// Set the pending write of output slot `slot`.
    pub fn write_by_slot(&self, slot: usize, value: i64) -> Result<(), MasterError> {
        Ok(self.shared()?.table()?.write_slot(slot, value)?)
    }

    /// Set the pending write of the output entry at the given address.
    pub fn write_by_key(&self, position: u16, index: u16, subindex: u8, value: i64) -> Result<(), MasterError> {
        self.shared()?
            .table()?
            .write_key(position, index, subindex, value)?;
        Ok(())
    }

    /// Last decoded value of the entry at the given address.
    pub fn read_by_key(&self, position: u16, index: u16, subindex: u8) -> Result<i64, MasterError> {
        Ok(self.shared()?.table()?.read_key(position, index, subindex)?)
    }

    /// Apply several slot writes; one result per write, in order.
    pub fn write_many(&self, writes: &[(usize, i64)]) -> Vec<Result<(), MasterError>> {
        writes
            .iter()
            .map(|&(slot, value)| self.write_by_slot(slot, value))
            .collect()
    }

    /// Run an object request on the caller thread.
    ///
    /// # Errors
    /// `Request(UnknownDevice)` without a running session.
    pub fn request_object(&self, request: &ObjectRequest) -> Result<ObjectValue, MasterError> {
        let shared = self.active_session().ok_or(RequestError::UnknownDevice {
            position: request.position,
        })?;
        let result = request::execute(shared, request, self.config.request_poll_interval());
        if let Err(e) = &result {
            if !e.is_retryable() {
                warn!("Object request aborted: {e}");
            }
        }
        Ok(result?)
    }
}

impl Drop for EcatMaster {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Master request, device sequencing, startup parameters, domain and
/// activation, in that order.
fn bring_up(
    driver: &mut dyn MasterDriver,
    config: &MasterConfig,
    context: &SessionContext,
) -> Result<(crate::domain::DomainTable, crate::sequencer::ConfiguredDevices), BringUpError> {
    driver
        .request_master(config.master.index)
        .map_err(BringUpError::master(BringUpStep::RequestMaster))?;
    let devices = configure_devices(driver, context.entries())?;
    apply_startup_parameters(driver, &devices, context.parameters())?;
    let table = register_domain(driver, &devices, context.entries())?;
    driver
        .activate()
        .map_err(BringUpError::master(BringUpStep::Activate))?;
    table.check_bounds(driver.domain_size())?;
    info!(
        "Bring-up complete: {} devices, {} cyclic entries, domain {} bytes",
        devices.len(),
        table.len(),
        driver.domain_size()
    );
    Ok((table, devices))
}
