//! Simulation driver implementation.
//!
//! The `SimulationDriver` implements the `MasterDriver` trait in process:
//! devices accept any configuration, reach OP a few receive cycles after
//! activation, and answer object requests from an in-memory dictionary.

use super::bus::{DriverCall, SimulationProbe};
use super::config::{FailPoint, ObjectAddress, RequestBehaviour, SimulationConfig};
use super::io::{EchoImage, pack};
use ecat_common::codec::PdoEntryOffset;
use ecat_common::driver::{
    DeviceHandle, DriverError, MasterDriver, PdoEntryRegistration, RequestHandle, RequestState,
    SdoValue, SlaveIdentity,
};
use ecat_common::entry::{Direction, WatchdogMode};
use ecat_common::state::{AlState, DeviceState, DomainState, MasterState, WcState};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// One configured device.
#[derive(Debug)]
struct SimDevice {
    identity: SlaveIdentity,
    /// Mapping index → `(index, subindex, bit_len)` objects.
    mappings: HashMap<u16, Vec<(u16, u8, u8)>>,
}

impl SimDevice {
    fn bit_len_of(&self, index: u16, subindex: u8) -> Option<u8> {
        self.mappings
            .values()
            .flatten()
            .find(|(i, s, _)| *i == index && *s == subindex)
            .map(|(_, _, bits)| *bits)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Read,
    Write,
}

#[derive(Debug)]
struct SimRequest {
    address: ObjectAddress,
    data: Vec<u8>,
    state: RequestState,
    kind: Option<RequestKind>,
    polls: u32,
    dropped: bool,
}

/// Process-data domain.
#[derive(Debug, Default)]
struct SimDomain {
    registered: Vec<(ObjectAddress, PdoEntryOffset, u8)>,
    size: usize,
    data: Vec<u8>,
    echo: EchoImage,
    devices_in_domain: u32,
}

/// Simulation driver implementing the MasterDriver trait.
pub struct SimulationDriver {
    /// Driver name
    name: &'static str,
    /// Driver version
    version: &'static str,
    config: SimulationConfig,
    probe: SimulationProbe,
    acquired: bool,
    devices: Vec<SimDevice>,
    domain: Option<SimDomain>,
    active: bool,
    /// Receive cycles since activation
    cycles_active: u32,
    requests: Vec<SimRequest>,
}

impl SimulationDriver {
    /// Create a new simulation driver instance.
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            name: "simulation",
            version: env!("CARGO_PKG_VERSION"),
            probe: SimulationProbe::new(config.requests),
            config,
            acquired: false,
            devices: Vec::new(),
            domain: None,
            active: false,
            cycles_active: 0,
            requests: Vec::new(),
        }
    }

    /// Handle on the shared bus state, valid for the driver's lifetime and
    /// beyond.
    pub fn probe(&self) -> SimulationProbe {
        self.probe.clone()
    }

    fn inject(&self, point: FailPoint, operation: &'static str) -> Result<(), DriverError> {
        if self.config.fail_at == Some(point) {
            warn!("Simulation: injected failure at {operation}");
            return Err(DriverError::Rejected {
                operation,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn acquired(&self) -> Result<(), DriverError> {
        if self.acquired { Ok(()) } else { Err(DriverError::NotAcquired) }
    }

    fn device(&mut self, handle: DeviceHandle) -> Result<&mut SimDevice, DriverError> {
        self.devices
            .get_mut(handle.0)
            .ok_or(DriverError::InvalidHandle { kind: "device", id: handle.0 })
    }

    fn request(&mut self, handle: RequestHandle) -> Result<&mut SimRequest, DriverError> {
        self.requests
            .get_mut(handle.0)
            .ok_or(DriverError::InvalidHandle { kind: "request", id: handle.0 })
    }

    /// Simulated state of one device, before overrides.
    fn natural_state(&self) -> AlState {
        if self.active && self.cycles_active >= self.config.activation_cycles {
            AlState::OP
        } else if self.active {
            AlState::SAFEOP
        } else {
            AlState::PREOP
        }
    }

    fn device_state(&self, position: u16) -> AlState {
        self.probe
            .lock()
            .overrides
            .get(&position)
            .copied()
            .unwrap_or_else(|| self.natural_state())
    }

    fn submit(&mut self, handle: RequestHandle, kind: RequestKind) -> Result<(), DriverError> {
        let request = self.request(handle)?;
        request.kind = Some(kind);
        request.state = RequestState::Busy;
        request.polls = 0;
        let call = match kind {
            RequestKind::Read => DriverCall::RequestRead { request: handle },
            RequestKind::Write => DriverCall::RequestWrite { request: handle },
        };
        self.probe.record(call);
        Ok(())
    }
}

impl Default for SimulationDriver {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl MasterDriver for SimulationDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn version(&self) -> &'static str {
        self.version
    }

    fn request_master(&mut self, index: u32) -> Result<(), DriverError> {
        self.probe.record(DriverCall::RequestMaster { index });
        if self.inject(FailPoint::RequestMaster, "request_master").is_err() {
            return Err(DriverError::MasterUnavailable(index));
        }
        self.acquired = true;
        info!("Simulation: master {index} acquired");
        Ok(())
    }

    fn slave_config(&mut self, slave: SlaveIdentity) -> Result<DeviceHandle, DriverError> {
        self.probe.record(DriverCall::SlaveConfig { slave });
        self.acquired()?;
        self.inject(FailPoint::SlaveConfig, "slave_config")?;
        self.devices.push(SimDevice {
            identity: slave,
            mappings: HashMap::new(),
        });
        Ok(DeviceHandle(self.devices.len() - 1))
    }

    fn config_sync_manager(
        &mut self,
        device: DeviceHandle,
        sync_index: u8,
        direction: Direction,
        watchdog: WatchdogMode,
    ) -> Result<(), DriverError> {
        self.probe.record(DriverCall::SyncManager { device, sync_index, direction, watchdog });
        self.inject(FailPoint::SyncManager, "config_sync_manager")?;
        self.device(device)?;
        Ok(())
    }

    fn pdo_assign_clear(&mut self, device: DeviceHandle, sync_index: u8) -> Result<(), DriverError> {
        self.probe.record(DriverCall::PdoAssignClear { device, sync_index });
        self.device(device)?;
        Ok(())
    }

    fn pdo_assign_add(
        &mut self,
        device: DeviceHandle,
        sync_index: u8,
        pdo_index: u16,
    ) -> Result<(), DriverError> {
        self.probe.record(DriverCall::PdoAssignAdd { device, sync_index, pdo_index });
        self.inject(FailPoint::PdoAssignAdd, "pdo_assign_add")?;
        self.device(device)?.mappings.entry(pdo_index).or_default();
        Ok(())
    }

    fn pdo_mapping_clear(&mut self, device: DeviceHandle, pdo_index: u16) -> Result<(), DriverError> {
        self.probe.record(DriverCall::PdoMappingClear { device, pdo_index });
        self.device(device)?.mappings.insert(pdo_index, Vec::new());
        Ok(())
    }

    fn pdo_mapping_add(
        &mut self,
        device: DeviceHandle,
        pdo_index: u16,
        index: u16,
        subindex: u8,
        bit_len: u8,
    ) -> Result<(), DriverError> {
        self.probe.record(DriverCall::PdoMappingAdd { device, pdo_index, index, subindex, bit_len });
        self.inject(FailPoint::PdoMappingAdd, "pdo_mapping_add")?;
        self.device(device)?
            .mappings
            .entry(pdo_index)
            .or_default()
            .push((index, subindex, bit_len));
        Ok(())
    }

    fn config_sdo(
        &mut self,
        device: DeviceHandle,
        index: u16,
        subindex: u8,
        value: SdoValue,
    ) -> Result<(), DriverError> {
        self.probe.record(DriverCall::ConfigSdo { device, index, subindex, value });
        self.inject(FailPoint::ConfigSdo, "config_sdo")?;
        let position = self.device(device)?.identity.position;
        let bytes = match value {
            SdoValue::U8(v) => v.to_le_bytes().to_vec(),
            SdoValue::U16(v) => v.to_le_bytes().to_vec(),
            SdoValue::U32(v) => v.to_le_bytes().to_vec(),
        };
        self.probe.lock().objects.insert((position, index, subindex), bytes);
        Ok(())
    }

    fn create_domain(&mut self) -> Result<(), DriverError> {
        self.probe.record(DriverCall::CreateDomain);
        self.acquired()?;
        self.inject(FailPoint::CreateDomain, "create_domain")?;
        self.domain = Some(SimDomain::default());
        Ok(())
    }

    fn register_pdo_entries(
        &mut self,
        entries: &[PdoEntryRegistration],
    ) -> Result<Vec<PdoEntryOffset>, DriverError> {
        self.probe.record(DriverCall::RegisterEntries { count: entries.len() });
        self.inject(FailPoint::RegisterEntries, "register_pdo_entries")?;

        let mut bit_lens = Vec::with_capacity(entries.len());
        for reg in entries {
            let bits = self
                .devices
                .iter()
                .find(|d| d.identity.position == reg.slave.position)
                .and_then(|d| d.bit_len_of(reg.index, reg.subindex))
                .ok_or_else(|| DriverError::Rejected {
                    operation: "register_pdo_entries",
                    reason: format!(
                        "object {}:0x{:04x}:{:02x} is not mapped",
                        reg.slave.position, reg.index, reg.subindex
                    ),
                })?;
            bit_lens.push(bits);
        }

        let (offsets, size) = pack(&bit_lens);
        let mut positions: Vec<u16> = entries.iter().map(|r| r.slave.position).collect();
        positions.sort_unstable();
        positions.dedup();

        let domain = self.domain.as_mut().ok_or(DriverError::Rejected {
            operation: "register_pdo_entries",
            reason: "no domain".to_string(),
        })?;
        domain.registered = entries
            .iter()
            .zip(offsets.iter().zip(&bit_lens))
            .map(|(r, (&o, &b))| ((r.slave.position, r.index, r.subindex), o, b))
            .collect();
        domain.size = size;
        domain.devices_in_domain = positions.len() as u32;
        debug!("Simulation: domain of {size} bytes for {} entries", entries.len());
        Ok(offsets)
    }

    fn domain_size(&self) -> usize {
        self.domain.as_ref().map_or(0, |d| d.size)
    }

    fn activate(&mut self) -> Result<(), DriverError> {
        self.probe.record(DriverCall::Activate);
        self.acquired()?;
        self.inject(FailPoint::Activate, "activate")?;
        if let Some(domain) = self.domain.as_mut() {
            domain.data = vec![0; domain.size];
            domain.echo = EchoImage::resolve(&self.config.echo, &domain.registered);
        }
        self.active = true;
        self.cycles_active = 0;
        info!("Simulation: activated with {} devices", self.devices.len());
        Ok(())
    }

    fn deactivate(&mut self) {
        self.probe.record(DriverCall::Deactivate);
        self.active = false;
        self.cycles_active = 0;
    }

    fn release(&mut self) {
        self.probe.record(DriverCall::Release);
        self.active = false;
        self.acquired = false;
        self.devices.clear();
        self.domain = None;
        self.requests.clear();
        info!("Simulation: master released");
    }

    fn receive(&mut self) {
        if !self.active {
            return;
        }
        self.cycles_active = self.cycles_active.saturating_add(1);
        if let Some(domain) = self.domain.as_mut() {
            domain.echo.apply(&mut domain.data);
        }
    }

    fn domain_process(&mut self) {}

    fn domain_queue(&mut self) {}

    fn send(&mut self) {}

    fn domain_data(&mut self) -> &mut [u8] {
        match self.domain.as_mut() {
            Some(domain) if self.active => domain.data.as_mut_slice(),
            _ => &mut [],
        }
    }

    fn domain_state(&self) -> DomainState {
        match &self.domain {
            Some(domain) if self.natural_state() == AlState::OP => DomainState {
                working_counter: domain.devices_in_domain,
                wc_state: WcState::Complete,
            },
            Some(domain) if self.active => DomainState {
                working_counter: domain.devices_in_domain / 2,
                wc_state: if domain.devices_in_domain > 1 {
                    WcState::Incomplete
                } else {
                    WcState::Zero
                },
            },
            _ => DomainState::default(),
        }
    }

    fn master_state(&self) -> MasterState {
        if !self.acquired {
            return MasterState::default();
        }
        let al_states = self
            .devices
            .iter()
            .fold(AlState::empty(), |acc, d| acc | self.device_state(d.identity.position));
        MasterState {
            slaves_responding: self.devices.len() as u32,
            al_states,
            link_up: true,
        }
    }

    fn slave_config_state(&self, device: DeviceHandle) -> Result<DeviceState, DriverError> {
        let dev = self
            .devices
            .get(device.0)
            .ok_or(DriverError::InvalidHandle { kind: "device", id: device.0 })?;
        let al_state = self.device_state(dev.identity.position);
        Ok(DeviceState {
            al_state,
            online: true,
            operational: al_state == AlState::OP,
        })
    }

    fn create_sdo_request(
        &mut self,
        device: DeviceHandle,
        index: u16,
        subindex: u8,
        size: usize,
    ) -> Result<RequestHandle, DriverError> {
        self.probe.record(DriverCall::CreateRequest { device, index, subindex, size });
        self.inject(FailPoint::CreateRequest, "create_sdo_request")?;
        let position = self.device(device)?.identity.position;
        self.requests.push(SimRequest {
            address: (position, index, subindex),
            data: vec![0; size],
            state: RequestState::Unused,
            kind: None,
            polls: 0,
            dropped: false,
        });
        Ok(RequestHandle(self.requests.len() - 1))
    }

    fn request_read(&mut self, request: RequestHandle) -> Result<(), DriverError> {
        self.submit(request, RequestKind::Read)
    }

    fn request_write(&mut self, request: RequestHandle) -> Result<(), DriverError> {
        self.submit(request, RequestKind::Write)
    }

    fn request_state(&mut self, handle: RequestHandle) -> Result<RequestState, DriverError> {
        let behaviour = self.probe.lock().requests;
        let probe = self.probe.clone();
        let request = self.request(handle)?;
        if request.state != RequestState::Busy {
            return Ok(request.state);
        }
        request.polls += 1;

        let after_polls = match behaviour {
            RequestBehaviour::Hang => return Ok(RequestState::Busy),
            RequestBehaviour::Fail => {
                request.state = RequestState::Error;
                return Ok(request.state);
            }
            RequestBehaviour::DropFirst { after_polls } => {
                if !request.dropped {
                    request.dropped = true;
                    request.state = RequestState::Unused;
                    return Ok(request.state);
                }
                after_polls
            }
            RequestBehaviour::Complete { after_polls } => after_polls,
        };
        if request.polls < after_polls {
            return Ok(RequestState::Busy);
        }

        let mut bus = probe.lock();
        request.state = match request.kind {
            Some(RequestKind::Write) => {
                bus.objects.insert(request.address, request.data.clone());
                RequestState::Success
            }
            Some(RequestKind::Read) => match bus.objects.get(&request.address) {
                Some(bytes) => {
                    let n = bytes.len().min(request.data.len());
                    request.data[..n].copy_from_slice(&bytes[..n]);
                    RequestState::Success
                }
                None => RequestState::Error,
            },
            None => RequestState::Unused,
        };
        Ok(request.state)
    }

    fn request_data(&self, request: RequestHandle) -> Result<&[u8], DriverError> {
        self.requests
            .get(request.0)
            .map(|r| r.data.as_slice())
            .ok_or(DriverError::InvalidHandle { kind: "request", id: request.0 })
    }

    fn request_data_mut(&mut self, request: RequestHandle) -> Result<&mut [u8], DriverError> {
        Ok(self.request(request)?.data.as_mut_slice())
    }
}
