//! Ad-hoc object (mailbox) requests.
//!
//! A request runs on the caller thread and polls the driver until it
//! completes, fails or times out:
//!
//! | Driver state | Action |
//! |--------------|--------|
//! | `Unused` | resubmit |
//! | `Busy` | check timeout, sleep one poll interval |
//! | `Success` | copy the payload out |
//! | `Error` | fail |
//!
//! The driver lock is held for one poll at a time, never across the sleep,
//! so the cyclic thread keeps its period.

use crate::session::SharedDomain;
use ecat_common::consts::DEFAULT_REQUEST_TIMEOUT_MS;
use ecat_common::driver::{DriverError, MasterDriver, RequestHandle, RequestState};
use ecat_common::state::AlState;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Transfer direction of an object request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDirection {
    /// Upload from the device.
    Read,
    /// Download to the device.
    Write(ObjectValue),
}

/// Payload of an object request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ObjectValue {
    /// Typed value for sizes 1, 2 and 4.
    Int(u32),
    /// Raw bytes for every other size.
    Bytes(Vec<u8>),
}

impl ObjectValue {
    /// Decode `bytes` (little-endian) as a request of `size` bytes.
    pub fn from_payload(size: usize, bytes: &[u8]) -> Self {
        match size {
            1 | 2 | 4 if bytes.len() >= size => {
                let mut raw = [0u8; 4];
                raw[..size].copy_from_slice(&bytes[..size]);
                Self::Int(u32::from_le_bytes(raw))
            }
            _ => Self::Bytes(bytes.to_vec()),
        }
    }

    /// Fill `payload` with this value. Typed values are truncated to the
    /// payload size; byte strings copy the common prefix.
    fn fill(&self, payload: &mut [u8]) {
        let bytes = match self {
            Self::Int(v) => v.to_le_bytes().to_vec(),
            Self::Bytes(b) => b.clone(),
        };
        let n = bytes.len().min(payload.len());
        payload[..n].copy_from_slice(&bytes[..n]);
    }
}

/// One object request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRequest {
    pub position: u16,
    pub index: u16,
    pub subindex: u8,
    /// Payload size in bytes.
    pub size: usize,
    pub direction: RequestDirection,
    /// Bound on the time spent waiting for completion.
    pub timeout: Duration,
    /// Log progress at info level instead of debug.
    pub verbose: bool,
}

impl ObjectRequest {
    /// Read of `size` bytes with the default timeout.
    pub fn read(position: u16, index: u16, subindex: u8, size: usize) -> Self {
        Self {
            position,
            index,
            subindex,
            size,
            direction: RequestDirection::Read,
            timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            verbose: false,
        }
    }

    /// Write of `value` as `size` bytes with the default timeout.
    pub fn write(position: u16, index: u16, subindex: u8, size: usize, value: ObjectValue) -> Self {
        Self {
            direction: RequestDirection::Write(value),
            ..Self::read(position, index, subindex, size)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn is_write(&self) -> bool {
        matches!(self.direction, RequestDirection::Write(_))
    }
}

/// Object request failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No configured device at this position, or no session.
    #[error("Unknown device at position {position}")]
    UnknownDevice { position: u16 },

    /// The device has not left INIT; requests would never complete.
    #[error("Device {position} not past initialization (state {state})")]
    NotInitialized { position: u16, state: AlState },

    /// The driver refused to create the request.
    #[error("Request creation failed: {0}")]
    CreateFailed(DriverError),

    /// Still busy when the timeout expired.
    #[error("Request {position}:0x{index:04x}:{subindex:02x} timed out after {timeout:?}")]
    Timeout {
        position: u16,
        index: u16,
        subindex: u8,
        timeout: Duration,
    },

    /// The driver reported an error.
    #[error("Request {position}:0x{index:04x}:{subindex:02x} failed")]
    Failed {
        position: u16,
        index: u16,
        subindex: u8,
        #[source]
        source: Option<DriverError>,
    },
}

impl RequestError {
    /// Only a timeout may succeed when repeated.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

macro_rules! progress {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose { info!($($arg)+) } else { debug!($($arg)+) }
    };
}

/// Run `request` against the session's driver.
///
/// # Errors
/// See [`RequestError`]. Nothing is sent to the driver when the device is
/// unknown or still in INIT.
pub fn execute(
    shared: &SharedDomain,
    request: &ObjectRequest,
    poll_interval: Duration,
) -> Result<ObjectValue, RequestError> {
    let position = request.position;
    let device = shared
        .device(position)
        .ok_or(RequestError::UnknownDevice { position })?;
    let state = device.state().al_state;
    if !state.accepts_requests() {
        return Err(RequestError::NotInitialized { position, state });
    }
    let handle = device.record().handle;

    progress!(
        request.verbose,
        "Request {position}:0x{:04x}:{:02x} {} ({} bytes)",
        request.index,
        request.subindex,
        if request.is_write() { "write" } else { "read" },
        request.size
    );

    let req = {
        let mut driver = shared.driver();
        let req = driver
            .create_sdo_request(handle, request.index, request.subindex, request.size)
            .map_err(RequestError::CreateFailed)?;
        if let Err(e) = submit(&mut **driver, req, request) {
            driver.release_request(req);
            return Err(failed(request, Some(e)));
        }
        req
    };

    let result = poll(shared, req, request, poll_interval);
    shared.driver().release_request(req);

    match &result {
        Ok(value) => progress!(request.verbose, "Request {position}:0x{:04x}:{:02x} done: {value:?}", request.index, request.subindex),
        Err(e) => warn!("{e}"),
    }
    result
}

/// Copy the write payload (if any) and submit.
fn submit(
    driver: &mut dyn MasterDriver,
    req: RequestHandle,
    request: &ObjectRequest,
) -> Result<(), DriverError> {
    match &request.direction {
        RequestDirection::Read => driver.request_read(req),
        RequestDirection::Write(value) => {
            value.fill(driver.request_data_mut(req)?);
            driver.request_write(req)
        }
    }
}

fn poll(
    shared: &SharedDomain,
    req: RequestHandle,
    request: &ObjectRequest,
    poll_interval: Duration,
) -> Result<ObjectValue, RequestError> {
    let started = Instant::now();
    loop {
        {
            let mut driver = shared.driver();
            let state = driver
                .request_state(req)
                .map_err(|e| failed(request, Some(e)))?;
            match state {
                RequestState::Success => {
                    let data = driver.request_data(req).map_err(|e| failed(request, Some(e)))?;
                    return Ok(ObjectValue::from_payload(request.size, data));
                }
                RequestState::Error => return Err(failed(request, None)),
                RequestState::Unused => {
                    debug!("Request dropped by driver, resubmitting");
                    submit(&mut **driver, req, request).map_err(|e| failed(request, Some(e)))?;
                }
                RequestState::Busy => {}
            }
        }
        if started.elapsed() > request.timeout {
            return Err(RequestError::Timeout {
                position: request.position,
                index: request.index,
                subindex: request.subindex,
                timeout: request.timeout,
            });
        }
        std::thread::sleep(poll_interval);
    }
}

fn failed(request: &ObjectRequest, source: Option<DriverError>) -> RequestError {
    RequestError::Failed {
        position: request.position,
        index: request.index,
        subindex: request.subindex,
        source,
    }
}
