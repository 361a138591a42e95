//! # ECAT Master Library
//!
//! Fieldbus process-data master with a pluggable driver architecture.
//!
//! Drivers implement the `MasterDriver` trait defined in
//! `ecat_common::driver`; everything in this crate talks to the bus through
//! that trait only.
//!
//! # Module Structure
//!
//! - [`core`] - `EcatMaster`, session lifecycle and runtime surface
//! - [`sequencer`] - Device, sync channel and mapping configuration
//! - [`domain`] - Domain registration and the cyclic entry table
//! - [`index`] - (position, index, subindex) → slot lookup
//! - [`cycle`] - Cyclic exchange engine and RT setup
//! - [`request`] - Object request state machine
//! - [`session`] - State shared between the cyclic thread and callers
//! - [`driver_registry`] - Driver factory registration
//! - [`drivers`] - Driver implementations
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ecat_master                               │
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────────────┐  │
//! │  │  caller     │◄──►│ SharedDomain │◄──►│  cyclic thread      │  │
//! │  │  threads    │    │ (atomics)    │    │  (CycleEngine)      │  │
//! │  └─────────────┘    └──────┬───────┘    └─────────────────────┘  │
//! │                            │                                     │
//! │                            ▼                                     │
//! │                   ┌────────────────┐                             │
//! │                   │ MasterDriver   │ (trait object)              │
//! │                   └────────────────┘                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use ecat_master::{ConfigSource, EcatMaster};
//!
//! let mut master = EcatMaster::simulated();
//! master.load_configuration(ConfigSource::Path("slaves.json".into()), true)?;
//! let session = master.start(|report| {
//!     if report.state_changed {
//!         println!("AL states: {}", report.al_states);
//!     }
//! })?;
//! master.write_by_key(0, 0x7000, 1, 42)?;
//! master.stop();
//! session.wait()?;
//! # Ok::<(), ecat_master::MasterError>(())
//! ```

pub mod core;
pub mod cycle;
pub mod domain;
pub mod driver_registry;
pub mod drivers;
pub mod index;
pub mod request;
pub mod sequencer;
pub mod session;

// Re-export key types for convenience
pub use crate::core::{ConfigSource, EcatMaster, MasterError, SessionHandle};
pub use crate::cycle::{CycleReport, CycleStats};
pub use crate::domain::{EntryError, EntrySnapshot, EntryValue};
pub use crate::driver_registry::{DriverRegistry, RegistryError};
pub use crate::request::{ObjectRequest, ObjectValue, RequestDirection, RequestError};
pub use crate::sequencer::{BringUpError, BringUpStep};
pub use crate::session::{CycleState, DeviceStatus};
