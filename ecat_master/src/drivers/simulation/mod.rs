//! Simulation driver module.
//!
//! This module provides a software fieldbus master for development and
//! testing without physical hardware. Every driver call is journaled into a
//! [`SimulationProbe`] that tests use to inspect the configuration sequence
//! and to steer device states and object requests.

mod bus;
mod config;
mod driver;
mod io;

pub use bus::{DriverCall, SimulationProbe};
pub use config::{EchoLink, FailPoint, ObjectAddress, RequestBehaviour, SimulationConfig};
pub use driver::SimulationDriver;
pub use io::{EchoImage, pack};

use ecat_common::driver::MasterDriver;

/// Factory function to create a simulation driver instance.
pub fn create_driver() -> Box<dyn MasterDriver> {
    Box::new(SimulationDriver::default())
}
